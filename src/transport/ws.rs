//! WebSocket protocol adapter.
//!
//! Speaks a JSON request/response protocol over a single socket per account:
//! - `{"authorize": "<token>"}` answered by `msg_type: "authorize"` with scopes
//! - `{"transaction": 1, "subscribe": 1}` streaming `msg_type: "transaction"`
//! - stake-basis `{"buy": 1, ...}` requests correlated through `req_id`
//! - `{"ping": 1}` keepalive so idle sockets are not dropped by the server

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CopyError, CopyResult};
use crate::models::{venue_stake, Credential, TradeAction, TradeEvent};

use super::{CloseReason, InboundMessage, OrderStatus, OutboundMessage, Transport, TransportLink};

pub const DEFAULT_WS_URL: &str = "wss://ws.derivws.com/websockets/v3?app_id=72379";

/// Configuration for the WebSocket adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsTransportConfig {
    pub url: String,

    /// TCP + TLS + upgrade must finish within this
    pub connect_timeout_ms: u64,

    /// Keepalive interval
    pub ping_interval_secs: u64,

    /// Buffer size of the inbound and outbound channels
    pub channel_capacity: usize,

    /// Used for orders until the authorize response reports the account currency
    pub default_currency: String,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            connect_timeout_ms: 10_000,
            ping_interval_secs: 30,
            channel_capacity: 256,
            default_currency: "USD".to_string(),
        }
    }
}

/// [`Transport`] over tokio-tungstenite.
pub struct WsTransport {
    config: WsTransportConfig,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, credential: &Credential) -> CopyResult<TransportLink> {
        info!(url = %self.config.url, credential = %credential, "Connecting to WebSocket");

        let connect = connect_async(self.config.url.as_str());
        let (stream, _response) =
            tokio::time::timeout(Duration::from_millis(self.config.connect_timeout_ms), connect)
                .await
                .map_err(|_| CopyError::Timeout(format!("connecting to {}", self.config.url)))??;

        let (out_tx, out_rx) = mpsc::channel(self.config.channel_capacity);
        let (in_tx, in_rx) = mpsc::channel(self.config.channel_capacity);
        let shutdown = CancellationToken::new();

        let io = tokio::spawn(run_link(
            stream,
            out_rx,
            in_tx,
            shutdown.clone(),
            WireCodec::new(&self.config.default_currency),
            Duration::from_secs(self.config.ping_interval_secs.max(1)),
        ));

        debug!("WebSocket connected");
        Ok(TransportLink::new(out_tx, in_rx, shutdown, Some(io)))
    }
}

/// Socket pump: outbound channel -> frames, frames -> inbound channel.
async fn run_link(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown: CancellationToken,
    mut codec: WireCodec,
    ping_every: Duration,
) {
    let (mut write, mut read) = stream.split();
    let mut ping = tokio::time::interval(ping_every);
    ping.tick().await;

    let reason = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!(error = %e, "Failed to send close frame");
                }
                break CloseReason::Local;
            }

            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    let _ = write.send(Message::Close(None)).await;
                    break CloseReason::Local;
                };
                if let Err(e) = write.send(Message::Text(codec.encode(&msg))).await {
                    break CloseReason::Transport(e.to_string());
                }
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match codec.decode(&text) {
                            Some(InboundMessage::Closed(reason)) => break reason,
                            Some(message) => {
                                tokio::select! {
                                    sent = inbound.send(message) => {
                                        if sent.is_err() {
                                            break CloseReason::Local;
                                        }
                                    }
                                    () = shutdown.cancelled() => break CloseReason::Local,
                                }
                            }
                            None => {}
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break CloseReason::Transport(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "normal close".to_string());
                        break CloseReason::Remote(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseReason::Transport(e.to_string()),
                    None => break CloseReason::Remote("stream ended".to_string()),
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Text(json!({"ping": 1}).to_string())).await {
                    break CloseReason::Transport(e.to_string());
                }
            }
        }
    };

    debug!(reason = %reason, "WebSocket link finished");
    deliver_close(&inbound, &shutdown, reason).await;
}

/// How long a full inbound buffer may hold up the close notice.
const CLOSE_NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

/// Queue the close reason behind any buffered messages. Gives up once the
/// session closes the link itself or stops reading.
async fn deliver_close(
    inbound: &mpsc::Sender<InboundMessage>,
    shutdown: &CancellationToken,
    reason: CloseReason,
) {
    if reason == CloseReason::Local {
        let _ = inbound.try_send(InboundMessage::Closed(reason));
        return;
    }

    tokio::select! {
        _ = inbound.send(InboundMessage::Closed(reason.clone())) => {}
        () = shutdown.cancelled() => {}
        () = tokio::time::sleep(CLOSE_NOTICE_TIMEOUT) => {
            warn!(reason = %reason, "Session never took the close notice");
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    msg_type: Option<String>,
    req_id: Option<u64>,
    error: Option<ApiError>,
    authorize: Option<AuthorizeBody>,
    transaction: Option<TransactionBody>,
    buy: Option<BuyBody>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AuthorizeBody {
    #[serde(default)]
    scopes: Vec<String>,
    loginid: Option<String>,
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    action: Option<String>,
    amount: Option<f64>,
    symbol: Option<String>,
    transaction_id: Option<u64>,
    transaction_time: Option<i64>,
    purchase_time: Option<i64>,
    date_expiry: Option<i64>,
    contract_type: Option<String>,
    duration: Option<u32>,
    duration_unit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuyBody {
    contract_id: Option<u64>,
    transaction_id: Option<u64>,
}

/// JSON encoding and decoding for one link.
///
/// Stateful only in the account currency learned from the authorize reply.
#[derive(Debug, Clone)]
pub struct WireCodec {
    currency: String,
}

impl WireCodec {
    pub fn new(default_currency: &str) -> Self {
        Self {
            currency: default_currency.to_string(),
        }
    }

    pub fn encode(&self, message: &OutboundMessage) -> String {
        let value = match message {
            OutboundMessage::Authorize(credential) => json!({ "authorize": credential.expose() }),
            OutboundMessage::SubscribeTransactions => json!({ "transaction": 1, "subscribe": 1 }),
            OutboundMessage::PlaceOrder { request_id, order } => {
                let stake = venue_stake(order.amount).to_f64().unwrap_or(0.0);
                json!({
                    "buy": 1,
                    "price": stake,
                    "parameters": {
                        "amount": stake,
                        "basis": order.basis.as_str(),
                        "contract_type": order.contract_type,
                        "currency": self.currency,
                        "duration": order.duration,
                        "duration_unit": order.duration_unit,
                        "symbol": order.symbol,
                    },
                    "passthrough": { "action": order.action.as_str() },
                    "req_id": request_id,
                })
            }
        };
        value.to_string()
    }

    /// Map one text frame to an inbound message. `None` means "nothing to
    /// forward" (keepalive replies).
    pub fn decode(&mut self, text: &str) -> Option<InboundMessage> {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => return Some(InboundMessage::Unrecognized(format!("malformed payload: {}", e))),
        };
        let msg_type = envelope.msg_type.as_deref().unwrap_or_default();

        if let Some(error) = envelope.error {
            return Some(self.decode_error(msg_type, envelope.req_id, error));
        }

        match msg_type {
            "authorize" => {
                let Some(body) = envelope.authorize else {
                    return Some(InboundMessage::Unrecognized("authorize without body".to_string()));
                };
                if let Some(currency) = body.currency.as_deref().filter(|c| !c.is_empty()) {
                    self.currency = currency.to_string();
                }
                Some(InboundMessage::Authorized {
                    scopes: body.scopes,
                    login_id: body.loginid,
                    currency: body.currency,
                })
            }
            "transaction" => match envelope.transaction {
                // Subscription confirmations carry an empty transaction object
                Some(body) if body.transaction_id.is_some() => Some(decode_transaction(body)),
                _ => None,
            },
            "buy" => {
                let Some(request_id) = envelope.req_id else {
                    return Some(InboundMessage::Unrecognized("buy reply without req_id".to_string()));
                };
                let reference = envelope
                    .buy
                    .and_then(|b| b.contract_id.or(b.transaction_id))
                    .map(|id| id.to_string());
                Some(InboundMessage::OrderAck {
                    request_id,
                    status: OrderStatus::Accepted { reference },
                })
            }
            "ping" | "pong" => None,
            other => Some(InboundMessage::Unrecognized(format!("unexpected msg_type '{}'", other))),
        }
    }

    fn decode_error(&self, msg_type: &str, req_id: Option<u64>, error: ApiError) -> InboundMessage {
        let detail = format!("{}: {}", error.code, error.message);

        if msg_type == "authorize" {
            return InboundMessage::AuthRejected { reason: detail };
        }

        match error.code.as_str() {
            "InvalidToken" | "AuthorizationRequired" => {
                InboundMessage::Closed(CloseReason::AuthRevoked(detail))
            }
            "PermissionDenied" => InboundMessage::Closed(CloseReason::InsufficientScope(detail)),
            _ => match (msg_type, req_id) {
                ("buy", Some(request_id)) => InboundMessage::OrderAck {
                    request_id,
                    status: OrderStatus::Rejected { reason: detail },
                },
                _ => InboundMessage::Unrecognized(format!("error reply to '{}': {}", msg_type, detail)),
            },
        }
    }
}

fn decode_transaction(body: TransactionBody) -> InboundMessage {
    let id = body
        .transaction_id
        .map(|id| id.to_string())
        .unwrap_or_default();

    let Some(action) = body.action else {
        return InboundMessage::Unrecognized(format!("transaction {} without action", id));
    };
    let Some(symbol) = body.symbol.filter(|s| !s.is_empty()) else {
        return InboundMessage::Unrecognized(format!("transaction {} without symbol", id));
    };
    let Some(contract_type) = body.contract_type else {
        warn!(trade_id = %id, "Transaction lacks contract details, not mirrorable");
        return InboundMessage::Unrecognized(format!("transaction {} lacks contract details", id));
    };

    let (duration, duration_unit) = match (body.duration, body.duration_unit) {
        (Some(d), Some(unit)) => (d, unit),
        _ => match (body.purchase_time, body.date_expiry) {
            (Some(start), Some(end)) if end > start => {
                (u32::try_from(end - start).unwrap_or(u32::MAX), "s".to_string())
            }
            _ => {
                return InboundMessage::Unrecognized(format!(
                    "transaction {} lacks duration",
                    id
                ))
            }
        },
    };

    // Purchases are reported as debits
    let amount = body
        .amount
        .and_then(|a| Decimal::try_from(a).ok())
        .map(|a| a.abs())
        .unwrap_or(Decimal::ZERO);

    let timestamp = body
        .transaction_time
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
        .unwrap_or_else(Utc::now);

    InboundMessage::Transaction(TradeEvent {
        id,
        timestamp,
        action: TradeAction::from(action.as_str()),
        symbol,
        amount,
        contract_type,
        duration,
        duration_unit,
    })
}
