//! Scripted in-process transport for driving sessions without a network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CopyError, CopyResult};
use crate::models::{Credential, Order, TradeEvent};

use super::{CloseReason, InboundMessage, OrderStatus, OutboundMessage, Transport, TransportLink};

/// How the fake broker answers order requests.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderBehavior {
    Accept,
    Reject(String),
    /// Never answer
    Hang,
    /// Drop the link with the given reason instead of answering
    Close(CloseReason),
}

#[derive(Debug, Clone)]
pub struct AccountScript {
    pub scopes: Vec<String>,
    pub reject_auth: bool,
    pub fail_open: bool,
    /// Keep the link open when asked to close
    pub ignore_close: bool,
    pub orders: OrderBehavior,
}

impl AccountScript {
    pub fn master() -> Self {
        Self {
            scopes: vec!["read".into()],
            reject_auth: false,
            fail_open: false,
            ignore_close: false,
            orders: OrderBehavior::Accept,
        }
    }

    pub fn follower() -> Self {
        Self {
            scopes: vec!["read".into(), "trade".into()],
            ..Self::master()
        }
    }

    pub fn with_orders(mut self, orders: OrderBehavior) -> Self {
        self.orders = orders;
        self
    }
}

#[derive(Default)]
struct Account {
    script: Option<AccountScript>,
    opens: usize,
    placed: Vec<Order>,
    feed: Option<mpsc::Sender<InboundMessage>>,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    accounts: Arc<Mutex<HashMap<String, Account>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the behavior for a token.
    pub fn script(&self, token: &str, script: AccountScript) {
        let mut accounts = self.accounts.lock().unwrap();
        accounts.entry(token.to_string()).or_default().script = Some(script);
    }

    pub fn opens(&self, token: &str) -> usize {
        let accounts = self.accounts.lock().unwrap();
        accounts.get(token).map(|a| a.opens).unwrap_or(0)
    }

    pub fn placed(&self, token: &str) -> Vec<Order> {
        let accounts = self.accounts.lock().unwrap();
        accounts
            .get(token)
            .map(|a| a.placed.clone())
            .unwrap_or_default()
    }

    /// Push a message into the account's current link.
    pub async fn inject(&self, token: &str, message: InboundMessage) {
        let feed = {
            let accounts = self.accounts.lock().unwrap();
            accounts.get(token).and_then(|a| a.feed.clone())
        };
        if let Some(feed) = feed {
            let _ = feed.send(message).await;
        }
    }

    pub async fn emit_trade(&self, token: &str, trade: TradeEvent) {
        self.inject(token, InboundMessage::Transaction(trade)).await;
    }

    /// Simulate the remote side dropping the link.
    pub async fn drop_link(&self, token: &str, reason: CloseReason) {
        self.inject(token, InboundMessage::Closed(reason)).await;
    }

    fn record_order(&self, token: &str, order: Order) {
        let mut accounts = self.accounts.lock().unwrap();
        accounts.entry(token.to_string()).or_default().placed.push(order);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, credential: &Credential) -> CopyResult<TransportLink> {
        let token = credential.expose().to_string();
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundMessage>(64);
        let (in_tx, in_rx) = mpsc::channel::<InboundMessage>(64);

        let script = {
            let mut accounts = self.accounts.lock().unwrap();
            let account = accounts.entry(token.clone()).or_default();
            account.opens += 1;
            let script = account
                .script
                .clone()
                .ok_or_else(|| CopyError::Transport("unknown account".to_string()))?;
            if script.fail_open {
                return Err(CopyError::Transport("connection refused".to_string()));
            }
            account.feed = Some(in_tx.clone());
            script
        };

        let shutdown = CancellationToken::new();
        let token_for_broker = token.clone();
        let broker = self.clone();
        let cancel = shutdown.clone();

        let io = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    () = cancel.cancelled(), if !script.ignore_close => break,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };

                match msg {
                    OutboundMessage::Authorize(_) => {
                        let reply = if script.reject_auth {
                            InboundMessage::AuthRejected {
                                reason: "InvalidToken".to_string(),
                            }
                        } else {
                            InboundMessage::Authorized {
                                scopes: script.scopes.clone(),
                                login_id: None,
                                currency: None,
                            }
                        };
                        let _ = in_tx.send(reply).await;
                    }
                    OutboundMessage::SubscribeTransactions => {}
                    OutboundMessage::PlaceOrder { request_id, order } => {
                        broker.record_order(&token_for_broker, order);
                        let status = match &script.orders {
                            OrderBehavior::Accept => OrderStatus::Accepted {
                                reference: Some(format!("ref-{}", request_id)),
                            },
                            OrderBehavior::Reject(reason) => OrderStatus::Rejected {
                                reason: reason.clone(),
                            },
                            OrderBehavior::Hang => continue,
                            OrderBehavior::Close(reason) => {
                                let _ = in_tx.send(InboundMessage::Closed(reason.clone())).await;
                                break;
                            }
                        };
                        let _ = in_tx
                            .send(InboundMessage::OrderAck { request_id, status })
                            .await;
                    }
                }
            }
        });

        Ok(TransportLink::new(out_tx, in_rx, shutdown, Some(io)))
    }
}
