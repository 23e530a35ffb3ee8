//! Transport boundary between the engine and a brokerage protocol adapter.
//!
//! An adapter turns a credential into a [`TransportLink`]: a channel pair
//! carrying typed [`OutboundMessage`]s out and [`InboundMessage`]s in, plus a
//! background IO task that the link owns. The engine never sees wire frames.

#[cfg(test)]
pub mod memory;
mod ws;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CopyError, CopyResult};
use crate::models::{Credential, Order, TradeEvent};

pub use ws::{WsTransport, WsTransportConfig, DEFAULT_WS_URL};

/// Messages the engine sends to the remote side.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Authorize(Credential),
    /// Start streaming the account's transactions
    SubscribeTransactions,
    PlaceOrder { request_id: u64, order: Order },
}

/// Messages decoded from the remote side.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Authorized {
        scopes: Vec<String>,
        login_id: Option<String>,
        currency: Option<String>,
    },
    AuthRejected {
        reason: String,
    },
    Transaction(TradeEvent),
    OrderAck {
        request_id: u64,
        status: OrderStatus,
    },
    /// The link is gone. Always the last message on a link.
    Closed(CloseReason),
    /// Payload the adapter could not map; sessions log and drop it
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Accepted { reference: Option<String> },
    Rejected { reason: String },
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Accepted { reference } => {
                write!(f, "accepted ({})", reference.as_deref().unwrap_or("-"))
            }
            OrderStatus::Rejected { reason } => write!(f, "rejected: {}", reason),
        }
    }
}

/// Why a link closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection or the stream ended
    Remote(String),
    /// Network or protocol failure
    Transport(String),
    /// Credential lost a required permission
    InsufficientScope(String),
    /// Credential is no longer valid
    AuthRevoked(String),
    /// We closed it
    Local,
}

impl CloseReason {
    /// Terminal closures must not be retried: the credential is unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CloseReason::InsufficientScope(_) | CloseReason::AuthRevoked(_)
        )
    }

    pub fn into_error(self) -> CopyError {
        match self {
            CloseReason::InsufficientScope(msg) => CopyError::InsufficientScope(msg),
            CloseReason::AuthRevoked(msg) => CopyError::Auth(msg),
            CloseReason::Local => CopyError::Cancelled("link closed locally".to_string()),
            other => CopyError::Transport(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Remote(msg) => write!(f, "closed by remote: {}", msg),
            CloseReason::Transport(msg) => write!(f, "transport failure: {}", msg),
            CloseReason::InsufficientScope(msg) => write!(f, "insufficient scope: {}", msg),
            CloseReason::AuthRevoked(msg) => write!(f, "authorization revoked: {}", msg),
            CloseReason::Local => f.write_str("closed locally"),
        }
    }
}

/// One open connection handed out by a [`Transport`].
///
/// Dropping the link cancels its IO task.
pub struct TransportLink {
    outbound: mpsc::Sender<OutboundMessage>,
    inbound: mpsc::Receiver<InboundMessage>,
    shutdown: CancellationToken,
    io: Option<JoinHandle<()>>,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::Sender<OutboundMessage>,
        inbound: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
        io: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            shutdown,
            io,
        }
    }

    pub async fn send(&self, message: OutboundMessage) -> CopyResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(CopyError::Transport("link is closed".to_string()));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| CopyError::Transport("link is closed".to_string()))
    }

    /// Next inbound message; `None` once the adapter has gone away.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }

    /// Signal the IO task to close and wait for it to finish.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(io) = self.io.take() {
            let _ = io.await;
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A protocol adapter able to open authenticated links.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a raw link for `credential`. Authorization is driven by the
    /// session over the returned link.
    async fn open(&self, credential: &Credential) -> CopyResult<TransportLink>;
}
