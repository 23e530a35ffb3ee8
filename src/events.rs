//! Append-only audit stream of engine activity.
//!
//! Every lifecycle change and routing decision is published here with a
//! timestamp and a monotonically increasing sequence number. Dashboards and
//! loggers subscribe; nothing on this stream carries a raw credential.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{AccountId, Role};
use crate::trading::CopyState;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AuditKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditKind {
    StateChanged {
        from: CopyState,
        to: CopyState,
    },
    SessionAuthorized {
        account: AccountId,
        role: Role,
        scopes: Vec<String>,
    },
    SessionClosed {
        account: AccountId,
        role: Role,
        reason: String,
    },
    SessionDegraded {
        account: AccountId,
        reason: String,
        permanent: bool,
    },
    RetryScheduled {
        account: AccountId,
        attempt: u32,
        delay_ms: u64,
    },
    SessionRestored {
        account: AccountId,
    },
    TradeObserved {
        trade_id: String,
        symbol: String,
        action: String,
        amount: Decimal,
    },
    DuplicateTrade {
        trade_id: String,
    },
    OrderSent {
        trade_id: String,
        follower: AccountId,
        amount: Option<Decimal>,
        reference: Option<String>,
    },
    OrderSuppressed {
        trade_id: String,
        follower: AccountId,
        reason: String,
    },
    OrderFailed {
        trade_id: String,
        follower: AccountId,
        reason: String,
    },
    LateAck {
        follower: AccountId,
        request_id: u64,
        status: String,
    },
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditKind::StateChanged { from, to } => write!(f, "state {} -> {}", from, to),
            AuditKind::SessionAuthorized {
                account,
                role,
                scopes,
            } => write!(f, "{} ({}) authorized [{}]", account, role, scopes.join(",")),
            AuditKind::SessionClosed {
                account, reason, ..
            } => write!(f, "{} disconnected: {}", account, reason),
            AuditKind::SessionDegraded {
                account,
                reason,
                permanent,
            } => write!(
                f,
                "{} degraded{}: {}",
                account,
                if *permanent { " permanently" } else { "" },
                reason
            ),
            AuditKind::RetryScheduled {
                account,
                attempt,
                delay_ms,
            } => write!(f, "{} retry #{} in {}ms", account, attempt, delay_ms),
            AuditKind::SessionRestored { account } => write!(f, "{} reconnected", account),
            AuditKind::TradeObserved {
                trade_id,
                symbol,
                action,
                amount,
            } => write!(f, "trade {} {} {} {}", trade_id, action, symbol, amount),
            AuditKind::DuplicateTrade { trade_id } => write!(f, "trade {} already handled", trade_id),
            AuditKind::OrderSent {
                trade_id,
                follower,
                amount,
                reference,
            } => write!(
                f,
                "trade {} -> {} sent {} ({})",
                trade_id,
                follower,
                amount.map(|a| a.to_string()).unwrap_or_default(),
                reference.as_deref().unwrap_or("-")
            ),
            AuditKind::OrderSuppressed {
                trade_id,
                follower,
                reason,
            } => write!(f, "trade {} -> {} suppressed: {}", trade_id, follower, reason),
            AuditKind::OrderFailed {
                trade_id,
                follower,
                reason,
            } => write!(f, "trade {} -> {} failed: {}", trade_id, follower, reason),
            AuditKind::LateAck {
                follower,
                request_id,
                status,
            } => write!(
                f,
                "late ack from {} for request {}: {}",
                follower, request_id, status
            ),
        }
    }
}

/// Broadcast publisher for [`AuditEvent`]s.
///
/// Slow subscribers lag and skip rather than backpressuring the engine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AuditEvent>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: AuditKind) {
        let event = AuditEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            at: Utc::now(),
            kind,
        };
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_sequenced() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(AuditKind::DuplicateTrade {
            trade_id: "t1".into(),
        });
        bus.publish(AuditKind::SessionRestored {
            account: AccountId::new("f1"),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert!(second.at >= first.at);
    }

    #[test]
    fn test_serializes_with_event_tag() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(AuditKind::OrderSuppressed {
            trade_id: "t9".into(),
            follower: AccountId::new("f2"),
            reason: "symbol filtered".into(),
        });

        let event = rx.try_recv().unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "order_suppressed");
        assert_eq!(json["follower"], "f2");
        assert_eq!(json["seq"], 1);
    }
}
