//! Per-(trade, follower) replication outcomes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AccountId;

/// Result of mirroring one trade to one follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReplicationOutcome {
    /// Order handed to the follower session, ack not yet received
    Pending,
    Sent { reference: Option<String> },
    Suppressed { reason: String },
    Failed { reason: String },
}

impl ReplicationOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            ReplicationOutcome::Pending => "pending",
            ReplicationOutcome::Sent { .. } => "sent",
            ReplicationOutcome::Suppressed { .. } => "suppressed",
            ReplicationOutcome::Failed { .. } => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ReplicationOutcome::Suppressed { reason } | ReplicationOutcome::Failed { reason } => {
                Some(reason)
            }
            _ => None,
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            ReplicationOutcome::Sent { reference } => reference.as_deref(),
            _ => None,
        }
    }

    /// Rebuild from the flattened columns used by the outcome log table.
    pub fn from_parts(
        status: &str,
        reason: Option<String>,
        reference: Option<String>,
    ) -> Option<Self> {
        let reason = reason.unwrap_or_default();
        match status {
            "pending" => Some(ReplicationOutcome::Pending),
            "sent" => Some(ReplicationOutcome::Sent { reference }),
            "suppressed" => Some(ReplicationOutcome::Suppressed { reason }),
            "failed" => Some(ReplicationOutcome::Failed { reason }),
            _ => None,
        }
    }
}

/// One outcome record, as appended to the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEntry {
    pub session_id: Uuid,
    pub trade_id: String,
    pub follower: AccountId,
    pub outcome: ReplicationOutcome,
    /// Stake sent (or that would have been sent)
    pub amount: Option<Decimal>,
    pub recorded_at: DateTime<Utc>,
}

/// Counts by outcome status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeTally {
    pub pending: usize,
    pub sent: usize,
    pub suppressed: usize,
    pub failed: usize,
}

impl OutcomeTally {
    pub fn total(&self) -> usize {
        self.pending + self.sent + self.suppressed + self.failed
    }
}

/// Latest outcome per (trade, follower), in first-seen order.
///
/// Folding an append-only history through [`OutcomeLog::record`] yields the
/// same state as the live log, which is how resumed sessions rebuild their
/// idempotency set.
#[derive(Debug, Clone, Default)]
pub struct OutcomeLog {
    entries: Vec<OutcomeEntry>,
    index: HashMap<(String, AccountId), usize>,
}

impl OutcomeLog {
    pub fn from_entries(entries: impl IntoIterator<Item = OutcomeEntry>) -> Self {
        let mut log = Self::default();
        for entry in entries {
            log.record(entry);
        }
        log
    }

    /// Insert or replace the outcome for the entry's (trade, follower) pair.
    pub fn record(&mut self, entry: OutcomeEntry) {
        let key = (entry.trade_id.clone(), entry.follower.clone());
        match self.index.get(&key) {
            Some(&pos) => self.entries[pos] = entry,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn contains(&self, trade_id: &str, follower: &AccountId) -> bool {
        self.get(trade_id, follower).is_some()
    }

    pub fn get(&self, trade_id: &str, follower: &AccountId) -> Option<&OutcomeEntry> {
        self.index
            .get(&(trade_id.to_string(), follower.clone()))
            .map(|&pos| &self.entries[pos])
    }

    pub fn entries(&self) -> &[OutcomeEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<OutcomeEntry> {
        self.entries
    }

    pub fn trade_ids(&self) -> HashSet<String> {
        self.entries.iter().map(|e| e.trade_id.clone()).collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &OutcomeEntry> {
        self.entries
            .iter()
            .filter(|e| e.outcome == ReplicationOutcome::Pending)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tally(&self) -> OutcomeTally {
        let mut tally = OutcomeTally::default();
        for entry in &self.entries {
            match entry.outcome {
                ReplicationOutcome::Pending => tally.pending += 1,
                ReplicationOutcome::Sent { .. } => tally.sent += 1,
                ReplicationOutcome::Suppressed { .. } => tally.suppressed += 1,
                ReplicationOutcome::Failed { .. } => tally.failed += 1,
            }
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(trade: &str, follower: &str, outcome: ReplicationOutcome) -> OutcomeEntry {
        OutcomeEntry {
            session_id: Uuid::nil(),
            trade_id: trade.to_string(),
            follower: AccountId::new(follower),
            outcome,
            amount: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_fold_keeps_latest_per_pair() {
        let log = OutcomeLog::from_entries(vec![
            entry("t1", "f1", ReplicationOutcome::Pending),
            entry("t1", "f2", ReplicationOutcome::Pending),
            entry(
                "t1",
                "f1",
                ReplicationOutcome::Sent {
                    reference: Some("c-1".into()),
                },
            ),
        ]);

        assert_eq!(log.len(), 2);
        let first = log.get("t1", &AccountId::new("f1")).unwrap();
        assert_eq!(first.outcome.status(), "sent");
        assert_eq!(log.entries()[0].follower, AccountId::new("f1"));

        let tally = log.tally();
        assert_eq!(tally.sent, 1);
        assert_eq!(tally.pending, 1);
        assert_eq!(log.pending().count(), 1);
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(
            ReplicationOutcome::from_parts("failed", Some("timeout".into()), None),
            Some(ReplicationOutcome::Failed {
                reason: "timeout".into()
            })
        );
        assert_eq!(ReplicationOutcome::from_parts("weird", None, None), None);
    }
}
