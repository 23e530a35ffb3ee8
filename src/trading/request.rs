//! Start/stop requests and reports exchanged with the coordinator.

use std::collections::HashSet;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{CopyError, CopyResult};
use crate::models::{AccountId, Credential, ReplicationPolicy};

/// Parameters for starting a copying session.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Raw master token
    pub master: Option<String>,

    /// Raw follower entries, `name=token` or a bare token
    pub followers: Vec<String>,

    /// Policy to copy with; the coordinator's current policy when absent
    pub policy: Option<ReplicationPolicy>,

    /// Continue a previous session, skipping trades it already handled
    pub resume: Option<Uuid>,
}

/// A follower account with its stable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerEntry {
    pub id: AccountId,
    pub credential: Credential,
}

impl FollowerEntry {
    /// Parse `name=token`, or a bare token named `follower-<n>` by position.
    pub fn parse(raw: &str, index: usize) -> CopyResult<Self> {
        let (id, token) = match raw.split_once('=') {
            Some((name, token)) => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(CopyError::Validation(format!(
                        "follower #{} has an empty name",
                        index + 1
                    )));
                }
                (name.to_string(), token)
            }
            None => (format!("follower-{}", index + 1), raw),
        };

        let credential = Credential::parse(token).map_err(|e| within(e, &id))?;
        Ok(Self {
            id: AccountId::new(id),
            credential,
        })
    }
}

/// Inputs that passed validation.
#[derive(Debug, Clone)]
pub(crate) struct ValidatedStart {
    pub master: Credential,
    pub followers: Vec<FollowerEntry>,
    pub policy: ReplicationPolicy,
    pub resume: Option<Uuid>,
}

impl StartRequest {
    pub(crate) fn validate(self, current: &ReplicationPolicy) -> CopyResult<ValidatedStart> {
        let master = match self.master.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => {
                Credential::parse(raw).map_err(|e| within(e, "master"))?
            }
            _ => return Err(CopyError::Validation("master credential is missing".to_string())),
        };

        if self.followers.is_empty() {
            return Err(CopyError::Validation(
                "at least one follower is required".to_string(),
            ));
        }

        let followers = self
            .followers
            .iter()
            .enumerate()
            .map(|(index, raw)| FollowerEntry::parse(raw, index))
            .collect::<CopyResult<Vec<_>>>()?;

        let mut ids = HashSet::new();
        for follower in &followers {
            if follower.id == AccountId::master() {
                return Err(CopyError::Validation(
                    "\"master\" is reserved and cannot name a follower".to_string(),
                ));
            }
            if !ids.insert(&follower.id) {
                return Err(CopyError::Validation(format!(
                    "duplicate follower {}",
                    follower.id
                )));
            }
        }

        let policy = self.policy.unwrap_or_else(|| current.clone());
        policy.validate()?;

        Ok(ValidatedStart {
            master,
            followers,
            policy,
            resume: self.resume,
        })
    }
}

fn within(err: CopyError, what: &str) -> CopyError {
    match err {
        CopyError::Validation(msg) => CopyError::Validation(format!("{}: {}", what, msg)),
        other => other,
    }
}

/// Result of a successful start.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub session_id: Uuid,
    pub authorized: Vec<AccountId>,
    pub degraded: Vec<AccountId>,
    /// Outcomes carried over from a resumed session
    pub resumed_outcomes: usize,
}

/// What `stop()` had to do.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    pub session_id: Option<Uuid>,
    /// In-flight orders that completed during shutdown
    pub drained: usize,
    /// Orders still pending at shutdown, recorded as failed
    pub cancelled: usize,
    pub closed: usize,
    /// Sessions aborted after the shutdown timeout
    pub forced: usize,
}
