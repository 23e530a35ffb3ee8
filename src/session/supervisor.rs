//! Reconnect supervision for account sessions.
//!
//! The coordinator hands over every session whose transport closed; the
//! supervisor either gives up immediately (terminal reason) or retries in the
//! background with capped exponential backoff and reports the result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CopyError;
use crate::events::{AuditKind, EventBus};
use crate::models::{AccountId, Credential, Role};
use crate::transport::Transport;

use super::connection::{SessionFactory, SessionHandle};

/// Reconnect bookkeeping for one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Capped exponential backoff: `min(base * 2^failures, max)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Failures tolerated before giving up
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures > self.max_attempts
    }
}

/// What the supervisor decided for a closed session.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    Scheduled { delay: Duration },
    Terminal,
    Exhausted,
}

/// Outcome of a background retry, delivered to the coordinator.
pub enum SupervisorReport {
    Restored {
        generation: u64,
        role: Role,
        handle: SessionHandle,
    },
    Abandoned {
        generation: u64,
        account: AccountId,
        role: Role,
        reason: String,
        exhausted: bool,
    },
}

pub struct SessionSupervisor<T> {
    factory: SessionFactory<T>,
    policy: RetryPolicy,
    bus: EventBus,
    health: Arc<RwLock<HashMap<AccountId, SessionHealth>>>,
    reports: mpsc::Sender<SupervisorReport>,
    retries: JoinSet<()>,
    cancel: CancellationToken,
    generation: u64,
}

impl<T: Transport> SessionSupervisor<T> {
    pub fn new(
        factory: SessionFactory<T>,
        policy: RetryPolicy,
        bus: EventBus,
        reports: mpsc::Sender<SupervisorReport>,
    ) -> Self {
        Self {
            factory,
            policy,
            bus,
            health: Arc::new(RwLock::new(HashMap::new())),
            reports,
            retries: JoinSet::new(),
            cancel: CancellationToken::new(),
            generation: 0,
        }
    }

    /// Reports carrying an older generation belong to a previous copying
    /// session and must be discarded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancel outstanding retries and forget all health records.
    pub async fn reset(&mut self) {
        self.cancel_all();
        self.health.write().await.clear();
    }

    pub fn cancel_all(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.retries.abort_all();
        self.generation += 1;
    }

    /// Start tracking an account that just authorized.
    pub async fn register(&mut self, account: &AccountId) {
        self.health
            .write()
            .await
            .insert(account.clone(), SessionHealth::default());
    }

    /// Current health of every tracked account.
    pub fn health(&self) -> impl Future<Output = HashMap<AccountId, SessionHealth>> + Send + 'static {
        let health = self.health.clone();
        async move { health.read().await.clone() }
    }

    /// Record a closure and decide whether to retry it.
    pub async fn schedule(
        &mut self,
        account: AccountId,
        credential: Credential,
        role: Role,
        reason: CopyError,
    ) -> Recovery {
        // Drop finished retry tasks
        while self.retries.try_join_next().is_some() {}

        let failures = {
            let mut health = self.health.write().await;
            let entry = health.entry(account.clone()).or_default();
            entry.consecutive_failures += 1;
            entry.last_error = Some(reason.to_string());
            entry.next_retry_at = None;
            entry.consecutive_failures
        };

        if !reason.is_retryable() {
            warn!(account = %account, role = %role, error = %reason, "Failure is not retryable");
            return Recovery::Terminal;
        }
        if self.policy.exhausted(failures) {
            warn!(account = %account, role = %role, failures, "Retry budget exhausted");
            return Recovery::Exhausted;
        }

        let delay = self.policy.delay_for(failures);
        self.retries.spawn(retry_loop(RetryJob {
            factory: self.factory.clone(),
            policy: self.policy,
            bus: self.bus.clone(),
            health: self.health.clone(),
            reports: self.reports.clone(),
            cancel: self.cancel.clone(),
            generation: self.generation,
            account,
            credential,
            role,
        }));

        Recovery::Scheduled { delay }
    }
}

struct RetryJob<T> {
    factory: SessionFactory<T>,
    policy: RetryPolicy,
    bus: EventBus,
    health: Arc<RwLock<HashMap<AccountId, SessionHealth>>>,
    reports: mpsc::Sender<SupervisorReport>,
    cancel: CancellationToken,
    generation: u64,
    account: AccountId,
    credential: Credential,
    role: Role,
}

async fn retry_loop<T: Transport>(job: RetryJob<T>) {
    loop {
        let failures = job
            .health
            .read()
            .await
            .get(&job.account)
            .map(|h| h.consecutive_failures)
            .unwrap_or(1);

        let delay = job.policy.delay_for(failures);
        let retry_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        if let Some(entry) = job.health.write().await.get_mut(&job.account) {
            entry.next_retry_at = Some(retry_at);
        }

        job.bus.publish(AuditKind::RetryScheduled {
            account: job.account.clone(),
            attempt: failures,
            delay_ms: delay.as_millis() as u64,
        });
        info!(account = %job.account, attempt = failures, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

        tokio::select! {
            () = job.cancel.cancelled() => {
                debug!(account = %job.account, "Retry cancelled");
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }

        let opened = job
            .factory
            .open(job.account.clone(), job.credential.clone(), job.role)
            .await;

        match opened {
            Ok(handle) => {
                if let Some(entry) = job.health.write().await.get_mut(&job.account) {
                    *entry = SessionHealth::default();
                }
                info!(account = %job.account, role = %job.role, "Session restored");
                let _ = job
                    .reports
                    .send(SupervisorReport::Restored {
                        generation: job.generation,
                        role: job.role,
                        handle,
                    })
                    .await;
                return;
            }
            Err(e) => {
                let failures = {
                    let mut health = job.health.write().await;
                    let entry = health.entry(job.account.clone()).or_default();
                    entry.consecutive_failures += 1;
                    entry.last_error = Some(e.to_string());
                    entry.next_retry_at = None;
                    entry.consecutive_failures
                };

                let exhausted = job.policy.exhausted(failures);
                if !e.is_retryable() || exhausted {
                    warn!(account = %job.account, error = %e, failures, "Giving up on session");
                    let _ = job
                        .reports
                        .send(SupervisorReport::Abandoned {
                            generation: job.generation,
                            account: job.account.clone(),
                            role: job.role,
                            reason: e.to_string(),
                            exhausted,
                        })
                        .await;
                    return;
                }

                warn!(account = %job.account, error = %e, failures, "Reconnect attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::transport::memory::{AccountScript, MemoryTransport};

    const FOLLOWER: &str = "follower-token-001";

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    fn supervisor(
        transport: &MemoryTransport,
    ) -> (SessionSupervisor<MemoryTransport>, mpsc::Receiver<SupervisorReport>) {
        let (events_tx, _events_rx) = mpsc::channel(64);
        let factory = SessionFactory::new(
            Arc::new(transport.clone()),
            SessionConfig {
                auth_timeout: Duration::from_secs(1),
                command_capacity: 8,
            },
            events_tx,
        );
        let (reports_tx, reports_rx) = mpsc::channel(8);
        (
            SessionSupervisor::new(factory, policy(), EventBus::new(64), reports_tx),
            reports_rx,
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(64), Duration::from_secs(30));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_reason_is_not_retried() {
        let transport = MemoryTransport::new();
        transport.script(FOLLOWER, AccountScript::follower());
        let (mut supervisor, _reports) = supervisor(&transport);

        let recovery = supervisor
            .schedule(
                AccountId::new("f1"),
                Credential::parse(FOLLOWER).unwrap(),
                Role::Follower,
                CopyError::InsufficientScope("trade".into()),
            )
            .await;
        assert_eq!(recovery, Recovery::Terminal);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(FOLLOWER), 0);
        let health = supervisor.health().await;
        assert_eq!(health[&AccountId::new("f1")].consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_close_is_not_retried() {
        let transport = MemoryTransport::new();
        transport.script(FOLLOWER, AccountScript::follower());
        let (mut supervisor, _reports) = supervisor(&transport);

        let recovery = supervisor
            .schedule(
                AccountId::new("f1"),
                Credential::parse(FOLLOWER).unwrap(),
                Role::Follower,
                CopyError::Cancelled("link closed locally".into()),
            )
            .await;
        assert_eq!(recovery, Recovery::Terminal);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(FOLLOWER), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_restored() {
        let transport = MemoryTransport::new();
        transport.script(FOLLOWER, AccountScript::follower());
        let (mut supervisor, mut reports) = supervisor(&transport);
        supervisor.register(&AccountId::new("f1")).await;

        let recovery = supervisor
            .schedule(
                AccountId::new("f1"),
                Credential::parse(FOLLOWER).unwrap(),
                Role::Follower,
                CopyError::Transport("reset".into()),
            )
            .await;
        assert_eq!(
            recovery,
            Recovery::Scheduled {
                delay: Duration::from_secs(1)
            }
        );

        match reports.recv().await.unwrap() {
            SupervisorReport::Restored { handle, generation, .. } => {
                assert_eq!(generation, supervisor.generation());
                assert_eq!(handle.account(), &AccountId::new("f1"));
            }
            SupervisorReport::Abandoned { reason, .. } => panic!("abandoned: {}", reason),
        }
        assert_eq!(transport.opens(FOLLOWER), 1);
        assert_eq!(
            supervisor.health().await[&AccountId::new("f1")],
            SessionHealth::default()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_is_abandoned() {
        let transport = MemoryTransport::new();
        let mut script = AccountScript::follower();
        script.fail_open = true;
        transport.script(FOLLOWER, script);
        let (mut supervisor, mut reports) = supervisor(&transport);

        supervisor
            .schedule(
                AccountId::new("f1"),
                Credential::parse(FOLLOWER).unwrap(),
                Role::Follower,
                CopyError::Transport("reset".into()),
            )
            .await;

        match reports.recv().await.unwrap() {
            SupervisorReport::Abandoned { exhausted, .. } => assert!(exhausted),
            SupervisorReport::Restored { .. } => panic!("should not reconnect"),
        }
        // First failure came from the closure, then three reopen attempts
        assert_eq!(transport.opens(FOLLOWER), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_retries() {
        let transport = MemoryTransport::new();
        transport.script(FOLLOWER, AccountScript::follower());
        let (mut supervisor, mut reports) = supervisor(&transport);

        supervisor
            .schedule(
                AccountId::new("f1"),
                Credential::parse(FOLLOWER).unwrap(),
                Role::Follower,
                CopyError::Transport("reset".into()),
            )
            .await;
        let before = supervisor.generation();
        supervisor.reset().await;
        assert!(supervisor.generation() > before);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(FOLLOWER), 0);
        assert!(reports.try_recv().is_err());
        assert!(supervisor.health().await.is_empty());
    }
}
