//! Replication coordinator: routes master trades to follower sessions.
//!
//! A single task owns all mutable copying state (policy, dedup set, outcome
//! log, session membership) and serializes every change through one select
//! loop. Callers talk to it through a cloneable [`CoordinatorHandle`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::OutcomeStore;
use crate::error::{CopyError, CopyResult};
use crate::events::{AuditEvent, AuditKind, EventBus};
use crate::models::{
    AccountId, Credential, OutcomeEntry, OutcomeLog, OutcomeTally, ReplicationOutcome,
    ReplicationPolicy, Role, TradeEvent,
};
use crate::session::{
    ConnectionState, Recovery, SessionClient, SessionEvent, SessionEventKind, SessionFactory,
    SessionHandle, SessionHealth, SessionSupervisor, SupervisorReport,
};
use crate::transport::{OrderStatus, Transport};

use super::request::{StartReport, StartRequest, StopReport};
use super::stake_sizer::{self, Sizing};
use super::EngineConfig;

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_CANCELLED: &str = "cancelled on stop";
pub const REASON_INTERRUPTED: &str = "interrupted before ack";

/// Lifecycle of the copying session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyState {
    Idle,
    Connecting,
    Active,
    Stopping,
    Error,
}

impl CopyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyState::Idle => "idle",
            CopyState::Connecting => "connecting",
            CopyState::Active => "active",
            CopyState::Stopping => "stopping",
            CopyState::Error => "error",
        }
    }
}

impl fmt::Display for CopyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account: AccountId,
    pub role: Role,
    pub state: ConnectionState,
    /// Abandoned: no further reconnects
    pub permanent: bool,
    pub health: SessionHealth,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub state: CopyState,
    pub session_id: Option<Uuid>,
    pub policy: ReplicationPolicy,
    pub accounts: Vec<AccountSnapshot>,
    pub outcomes: OutcomeTally,
    pub in_flight: usize,
}

impl CoordinatorSnapshot {
    pub fn account(&self, id: &AccountId) -> Option<&AccountSnapshot> {
        self.accounts.iter().find(|a| &a.account == id)
    }
}

enum PolicyUpdate {
    Replace(ReplicationPolicy),
    CopyRatio(Decimal),
    MaxStake(Decimal),
    Symbol { symbol: String, enabled: bool },
}

enum Command {
    Start {
        request: StartRequest,
        reply: oneshot::Sender<CopyResult<StartReport>>,
    },
    Stop {
        reply: oneshot::Sender<StopReport>,
    },
    UpdatePolicy {
        update: PolicyUpdate,
        reply: oneshot::Sender<CopyResult<ReplicationPolicy>>,
    },
    Snapshot {
        reply: oneshot::Sender<CoordinatorSnapshot>,
    },
    Outcomes {
        reply: oneshot::Sender<Vec<OutcomeEntry>>,
    },
}

/// Result of opening every account for a start.
struct ConnectOutcome {
    session_id: Uuid,
    master: CopyResult<SessionHandle>,
    followers: Vec<(AccountId, CopyResult<SessionHandle>)>,
}

/// Result of one per-follower order dispatch.
struct Dispatch {
    trade_id: String,
    follower: AccountId,
    amount: Decimal,
    result: DispatchResult,
}

enum DispatchResult {
    Acked(OrderStatus),
    Failed(CopyError),
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberStatus {
    Connecting,
    Authorized,
    Reconnecting,
    Abandoned,
}

struct Member {
    role: Role,
    credential: Credential,
    handle: Option<SessionHandle>,
    status: MemberStatus,
}

impl Member {
    fn connection_state(&self) -> ConnectionState {
        match (self.status, &self.handle) {
            (MemberStatus::Authorized, Some(handle)) => handle.state(),
            (MemberStatus::Connecting, _) => ConnectionState::Connecting,
            _ => ConnectionState::Degraded,
        }
    }
}

/// Handle for driving a running [`Coordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    bus: EventBus,
    state: watch::Receiver<CopyState>,
}

impl CoordinatorHandle {
    async fn request<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> CopyResult<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CopyError::Cancelled("coordinator has shut down".to_string()))?;
        response
            .await
            .map_err(|_| CopyError::Cancelled("coordinator has shut down".to_string()))
    }

    /// Validate, connect every account and begin copying.
    ///
    /// Resolves once the session is Active or has failed to get there.
    pub async fn start(&self, request: StartRequest) -> CopyResult<StartReport> {
        self.request(|reply| Command::Start { request, reply }).await?
    }

    /// Stop copying from any state. Outcomes stay available afterwards.
    pub async fn stop(&self) -> CopyResult<StopReport> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn set_policy(&self, policy: ReplicationPolicy) -> CopyResult<ReplicationPolicy> {
        self.update(PolicyUpdate::Replace(policy)).await
    }

    pub async fn set_copy_ratio(&self, ratio: Decimal) -> CopyResult<ReplicationPolicy> {
        self.update(PolicyUpdate::CopyRatio(ratio)).await
    }

    pub async fn set_max_stake(&self, max_stake: Decimal) -> CopyResult<ReplicationPolicy> {
        self.update(PolicyUpdate::MaxStake(max_stake)).await
    }

    pub async fn set_symbol_enabled(
        &self,
        symbol: &str,
        enabled: bool,
    ) -> CopyResult<ReplicationPolicy> {
        self.update(PolicyUpdate::Symbol {
            symbol: symbol.to_string(),
            enabled,
        })
        .await
    }

    async fn update(&self, update: PolicyUpdate) -> CopyResult<ReplicationPolicy> {
        self.request(|reply| Command::UpdatePolicy { update, reply })
            .await?
    }

    pub async fn snapshot(&self) -> CopyResult<CoordinatorSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn outcomes(&self) -> CopyResult<Vec<OutcomeEntry>> {
        self.request(|reply| Command::Outcomes { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.bus.subscribe()
    }

    pub fn state(&self) -> CopyState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CopyState> {
        self.state.clone()
    }
}

/// Copying state machine. Runs as one task; see [`Coordinator::spawn`].
pub struct Coordinator<T, S> {
    config: EngineConfig,
    store: Arc<S>,
    bus: EventBus,
    factory: SessionFactory<T>,
    supervisor: SessionSupervisor<T>,

    state: CopyState,
    state_tx: watch::Sender<CopyState>,
    policy: ReplicationPolicy,
    session_id: Option<Uuid>,

    members: BTreeMap<AccountId, Member>,

    // Dedup and audit
    seen: HashSet<String>,
    outcomes: OutcomeLog,

    events: mpsc::Receiver<SessionEvent>,
    // Session events taken off the channel while connecting or closing
    held: VecDeque<SessionEvent>,

    dispatches: JoinSet<Dispatch>,
    pending_start: Option<oneshot::Sender<CopyResult<StartReport>>>,
    connecting: Option<JoinHandle<()>>,
    connect_tx: mpsc::Sender<ConnectOutcome>,
}

impl<T: Transport, S: OutcomeStore> Coordinator<T, S> {
    /// Spawn the coordinator task and return its handle.
    pub fn spawn(
        transport: Arc<T>,
        store: Arc<S>,
        config: EngineConfig,
        policy: ReplicationPolicy,
    ) -> CoordinatorHandle {
        let capacity = config.channel_capacity.max(1);
        let bus = EventBus::new(config.event_capacity);

        let (commands_tx, commands_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (reports_tx, reports_rx) = mpsc::channel(capacity);
        let (connect_tx, connect_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(CopyState::Idle);

        let factory = SessionFactory::new(transport, config.session_config(), events_tx);
        let supervisor = SessionSupervisor::new(
            factory.clone(),
            config.retry_policy(),
            bus.clone(),
            reports_tx,
        );

        let coordinator = Self {
            config,
            store,
            bus: bus.clone(),
            factory,
            supervisor,
            state: CopyState::Idle,
            state_tx,
            policy,
            session_id: None,
            members: BTreeMap::new(),
            seen: HashSet::new(),
            outcomes: OutcomeLog::default(),
            events: events_rx,
            held: VecDeque::new(),
            dispatches: JoinSet::new(),
            pending_start: None,
            connecting: None,
            connect_tx,
        };

        tokio::spawn(coordinator.run(commands_rx, reports_rx, connect_rx));

        CoordinatorHandle {
            commands: commands_tx,
            bus,
            state: state_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::Receiver<SupervisorReport>,
        mut connects: mpsc::Receiver<ConnectOutcome>,
    ) {
        debug!("Coordinator running");

        loop {
            if self.state != CopyState::Connecting {
                while let Some(event) = self.held.pop_front() {
                    self.handle_session_event(event).await;
                }
            }

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Every handle dropped
                        self.stop().await;
                        break;
                    }
                },

                Some(outcome) = connects.recv() => self.finish_connect(outcome).await,

                Some(report) = reports.recv() => self.handle_report(report).await,

                // Always drained so sessions never block on a full channel;
                // nothing routes before Active
                Some(event) = self.events.recv() => {
                    if self.state == CopyState::Connecting {
                        self.held.push_back(event);
                    } else {
                        self.handle_session_event(event).await;
                    }
                }

                Some(joined) = self.dispatches.join_next(), if !self.dispatches.is_empty() => {
                    match joined {
                        Ok(dispatch) => self.complete_dispatch(dispatch).await,
                        Err(e) => warn!(error = %e, "Order dispatch task failed"),
                    }
                }
            }
        }

        debug!("Coordinator exited");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => self.start(request, reply).await,
            Command::Stop { reply } => {
                let report = self.stop().await;
                let _ = reply.send(report);
            }
            Command::UpdatePolicy { update, reply } => {
                let result = self.update_policy(update).await;
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let snapshot = self.snapshot().await;
                let _ = reply.send(snapshot);
            }
            Command::Outcomes { reply } => {
                let _ = reply.send(self.outcomes.entries().to_vec());
            }
        }
    }

    fn transition(&mut self, to: CopyState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.state_tx.send_replace(to);

        if to == CopyState::Error {
            self.supervisor.cancel_all();
        }

        info!(from = %from, to = %to, "Copy state changed");
        self.bus.publish(AuditKind::StateChanged { from, to });
    }

    // ==================== Start ====================

    async fn start(
        &mut self,
        request: StartRequest,
        reply: oneshot::Sender<CopyResult<StartReport>>,
    ) {
        if self.state != CopyState::Idle {
            let _ = reply.send(Err(CopyError::Validation(format!(
                "cannot start while {}",
                self.state
            ))));
            return;
        }

        let validated = match request.validate(&self.policy) {
            Ok(validated) => validated,
            Err(e) => {
                warn!(error = %e, "Start rejected");
                let _ = reply.send(Err(e));
                return;
            }
        };

        let (session_id, log) = match validated.resume {
            Some(id) => match self.store.load_outcomes(id).await {
                Ok(entries) => (id, OutcomeLog::from_entries(entries)),
                Err(e) => {
                    let _ = reply.send(Err(CopyError::Validation(format!(
                        "cannot resume session {}: {:#}",
                        id, e
                    ))));
                    return;
                }
            },
            None => (Uuid::new_v4(), OutcomeLog::default()),
        };

        if validated.policy != self.policy {
            if let Err(e) = self.store.save_policy(&validated.policy).await {
                warn!(error = %e, "Failed to persist start policy");
            }
            self.policy = validated.policy;
        }
        self.session_id = Some(session_id);
        if !log.is_empty() {
            info!(session_id = %session_id, outcomes = log.len(), "Resuming with recorded outcomes");
        }
        self.seen = log.trade_ids();
        self.outcomes = log;
        let resumed_outcomes = self.outcomes.len();

        // An order that was in flight when the previous process died counts
        // as attempted; it is closed out, never re-sent.
        let interrupted: Vec<(String, AccountId, Option<Decimal>)> = self
            .outcomes
            .pending()
            .map(|e| (e.trade_id.clone(), e.follower.clone(), e.amount))
            .collect();
        for (trade_id, follower, amount) in interrupted {
            self.record(
                trade_id,
                follower,
                ReplicationOutcome::Failed {
                    reason: REASON_INTERRUPTED.to_string(),
                },
                amount,
            )
            .await;
        }

        self.supervisor.reset().await;
        self.members.clear();
        self.members.insert(
            AccountId::master(),
            Member {
                role: Role::Master,
                credential: validated.master.clone(),
                handle: None,
                status: MemberStatus::Connecting,
            },
        );
        for follower in &validated.followers {
            self.members.insert(
                follower.id.clone(),
                Member {
                    role: Role::Follower,
                    credential: follower.credential.clone(),
                    handle: None,
                    status: MemberStatus::Connecting,
                },
            );
        }

        let follower_ids: Vec<AccountId> =
            validated.followers.iter().map(|f| f.id.clone()).collect();
        if let Err(e) = self.store.begin_session(session_id, &follower_ids).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist session start");
        }

        info!(
            session_id = %session_id,
            followers = follower_ids.len(),
            resumed_outcomes,
            "Starting copy session"
        );
        self.transition(CopyState::Connecting);
        self.pending_start = Some(reply);

        let factory = self.factory.clone();
        let connect_tx = self.connect_tx.clone();
        let master = validated.master;
        let followers = validated.followers;

        self.connecting = Some(tokio::spawn(async move {
            let master = factory.open(AccountId::master(), master, Role::Master);
            let followers = join_all(followers.into_iter().map(|follower| {
                let factory = factory.clone();
                async move {
                    let result = factory
                        .open(follower.id.clone(), follower.credential, Role::Follower)
                        .await;
                    (follower.id, result)
                }
            }));

            let (master, followers) = tokio::join!(master, followers);
            let _ = connect_tx
                .send(ConnectOutcome {
                    session_id,
                    master,
                    followers,
                })
                .await;
        }));
    }

    async fn finish_connect(&mut self, outcome: ConnectOutcome) {
        if self.state != CopyState::Connecting || self.session_id != Some(outcome.session_id) {
            debug!(session_id = %outcome.session_id, "Discarding stale connect result");
            return;
        }
        self.connecting = None;

        let master = match outcome.master {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Master session failed to open");
                let opened: Vec<SessionHandle> = outcome
                    .followers
                    .into_iter()
                    .filter_map(|(_, result)| result.ok())
                    .collect();
                self.close_sessions(&opened).await;
                if let Some(member) = self.members.get_mut(&AccountId::master()) {
                    member.status = MemberStatus::Abandoned;
                }
                self.bus.publish(AuditKind::SessionDegraded {
                    account: AccountId::master(),
                    reason: e.to_string(),
                    permanent: true,
                });
                self.transition(CopyState::Error);
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };
        self.install(master).await;

        let mut degraded = Vec::new();
        for (account, result) in outcome.followers {
            match result {
                Ok(handle) => self.install(handle).await,
                Err(e) => {
                    warn!(account = %account, error = %e, "Follower session failed to open");
                    degraded.push(account.clone());
                    self.session_lost(account, e).await;
                }
            }
        }

        let authorized: Vec<AccountId> = self
            .members
            .iter()
            .filter(|(_, m)| m.role == Role::Follower && m.status == MemberStatus::Authorized)
            .map(|(id, _)| id.clone())
            .collect();

        let result = if authorized.is_empty() {
            error!("No follower could be authorized");
            self.transition(CopyState::Error);
            Err(CopyError::NoAuthorizedFollowers)
        } else {
            self.transition(CopyState::Active);
            Ok(StartReport {
                session_id: outcome.session_id,
                authorized,
                degraded,
                resumed_outcomes: self.outcomes.len(),
            })
        };

        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(result);
        }
    }

    async fn install(&mut self, handle: SessionHandle) {
        let account = handle.account().clone();
        self.supervisor.register(&account).await;
        match self.members.get_mut(&account) {
            Some(member) => {
                member.handle = Some(handle);
                member.status = MemberStatus::Authorized;
            }
            None => {
                self.close_sessions(&[handle]).await;
            }
        }
    }

    // ==================== Session supervision ====================

    /// Hand a lost session to the supervisor.
    async fn session_lost(&mut self, account: AccountId, reason: CopyError) {
        let (role, credential) = match self.members.get_mut(&account) {
            Some(member) => {
                member.handle = None;
                (member.role, member.credential.clone())
            }
            None => return,
        };

        let recovery = self
            .supervisor
            .schedule(account.clone(), credential, role, reason.clone())
            .await;

        match recovery {
            Recovery::Scheduled { delay } => {
                debug!(account = %account, delay_ms = delay.as_millis() as u64, "Session handed to supervisor");
                if let Some(member) = self.members.get_mut(&account) {
                    member.status = MemberStatus::Reconnecting;
                }
                self.bus.publish(AuditKind::SessionDegraded {
                    account,
                    reason: reason.to_string(),
                    permanent: false,
                });
            }
            Recovery::Terminal | Recovery::Exhausted => {
                self.abandon(account, reason.to_string());
            }
        }
    }

    fn abandon(&mut self, account: AccountId, reason: String) {
        let role = match self.members.get_mut(&account) {
            Some(member) => {
                member.handle = None;
                member.status = MemberStatus::Abandoned;
                member.role
            }
            None => return,
        };

        warn!(account = %account, role = %role, reason = %reason, "Session permanently degraded");
        self.bus.publish(AuditKind::SessionDegraded {
            account,
            reason,
            permanent: true,
        });

        if role == Role::Master && self.state == CopyState::Active {
            error!("Master session lost for good");
            self.transition(CopyState::Error);
        }
    }

    async fn handle_report(&mut self, report: SupervisorReport) {
        match report {
            SupervisorReport::Restored {
                generation,
                role,
                handle,
            } => {
                let account = handle.account().clone();
                let wanted = generation == self.supervisor.generation()
                    && self.state == CopyState::Active
                    && self
                        .members
                        .get(&account)
                        .map(|m| m.status == MemberStatus::Reconnecting)
                        .unwrap_or(false);
                if !wanted {
                    debug!(account = %account, "Closing session restored too late");
                    self.close_sessions(&[handle]).await;
                    return;
                }

                if let Some(member) = self.members.get_mut(&account) {
                    member.handle = Some(handle);
                    member.status = MemberStatus::Authorized;
                }
                info!(account = %account, role = %role, "Session back in rotation");
                self.bus.publish(AuditKind::SessionRestored { account });
            }
            SupervisorReport::Abandoned {
                generation,
                account,
                role,
                reason,
                exhausted,
            } => {
                if generation != self.supervisor.generation() {
                    return;
                }
                debug!(account = %account, role = %role, exhausted, "Supervisor gave up");
                self.abandon(account, reason);
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let (role, current) = match self.members.get(&event.account) {
            Some(member) => (
                member.role,
                member.handle.as_ref().map(SessionHandle::epoch),
            ),
            None => {
                debug!(account = %event.account, "Event for unknown account");
                return;
            }
        };
        if current != Some(event.epoch) {
            debug!(account = %event.account, epoch = event.epoch, "Dropping event from replaced session");
            return;
        }

        match event.kind {
            SessionEventKind::Authorized { scopes } => {
                self.bus.publish(AuditKind::SessionAuthorized {
                    account: event.account,
                    role,
                    scopes,
                });
            }
            SessionEventKind::TradeObserved(trade) => self.route_trade(trade).await,
            SessionEventKind::OrderAck {
                request_id,
                status,
                late,
            } => {
                if late {
                    warn!(follower = %event.account, request_id, status = %status, "Order ack arrived after timeout");
                    self.bus.publish(AuditKind::LateAck {
                        follower: event.account,
                        request_id,
                        status: status.to_string(),
                    });
                } else {
                    debug!(follower = %event.account, request_id, status = %status, "Order acked");
                }
            }
            SessionEventKind::TransportClosed(reason) => {
                self.bus.publish(AuditKind::SessionClosed {
                    account: event.account.clone(),
                    role,
                    reason: reason.to_string(),
                });

                if self.state == CopyState::Active {
                    self.session_lost(event.account, reason.into_error()).await;
                } else if let Some(member) = self.members.get_mut(&event.account) {
                    member.handle = None;
                }
            }
        }
    }

    // ==================== Routing ====================

    async fn route_trade(&mut self, trade: TradeEvent) {
        if self.state != CopyState::Active {
            debug!(trade_id = %trade.id, state = %self.state, "Ignoring trade while not active");
            return;
        }

        if !self.seen.insert(trade.id.clone()) {
            debug!(trade_id = %trade.id, "Duplicate trade");
            self.bus.publish(AuditKind::DuplicateTrade { trade_id: trade.id });
            return;
        }

        info!(
            trade_id = %trade.id,
            symbol = %trade.symbol,
            action = %trade.action.as_str(),
            amount = %trade.amount,
            "Trade observed"
        );
        self.bus.publish(AuditKind::TradeObserved {
            trade_id: trade.id.clone(),
            symbol: trade.symbol.clone(),
            action: trade.action.as_str().to_string(),
            amount: trade.amount,
        });

        let targets: Vec<(AccountId, SessionClient)> = self
            .members
            .iter()
            .filter(|(_, m)| m.role == Role::Follower && m.status == MemberStatus::Authorized)
            .filter_map(|(id, m)| m.handle.as_ref().map(|h| (id.clone(), h.client())))
            .collect();

        let send_timeout = self.config.send_timeout();
        for (follower, client) in targets {
            if self.outcomes.contains(&trade.id, &follower) {
                continue;
            }

            match stake_sizer::size(&trade, &self.policy) {
                Sizing::Suppressed(reason) => {
                    self.record(
                        trade.id.clone(),
                        follower,
                        ReplicationOutcome::Suppressed { reason },
                        None,
                    )
                    .await;
                }
                Sizing::Order(order) => {
                    let amount = order.amount;
                    self.record(
                        trade.id.clone(),
                        follower.clone(),
                        ReplicationOutcome::Pending,
                        Some(amount),
                    )
                    .await;

                    // Queued here, not in the task, so each follower sees
                    // orders in master order
                    let ack = match client.submit(order) {
                        Ok(ack) => ack,
                        Err(e) => {
                            self.record(
                                trade.id.clone(),
                                follower,
                                ReplicationOutcome::Failed {
                                    reason: e.to_string(),
                                },
                                Some(amount),
                            )
                            .await;
                            continue;
                        }
                    };

                    let trade_id = trade.id.clone();
                    self.dispatches.spawn(async move {
                        let result = match tokio::time::timeout(send_timeout, ack).await {
                            Ok(Ok(status)) => DispatchResult::Acked(status),
                            Ok(Err(e)) => DispatchResult::Failed(e),
                            Err(_) => DispatchResult::TimedOut,
                        };
                        Dispatch {
                            trade_id,
                            follower,
                            amount,
                            result,
                        }
                    });
                }
            }
        }
    }

    async fn complete_dispatch(&mut self, dispatch: Dispatch) {
        let still_pending = self
            .outcomes
            .get(&dispatch.trade_id, &dispatch.follower)
            .map(|e| e.outcome == ReplicationOutcome::Pending)
            .unwrap_or(false);
        if !still_pending {
            debug!(trade_id = %dispatch.trade_id, follower = %dispatch.follower, "Dispatch already settled");
            return;
        }

        let outcome = match dispatch.result {
            DispatchResult::Acked(OrderStatus::Accepted { reference }) => {
                ReplicationOutcome::Sent { reference }
            }
            DispatchResult::Acked(OrderStatus::Rejected { reason }) => {
                ReplicationOutcome::Failed { reason }
            }
            DispatchResult::Failed(e) => ReplicationOutcome::Failed {
                reason: e.to_string(),
            },
            DispatchResult::TimedOut => ReplicationOutcome::Failed {
                reason: REASON_TIMEOUT.to_string(),
            },
        };

        self.record(
            dispatch.trade_id,
            dispatch.follower,
            outcome,
            Some(dispatch.amount),
        )
        .await;
    }

    /// Persist, log and audit one outcome transition.
    async fn record(
        &mut self,
        trade_id: String,
        follower: AccountId,
        outcome: ReplicationOutcome,
        amount: Option<Decimal>,
    ) {
        let Some(session_id) = self.session_id else {
            return;
        };

        let entry = OutcomeEntry {
            session_id,
            trade_id,
            follower,
            outcome,
            amount,
            recorded_at: Utc::now(),
        };

        if let Err(e) = self.store.append_outcome(&entry).await {
            warn!(trade_id = %entry.trade_id, follower = %entry.follower, error = %e, "Failed to persist outcome");
        }

        let audit = match &entry.outcome {
            ReplicationOutcome::Pending => None,
            ReplicationOutcome::Sent { reference } => {
                info!(trade_id = %entry.trade_id, follower = %entry.follower, amount = ?entry.amount, "Order sent");
                Some(AuditKind::OrderSent {
                    trade_id: entry.trade_id.clone(),
                    follower: entry.follower.clone(),
                    amount: entry.amount,
                    reference: reference.clone(),
                })
            }
            ReplicationOutcome::Suppressed { reason } => {
                debug!(trade_id = %entry.trade_id, follower = %entry.follower, reason = %reason, "Order suppressed");
                Some(AuditKind::OrderSuppressed {
                    trade_id: entry.trade_id.clone(),
                    follower: entry.follower.clone(),
                    reason: reason.clone(),
                })
            }
            ReplicationOutcome::Failed { reason } => {
                warn!(trade_id = %entry.trade_id, follower = %entry.follower, reason = %reason, "Order failed");
                Some(AuditKind::OrderFailed {
                    trade_id: entry.trade_id.clone(),
                    follower: entry.follower.clone(),
                    reason: reason.clone(),
                })
            }
        };
        if let Some(audit) = audit {
            self.bus.publish(audit);
        }

        self.outcomes.record(entry);
    }

    // ==================== Stop ====================

    async fn stop(&mut self) -> StopReport {
        let mut report = StopReport {
            session_id: self.session_id,
            ..StopReport::default()
        };
        if self.state == CopyState::Idle {
            return report;
        }

        self.transition(CopyState::Stopping);

        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(CopyError::Cancelled(
                "stopped while connecting".to_string(),
            )));
        }
        self.supervisor.cancel_all();

        // Let in-flight orders finish within the shutdown budget
        let deadline = Instant::now() + self.config.shutdown_timeout();
        while !self.dispatches.is_empty() {
            tokio::select! {
                joined = self.dispatches.join_next() => match joined {
                    Some(Ok(dispatch)) => {
                        report.drained += 1;
                        self.complete_dispatch(dispatch).await;
                    }
                    Some(Err(e)) => warn!(error = %e, "Order dispatch task failed"),
                    None => break,
                },
                Some(event) = self.events.recv() => self.held.push_back(event),
                () = tokio::time::sleep_until(deadline) => {
                    warn!(remaining = self.dispatches.len(), "Shutdown timeout, abandoning in-flight orders");
                    self.dispatches.shutdown().await;
                    break;
                }
            }
        }

        let pending: Vec<(String, AccountId, Option<Decimal>)> = self
            .outcomes
            .pending()
            .map(|e| (e.trade_id.clone(), e.follower.clone(), e.amount))
            .collect();
        report.cancelled = pending.len();
        for (trade_id, follower, amount) in pending {
            self.record(
                trade_id,
                follower,
                ReplicationOutcome::Failed {
                    reason: REASON_CANCELLED.to_string(),
                },
                amount,
            )
            .await;
        }

        let handles: Vec<SessionHandle> = self
            .members
            .values_mut()
            .filter_map(|m| m.handle.take())
            .collect();
        report.forced = self.close_sessions(&handles).await;
        report.closed = handles.len() - report.forced;

        for handle in &handles {
            self.bus.publish(AuditKind::SessionClosed {
                account: handle.account().clone(),
                role: handle.role(),
                reason: "stopped".to_string(),
            });
        }
        self.members.clear();
        if !self.held.is_empty() {
            debug!(count = self.held.len(), "Discarding session events from stopped sessions");
            self.held.clear();
        }

        if let Some(session_id) = self.session_id {
            if let Err(e) = self.store.end_session(session_id).await {
                warn!(session_id = %session_id, error = %e, "Failed to persist session stop");
            }
        }

        self.transition(CopyState::Idle);
        info!(
            drained = report.drained,
            cancelled = report.cancelled,
            closed = report.closed,
            forced = report.forced,
            "Copy session stopped"
        );
        report
    }

    /// Close sessions within the shutdown timeout and abort the ones still
    /// running after it. Returns how many were aborted.
    ///
    /// Session events keep being drained meanwhile, so a session blocked on
    /// the event channel can still see its close command.
    async fn close_sessions(&mut self, handles: &[SessionHandle]) -> usize {
        if handles.is_empty() {
            return 0;
        }

        let deadline = Instant::now() + self.config.shutdown_timeout();
        let closing = join_all(handles.iter().map(SessionHandle::close));
        tokio::pin!(closing);

        let closed = loop {
            tokio::select! {
                _ = &mut closing => break true,
                Some(event) = self.events.recv() => self.held.push_back(event),
                () = tokio::time::sleep_until(deadline) => break false,
            }
        };
        if closed {
            return 0;
        }

        let mut forced = 0;
        for handle in handles.iter().filter(|h| !h.is_finished()) {
            warn!(account = %handle.account(), "Force-closing session after shutdown timeout");
            handle.abort();
            forced += 1;
        }
        forced
    }

    // ==================== Policy & snapshots ====================

    async fn update_policy(&mut self, update: PolicyUpdate) -> CopyResult<ReplicationPolicy> {
        if self.state != CopyState::Idle {
            return Err(CopyError::PolicyLocked(self.state.to_string()));
        }

        let mut next = self.policy.clone();
        match update {
            PolicyUpdate::Replace(policy) => next = policy,
            PolicyUpdate::CopyRatio(ratio) => next.copy_ratio = ratio,
            PolicyUpdate::MaxStake(max_stake) => next.max_stake = max_stake,
            PolicyUpdate::Symbol { symbol, enabled } => next.set_symbol(&symbol, enabled),
        }
        next.validate()?;

        if let Err(e) = self.store.save_policy(&next).await {
            warn!(error = %e, "Failed to persist policy");
        }
        info!(
            copy_ratio = %next.copy_ratio,
            max_stake = %next.max_stake,
            symbols = next.enabled_symbols().count(),
            "Policy updated"
        );
        self.policy = next.clone();
        Ok(next)
    }

    async fn snapshot(&mut self) -> CoordinatorSnapshot {
        let health = self.supervisor.health().await;
        let accounts = self
            .members
            .iter()
            .map(|(id, member)| AccountSnapshot {
                account: id.clone(),
                role: member.role,
                state: member.connection_state(),
                permanent: member.status == MemberStatus::Abandoned,
                health: health.get(id).cloned().unwrap_or_default(),
            })
            .collect();

        CoordinatorSnapshot {
            state: self.state,
            session_id: self.session_id,
            policy: self.policy.clone(),
            accounts,
            outcomes: self.outcomes.tally(),
            in_flight: self.dispatches.len(),
        }
    }
}
