//! Connection sessions: one authenticated transport per account.
//!
//! Handles:
//! - The authorize handshake and scope verification
//! - Subscribing master sessions to the transaction stream
//! - Correlating order requests with their acks
//! - Reporting closure so the supervisor can decide on a retry

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CopyError, CopyResult};
use crate::models::{AccountId, Credential, Order, Role, TradeEvent};
use crate::transport::{
    CloseReason, InboundMessage, OrderStatus, OutboundMessage, Transport, TransportLink,
};

/// Lifecycle of one account connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authorizing,
    Authorized,
    Degraded,
    Closed,
}

/// Event emitted by a session, tagged with the session's epoch so consumers
/// can ignore stragglers from a session that has since been replaced.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub account: AccountId,
    pub epoch: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone)]
pub enum SessionEventKind {
    Authorized { scopes: Vec<String> },
    /// Master sessions only
    TradeObserved(TradeEvent),
    /// `late` is set when nobody was waiting for the ack any more
    OrderAck {
        request_id: u64,
        status: OrderStatus,
        late: bool,
    },
    TransportClosed(CloseReason),
}

/// State owned by a single session task.
struct AccountSession {
    credential: Credential,
    role: Role,
    state: ConnectionState,
    scopes: Vec<String>,
}

enum SessionCommand {
    PlaceOrder {
        order: Order,
        reply: oneshot::Sender<CopyResult<OrderStatus>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Cheap cloneable handle for sending orders on a session.
#[derive(Clone)]
pub struct SessionClient {
    account: AccountId,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionClient {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Queue an order without waiting and return a future for its ack.
    ///
    /// Orders submitted one after another reach the transport in that order.
    /// Fails at once unless the session is authorized and has room in its
    /// command queue.
    pub fn submit(
        &self,
        order: Order,
    ) -> CopyResult<impl Future<Output = CopyResult<OrderStatus>> + Send + 'static> {
        if self.state() != ConnectionState::Authorized {
            return Err(CopyError::Transport(format!(
                "session {} is not authorized",
                self.account
            )));
        }

        let (reply, ack) = oneshot::channel();
        self.commands
            .try_send(SessionCommand::PlaceOrder { order, reply })
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    CopyError::Transport(format!("session {} is backlogged", self.account))
                }
                TrySendError::Closed(_) => {
                    CopyError::Transport(format!("session {} is closed", self.account))
                }
            })?;

        let account = self.account.clone();
        Ok(async move {
            match ack.await {
                Ok(result) => result,
                Err(_) => Err(CopyError::Transport(format!(
                    "session {} closed before ack",
                    account
                ))),
            }
        })
    }
}

/// Owning handle of a running session task.
pub struct SessionHandle {
    client: SessionClient,
    role: Role,
    epoch: u64,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn client(&self) -> SessionClient {
        self.client.clone()
    }

    pub fn account(&self) -> &AccountId {
        &self.client.account
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Ask the session to close its transport and wait until it has.
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self
            .client
            .commands
            .send(SessionCommand::Close { done })
            .await
            .is_ok()
        {
            let _ = closed.await;
        }
    }

    /// Kill the session task without waiting for the transport.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub auth_timeout: Duration,
    pub command_capacity: usize,
}

/// Opens sessions against one transport and wires them to a shared event
/// channel. Used for the initial connect and by the supervisor for retries.
pub struct SessionFactory<T> {
    transport: Arc<T>,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    epochs: Arc<AtomicU64>,
}

impl<T> Clone for SessionFactory<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            epochs: self.epochs.clone(),
        }
    }
}

impl<T: Transport> SessionFactory<T> {
    pub fn new(transport: Arc<T>, config: SessionConfig, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            transport,
            config,
            events,
            epochs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open, authorize and start a session.
    ///
    /// Returns once the account is authorized with the scopes its role needs.
    pub async fn open(
        &self,
        account: AccountId,
        credential: Credential,
        role: Role,
    ) -> CopyResult<SessionHandle> {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let mut session = AccountSession {
            credential,
            role,
            state: ConnectionState::Disconnected,
            scopes: Vec::new(),
        };

        session.state = ConnectionState::Connecting;
        debug!(account = %account, role = %role, credential = %session.credential, "Opening session");
        let mut link = self.transport.open(&session.credential).await?;

        session.state = ConnectionState::Authorizing;
        if let Err(e) = link
            .send(OutboundMessage::Authorize(session.credential.clone()))
            .await
        {
            link.close().await;
            return Err(e);
        }

        let authorization = tokio::time::timeout(
            self.config.auth_timeout,
            await_authorization(&mut link, &account),
        )
        .await;

        let scopes = match authorization {
            Ok(Ok(scopes)) => scopes,
            Ok(Err(e)) => {
                link.close().await;
                return Err(e);
            }
            Err(_) => {
                link.close().await;
                return Err(CopyError::Timeout(format!("authorizing {}", account)));
            }
        };

        let missing: Vec<&str> = role
            .required_scopes()
            .iter()
            .copied()
            .filter(|required| !scopes.iter().any(|granted| granted == required))
            .collect();
        if !missing.is_empty() {
            session.state = ConnectionState::Closed;
            warn!(account = %account, missing = ?missing, "Credential lacks required scopes");
            link.close().await;
            return Err(CopyError::InsufficientScope(format!(
                "{} lacks scope(s): {}",
                account,
                missing.join(", ")
            )));
        }

        session.scopes = scopes.clone();
        session.state = ConnectionState::Authorized;

        if role == Role::Master {
            if let Err(e) = link.send(OutboundMessage::SubscribeTransactions).await {
                link.close().await;
                return Err(e);
            }
        }

        info!(account = %account, role = %role, scopes = ?scopes, "Session authorized");

        let (state_tx, state_rx) = watch::channel(ConnectionState::Authorized);
        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let client = SessionClient {
            account: account.clone(),
            commands: cmd_tx,
            state: state_rx,
        };

        let _ = self
            .events
            .send(SessionEvent {
                account: account.clone(),
                epoch,
                kind: SessionEventKind::Authorized { scopes },
            })
            .await;

        let task = tokio::spawn(run_session(
            account,
            epoch,
            session,
            link,
            cmd_rx,
            state_tx,
            self.events.clone(),
        ));

        Ok(SessionHandle {
            client,
            role,
            epoch,
            task,
        })
    }
}

async fn await_authorization(link: &mut TransportLink, account: &AccountId) -> CopyResult<Vec<String>> {
    loop {
        match link.recv().await {
            Some(InboundMessage::Authorized { scopes, .. }) => return Ok(scopes),
            Some(InboundMessage::AuthRejected { reason }) => return Err(CopyError::Auth(reason)),
            Some(InboundMessage::Closed(reason)) => return Err(reason.into_error()),
            Some(other) => {
                debug!(account = %account, message = ?other, "Dropping message received before authorization");
            }
            None => {
                return Err(CopyError::Transport(
                    "link closed during authorization".to_string(),
                ))
            }
        }
    }
}

/// Session task: forwards inbound traffic and serves order commands until the
/// link closes or a close is requested.
async fn run_session(
    account: AccountId,
    epoch: u64,
    mut session: AccountSession,
    mut link: TransportLink,
    mut commands: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut next_request: u64 = 1;
    let mut pending: HashMap<u64, oneshot::Sender<CopyResult<OrderStatus>>> = HashMap::new();

    let emit = |kind: SessionEventKind| SessionEvent {
        account: account.clone(),
        epoch,
        kind,
    };

    let reason = loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(SessionCommand::PlaceOrder { order, reply }) => {
                        let request_id = next_request;
                        next_request += 1;
                        debug!(account = %account, request_id, symbol = %order.symbol, amount = %order.amount, "Placing order");
                        match link.send(OutboundMessage::PlaceOrder { request_id, order }).await {
                            Ok(()) => {
                                pending.insert(request_id, reply);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Some(SessionCommand::Close { done }) => {
                        session.state = ConnectionState::Closed;
                        state_tx.send_replace(session.state);
                        link.close().await;
                        fail_pending(&mut pending, &account);
                        info!(account = %account, credential = %session.credential, "Session closed");
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        session.state = ConnectionState::Closed;
                        state_tx.send_replace(session.state);
                        link.close().await;
                        fail_pending(&mut pending, &account);
                        debug!(account = %account, "Session handle dropped, closed");
                        return;
                    }
                }
            }

            inbound = link.recv() => {
                match inbound {
                    Some(InboundMessage::Transaction(trade)) => {
                        if session.role == Role::Master {
                            let _ = events.send(emit(SessionEventKind::TradeObserved(trade))).await;
                        } else {
                            debug!(account = %account, trade_id = %trade.id, "Ignoring transaction on follower session");
                        }
                    }
                    Some(InboundMessage::OrderAck { request_id, status }) => {
                        let late = match pending.remove(&request_id) {
                            Some(reply) => reply.send(Ok(status.clone())).is_err(),
                            None => true,
                        };
                        let _ = events
                            .send(emit(SessionEventKind::OrderAck { request_id, status, late }))
                            .await;
                    }
                    Some(InboundMessage::Authorized { .. }) | Some(InboundMessage::AuthRejected { .. }) => {
                        debug!(account = %account, "Ignoring authorization message after handshake");
                    }
                    Some(InboundMessage::Unrecognized(what)) => {
                        warn!(account = %account, payload = %what, "Dropping unrecognized payload");
                    }
                    Some(InboundMessage::Closed(reason)) => break reason,
                    None => break CloseReason::Remote("link ended".to_string()),
                }
            }
        }
    };

    session.state = if reason.is_terminal() {
        ConnectionState::Closed
    } else {
        ConnectionState::Degraded
    };
    state_tx.send_replace(session.state);
    fail_pending(&mut pending, &account);

    warn!(
        account = %account,
        role = %session.role,
        scopes = ?session.scopes,
        reason = %reason,
        "Transport closed"
    );

    link.close().await;
    let _ = events
        .send(emit(SessionEventKind::TransportClosed(reason)))
        .await;
}

fn fail_pending(
    pending: &mut HashMap<u64, oneshot::Sender<CopyResult<OrderStatus>>>,
    account: &AccountId,
) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(CopyError::Transport(format!(
            "session {} closed before ack",
            account
        ))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StakeBasis, TradeAction};
    use crate::transport::memory::{AccountScript, MemoryTransport, OrderBehavior};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    const MASTER: &str = "master-token-001";
    const FOLLOWER: &str = "follower-token-001";

    fn factory(transport: &MemoryTransport) -> (SessionFactory<MemoryTransport>, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let config = SessionConfig {
            auth_timeout: Duration::from_secs(1),
            command_capacity: 8,
        };
        (SessionFactory::new(Arc::new(transport.clone()), config, tx), rx)
    }

    fn order() -> Order {
        Order {
            symbol: "EURUSD".into(),
            action: TradeAction::Buy,
            amount: dec!(10),
            contract_type: "CALL".into(),
            duration: 5,
            duration_unit: "t".into(),
            basis: StakeBasis::Stake,
        }
    }

    #[tokio::test]
    async fn test_follower_authorizes_and_places_order() {
        let transport = MemoryTransport::new();
        transport.script(FOLLOWER, AccountScript::follower());
        let (factory, mut events) = factory(&transport);

        let handle = factory
            .open(AccountId::new("f1"), Credential::parse(FOLLOWER).unwrap(), Role::Follower)
            .await
            .unwrap();
        assert_eq!(handle.state(), ConnectionState::Authorized);

        let first = events.recv().await.unwrap();
        assert!(matches!(first.kind, SessionEventKind::Authorized { .. }));

        let status = handle.client().submit(order()).unwrap().await.unwrap();
        assert_eq!(
            status,
            OrderStatus::Accepted {
                reference: Some("ref-1".into())
            }
        );
        assert_eq!(transport.placed(FOLLOWER).len(), 1);

        handle.close().await;
        assert!(handle.client().submit(order()).is_err());
    }

    #[tokio::test]
    async fn test_missing_trade_scope_is_terminal() {
        let transport = MemoryTransport::new();
        transport.script(FOLLOWER, AccountScript::master()); // read only
        let (factory, _events) = factory(&transport);

        let err = factory
            .open(AccountId::new("f1"), Credential::parse(FOLLOWER).unwrap(), Role::Follower)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CopyError::InsufficientScope(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_rejected_authorization() {
        let transport = MemoryTransport::new();
        let mut script = AccountScript::master();
        script.reject_auth = true;
        transport.script(MASTER, script);
        let (factory, _events) = factory(&transport);

        let result = factory
            .open(AccountId::master(), Credential::parse(MASTER).unwrap(), Role::Master)
            .await;
        assert!(matches!(result, Err(CopyError::Auth(_))));
    }

    #[tokio::test]
    async fn test_master_forwards_trades_and_reports_closure() {
        let transport = MemoryTransport::new();
        transport.script(MASTER, AccountScript::master());
        let (factory, mut events) = factory(&transport);

        let handle = factory
            .open(AccountId::master(), Credential::parse(MASTER).unwrap(), Role::Master)
            .await
            .unwrap();
        let _authorized = events.recv().await.unwrap();

        transport
            .inject(MASTER, InboundMessage::Unrecognized("garbage".into()))
            .await;
        transport
            .emit_trade(
                MASTER,
                TradeEvent {
                    id: "t1".into(),
                    timestamp: Utc::now(),
                    action: TradeAction::Buy,
                    symbol: "EURUSD".into(),
                    amount: dec!(100),
                    contract_type: "CALL".into(),
                    duration: 5,
                    duration_unit: "t".into(),
                },
            )
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.epoch, handle.epoch());
        match event.kind {
            SessionEventKind::TradeObserved(trade) => assert_eq!(trade.id, "t1"),
            other => panic!("unexpected {:?}", other),
        }

        transport
            .drop_link(MASTER, CloseReason::Remote("maintenance".into()))
            .await;
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            SessionEventKind::TransportClosed(CloseReason::Remote(_))
        ));
        assert_eq!(handle.state(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn test_late_ack_after_caller_gave_up() {
        let transport = MemoryTransport::new();
        transport.script(FOLLOWER, AccountScript::follower().with_orders(OrderBehavior::Hang));
        let (factory, mut events) = factory(&transport);

        let handle = factory
            .open(AccountId::new("f1"), Credential::parse(FOLLOWER).unwrap(), Role::Follower)
            .await
            .unwrap();
        let _authorized = events.recv().await.unwrap();

        let ack = handle.client().submit(order()).unwrap();
        let attempt = tokio::time::timeout(Duration::from_millis(50), ack).await;
        assert!(attempt.is_err());

        transport
            .inject(
                FOLLOWER,
                InboundMessage::OrderAck {
                    request_id: 1,
                    status: OrderStatus::Accepted { reference: None },
                },
            )
            .await;

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            SessionEventKind::OrderAck { late: true, request_id: 1, .. }
        ));
    }
}
