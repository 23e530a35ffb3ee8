//! Data models for credentials, trades, orders, policy, and outcomes.

mod credential;
mod outcome;
mod policy;
mod trade;

pub use credential::{AccountId, Credential, Role};
pub use outcome::{OutcomeEntry, OutcomeLog, OutcomeTally, ReplicationOutcome};
pub use policy::ReplicationPolicy;
pub use trade::{venue_stake, Order, StakeBasis, TradeAction, TradeEvent};
