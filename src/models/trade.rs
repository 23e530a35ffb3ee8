//! Trades observed on the master account and orders sent to followers.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Direction of a trade.
///
/// Upstream feeds can report actions we do not mirror (deposits, transfers);
/// those are kept as `Other` so sizing can suppress them explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TradeAction {
    Buy,
    Sell,
    Other(String),
}

impl TradeAction {
    pub fn as_str(&self) -> &str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Other(s) => s,
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::Sell)
    }
}

impl From<&str> for TradeAction {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "buy" => TradeAction::Buy,
            "sell" => TradeAction::Sell,
            other => TradeAction::Other(other.to_string()),
        }
    }
}

impl From<String> for TradeAction {
    fn from(s: String) -> Self {
        TradeAction::from(s.as_str())
    }
}

impl From<TradeAction> for String {
    fn from(action: TradeAction) -> Self {
        action.as_str().to_string()
    }
}

/// A transaction observed on the master account. Immutable once observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Upstream transaction id, used as the dedup key
    pub id: String,

    pub timestamp: DateTime<Utc>,

    pub action: TradeAction,

    /// Underlying symbol (e.g. "EURUSD", "R_100")
    pub symbol: String,

    /// Stake paid by the master
    pub amount: Decimal,

    /// Contract type (e.g. "CALL", "PUT")
    pub contract_type: String,

    pub duration: u32,

    /// Duration unit ("t" ticks, "s" seconds, "m" minutes, ...)
    pub duration_unit: String,
}

/// How the order amount is interpreted by the downstream venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StakeBasis {
    Stake,
}

impl StakeBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            StakeBasis::Stake => "stake",
        }
    }
}

/// Stakes are placed with cent precision.
pub const STAKE_DECIMALS: u32 = 2;

/// Truncate a stake to venue precision. Truncation keeps a capped stake
/// under its cap.
pub fn venue_stake(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(STAKE_DECIMALS, RoundingStrategy::ToZero)
}

/// Executable order produced by the stake sizer for one follower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub action: TradeAction,
    pub amount: Decimal,
    pub contract_type: String,
    pub duration: u32,
    pub duration_unit: String,
    pub basis: StakeBasis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parsing() {
        assert_eq!(TradeAction::from("BUY"), TradeAction::Buy);
        assert_eq!(TradeAction::from("sell"), TradeAction::Sell);
        assert_eq!(
            TradeAction::from("deposit"),
            TradeAction::Other("deposit".to_string())
        );
        assert!(!TradeAction::from("deposit").is_supported());
    }

    #[test]
    fn test_venue_stake_truncates() {
        use rust_decimal_macros::dec;

        assert_eq!(venue_stake(dec!(16.665)), dec!(16.66));
        assert_eq!(venue_stake(dec!(0.004)), dec!(0));
        assert_eq!(venue_stake(dec!(40)), dec!(40));
    }

    #[test]
    fn test_action_serializes_as_plain_string() {
        let json = serde_json::to_string(&TradeAction::Buy).unwrap();
        assert_eq!(json, "\"buy\"");

        let parsed: TradeAction = serde_json::from_str("\"withdrawal\"").unwrap();
        assert_eq!(parsed, TradeAction::Other("withdrawal".to_string()));
    }
}
