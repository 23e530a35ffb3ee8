//! Stake sizing: maps a master trade onto a follower order under a policy.

use rust_decimal::Decimal;

use crate::models::{venue_stake, Order, ReplicationPolicy, StakeBasis, TradeEvent};

pub const REASON_SYMBOL_FILTERED: &str = "symbol filtered";
pub const REASON_UNSUPPORTED_ACTION: &str = "unsupported action";
pub const REASON_NON_POSITIVE_STAKE: &str = "non-positive stake";

/// Result of sizing a trade for one follower.
#[derive(Debug, Clone, PartialEq)]
pub enum Sizing {
    Order(Order),
    /// Do not contact the follower; record the reason instead
    Suppressed(String),
}

/// Size a trade under `policy`.
///
/// Checks run in order: symbol filter, action, ratio, cap, venue precision,
/// positivity.
/// Pure and deterministic.
pub fn size(trade: &TradeEvent, policy: &ReplicationPolicy) -> Sizing {
    if !policy.is_enabled(&trade.symbol) {
        return Sizing::Suppressed(REASON_SYMBOL_FILTERED.to_string());
    }
    if !trade.action.is_supported() {
        return Sizing::Suppressed(REASON_UNSUPPORTED_ACTION.to_string());
    }

    let adjusted = venue_stake((trade.amount * policy.copy_ratio).min(policy.max_stake));
    if adjusted <= Decimal::ZERO {
        return Sizing::Suppressed(REASON_NON_POSITIVE_STAKE.to_string());
    }

    Sizing::Order(Order {
        symbol: trade.symbol.clone(),
        action: trade.action.clone(),
        amount: adjusted,
        contract_type: trade.contract_type.clone(),
        duration: trade.duration,
        duration_unit: trade.duration_unit.clone(),
        basis: StakeBasis::Stake,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeAction;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn trade(symbol: &str, action: TradeAction, amount: Decimal) -> TradeEvent {
        TradeEvent {
            id: "t1".to_string(),
            timestamp: Utc::now(),
            action,
            symbol: symbol.to_string(),
            amount,
            contract_type: "CALL".to_string(),
            duration: 5,
            duration_unit: "t".to_string(),
        }
    }

    fn policy() -> ReplicationPolicy {
        ReplicationPolicy::new(dec!(0.5), dec!(40)).with_symbol("EURUSD", true)
    }

    #[test]
    fn test_cap_applies_after_ratio() {
        let sized = size(&trade("EURUSD", TradeAction::Buy, dec!(100)), &policy());
        match sized {
            Sizing::Order(order) => {
                assert_eq!(order.amount, dec!(40));
                assert_eq!(order.basis, StakeBasis::Stake);
                assert_eq!(order.contract_type, "CALL");
                assert_eq!(order.duration, 5);
            }
            other => panic!("expected order, got {:?}", other),
        }
    }

    #[test]
    fn test_ratio_below_cap() {
        let sized = size(&trade("EURUSD", TradeAction::Sell, dec!(20)), &policy());
        assert!(matches!(sized, Sizing::Order(ref o) if o.amount == dec!(10) && o.action == TradeAction::Sell));
    }

    #[test]
    fn test_symbol_filter() {
        let disabled = policy().with_symbol("EURUSD", false);
        assert_eq!(
            size(&trade("EURUSD", TradeAction::Buy, dec!(100)), &disabled),
            Sizing::Suppressed(REASON_SYMBOL_FILTERED.to_string())
        );
        // Absent symbols are disabled too
        assert_eq!(
            size(&trade("GBPUSD", TradeAction::Buy, dec!(100)), &policy()),
            Sizing::Suppressed(REASON_SYMBOL_FILTERED.to_string())
        );
    }

    #[test]
    fn test_filter_checked_before_action() {
        let sized = size(
            &trade("GBPUSD", TradeAction::Other("deposit".into()), dec!(1)),
            &policy(),
        );
        assert_eq!(sized, Sizing::Suppressed(REASON_SYMBOL_FILTERED.to_string()));

        let sized = size(
            &trade("EURUSD", TradeAction::Other("deposit".into()), dec!(1)),
            &policy(),
        );
        assert_eq!(sized, Sizing::Suppressed(REASON_UNSUPPORTED_ACTION.to_string()));
    }

    #[test]
    fn test_non_positive_stake() {
        let sized = size(&trade("EURUSD", TradeAction::Buy, dec!(0)), &policy());
        assert_eq!(sized, Sizing::Suppressed(REASON_NON_POSITIVE_STAKE.to_string()));

        let sized = size(&trade("EURUSD", TradeAction::Buy, dec!(-5)), &policy());
        assert_eq!(sized, Sizing::Suppressed(REASON_NON_POSITIVE_STAKE.to_string()));
    }

    #[test]
    fn test_sub_cent_stake_is_suppressed() {
        let tiny = ReplicationPolicy::new(dec!(0.004), dec!(40)).with_symbol("EURUSD", true);
        let sized = size(&trade("EURUSD", TradeAction::Buy, dec!(1)), &tiny);
        assert_eq!(sized, Sizing::Suppressed(REASON_NON_POSITIVE_STAKE.to_string()));

        let sized = size(&trade("EURUSD", TradeAction::Buy, dec!(33.33)), &policy());
        assert!(matches!(sized, Sizing::Order(ref o) if o.amount == dec!(16.66)));
    }

    #[test]
    fn test_deterministic() {
        let t = trade("eurusd", TradeAction::Buy, dec!(33.33));
        let p = policy();
        assert_eq!(size(&t, &p), size(&t, &p));
    }
}
