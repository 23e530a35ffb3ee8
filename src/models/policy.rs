//! Replication policy: stake ratio, stake cap, and per-symbol enablement.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::CopyError;

/// Sizing parameters applied to every mirrored trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    /// Multiplier applied to the master's stake (must be > 0)
    pub copy_ratio: Decimal,

    /// Upper bound on any single follower stake (must be > 0)
    pub max_stake: Decimal,

    /// Symbols eligible for mirroring. Absent means disabled.
    #[serde(default)]
    pub symbol_enabled: BTreeMap<String, bool>,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            copy_ratio: dec!(1),
            max_stake: dec!(10),
            symbol_enabled: BTreeMap::new(),
        }
    }
}

impl ReplicationPolicy {
    pub fn new(copy_ratio: Decimal, max_stake: Decimal) -> Self {
        Self {
            copy_ratio,
            max_stake,
            symbol_enabled: BTreeMap::new(),
        }
    }

    /// Builder-style symbol toggle.
    #[cfg(test)]
    pub fn with_symbol(mut self, symbol: &str, enabled: bool) -> Self {
        self.set_symbol(symbol, enabled);
        self
    }

    pub fn set_symbol(&mut self, symbol: &str, enabled: bool) {
        self.symbol_enabled
            .insert(symbol.trim().to_uppercase(), enabled);
    }

    pub fn is_enabled(&self, symbol: &str) -> bool {
        self.symbol_enabled
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(false)
    }

    pub fn enabled_symbols(&self) -> impl Iterator<Item = &str> {
        self.symbol_enabled
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(symbol, _)| symbol.as_str())
    }

    pub fn validate(&self) -> Result<(), CopyError> {
        if self.copy_ratio <= Decimal::ZERO {
            return Err(CopyError::Validation(format!(
                "copy ratio must be positive, got {}",
                self.copy_ratio
            )));
        }
        if self.max_stake <= Decimal::ZERO {
            return Err(CopyError::Validation(format!(
                "max stake must be positive, got {}",
                self.max_stake
            )));
        }
        if self.symbol_enabled.keys().any(|s| s.is_empty()) {
            return Err(CopyError::Validation("empty symbol in filter".to_string()));
        }
        Ok(())
    }
}
