use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::decimal::{Money, Rate};
use crate::errors::{BankError, Result};

/// engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub transfers: TransferPolicy,
    pub wire: WirePolicy,
    pub loans: LoanPolicy,
    pub retry: RetryPolicy,
}

/// limits applied to account-to-account transfers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferPolicy {
    /// smallest amount accepted by any transfer
    pub min_amount: Money,
    /// largest internal transfer
    pub max_internal_amount: Money,
    /// external transfers above this need the manual review path
    pub external_ceiling: Money,
    pub memo_max_len: usize,
}

/// wire transfer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WirePolicy {
    pub max_amount: Money,
    /// digits in a one-time verification code
    pub code_length: u32,
    pub code_ttl_minutes: i64,
    /// wrong codes tolerated before the wire is failed
    pub max_code_attempts: u32,
}

/// loan accounting policy constants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoanPolicy {
    /// discount on outstanding principal granted for early payoff
    pub early_payoff_discount: Rate,
    /// late fee as a fraction of the monthly payment
    pub late_fee_rate: Rate,
    /// minimum late fee
    pub late_fee_floor: Money,
}

/// optimistic concurrency retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfers: TransferPolicy::default(),
            wire: WirePolicy::default(),
            loans: LoanPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            min_amount: Money::CENT,
            max_internal_amount: Money::from_major(1_000_000),
            external_ceiling: Money::from_major(10_000),
            memo_max_len: 255,
        }
    }
}

impl Default for WirePolicy {
    fn default() -> Self {
        Self {
            max_amount: Money::from_major(250_000),
            code_length: 6,
            code_ttl_minutes: 15,
            max_code_attempts: 5,
        }
    }
}

impl Default for LoanPolicy {
    fn default() -> Self {
        Self {
            early_payoff_discount: Rate::from_percentage(2),
            late_fee_rate: Rate::from_percentage(5),
            late_fee_floor: Money::from_major(25),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl EngineConfig {
    /// parse a json document; missing sections fall back to defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| BankError::validation(format!("invalid engine configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// configuration with the plain percentage late fee (no floor)
    pub fn without_late_fee_floor() -> Self {
        let mut config = Self::default();
        config.loans.late_fee_floor = Money::ZERO;
        config
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.transfers;
        if !t.min_amount.is_positive() {
            return Err(BankError::validation("transfers.min_amount must be positive"));
        }
        if t.external_ceiling < t.min_amount || t.max_internal_amount < t.min_amount {
            return Err(BankError::validation("transfer ceilings must not be below min_amount"));
        }
        if !(4..=10).contains(&self.wire.code_length) {
            return Err(BankError::validation("wire.code_length must be between 4 and 10"));
        }
        if self.wire.code_ttl_minutes <= 0 {
            return Err(BankError::validation("wire.code_ttl_minutes must be positive"));
        }
        if self.wire.max_code_attempts == 0 {
            return Err(BankError::validation("wire.max_code_attempts must be at least 1"));
        }
        let one = Rate::from_decimal(dec!(1));
        if self.loans.early_payoff_discount >= one || self.loans.late_fee_rate >= one {
            return Err(BankError::validation("loan policy rates must be below 100%"));
        }
        if self.loans.late_fee_floor.is_negative() {
            return Err(BankError::validation("loans.late_fee_floor must not be negative"));
        }
        if self.retry.max_attempts == 0 {
            return Err(BankError::validation("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}
