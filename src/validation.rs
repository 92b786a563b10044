//! Stateless input checks run before any state is read or written.

use crate::config::{EngineConfig, TransferPolicy};
use crate::decimal::Money;
use crate::errors::{BankError, Result};

const ABA_WEIGHTS: [u32; 3] = [3, 7, 1];

/// input validation gate
#[derive(Debug, Clone)]
pub struct ValidationGate {
    config: EngineConfig,
}

impl ValidationGate {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// positive, whole cents, within [min, max]
    pub fn validate_amount(&self, amount: Money, max: Money) -> Result<()> {
        validate_amount_bounds(amount, self.config.transfers.min_amount, max)
    }

    pub fn validate_internal_amount(&self, amount: Money) -> Result<()> {
        self.validate_amount(amount, self.config.transfers.max_internal_amount)
    }

    /// the external ceiling is a hard stop; larger transfers go to manual review
    pub fn validate_external_amount(&self, amount: Money) -> Result<()> {
        let policy: &TransferPolicy = &self.config.transfers;
        if amount > policy.external_ceiling {
            return Err(BankError::validation(format!(
                "external transfers are limited to {}; larger amounts require manual review",
                policy.external_ceiling
            )));
        }
        self.validate_amount(amount, policy.external_ceiling)
    }

    pub fn validate_wire_amount(&self, amount: Money) -> Result<()> {
        self.validate_amount(amount, self.config.wire.max_amount)
    }

    pub fn validate_memo(&self, memo: Option<&str>) -> Result<()> {
        match memo {
            Some(m) if m.chars().count() > self.config.transfers.memo_max_len => Err(BankError::validation(format!(
                "memo must be at most {} characters",
                self.config.transfers.memo_max_len
            ))),
            _ => Ok(()),
        }
    }

    pub fn validate_verification_code(&self, code: &str) -> Result<()> {
        let len = self.config.wire.code_length as usize;
        if code.len() != len || !is_all_digits(code) {
            return Err(BankError::validation(format!("verification code must be {} digits", len)));
        }
        Ok(())
    }
}

pub fn validate_amount_bounds(amount: Money, min: Money, max: Money) -> Result<()> {
    if !amount.is_positive() {
        return Err(BankError::validation("amount must be greater than zero"));
    }
    if amount.scale() > 2 {
        return Err(BankError::validation("amount must not have more than 2 decimal places"));
    }
    if amount < min {
        return Err(BankError::validation(format!("amount must be at least {}", min)));
    }
    if amount > max {
        return Err(BankError::validation(format!("amount must not exceed {}", max)));
    }
    Ok(())
}

/// 9 digits whose 3-7-1 weighted sum is divisible by 10
pub fn validate_routing_number(routing: &str) -> Result<()> {
    if routing.len() != 9 || !is_all_digits(routing) {
        return Err(BankError::validation("routing number must be exactly 9 digits"));
    }
    if !aba_checksum_ok(routing) {
        return Err(BankError::validation("routing number failed checksum validation"));
    }
    Ok(())
}

pub fn aba_checksum_ok(routing: &str) -> bool {
    let sum: u32 = routing
        .chars()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| d * ABA_WEIGHTS[i % 3])
        .sum();
    sum % 10 == 0
}

pub fn validate_account_number(account_number: &str) -> Result<()> {
    if !(4..=17).contains(&account_number.len()) || !is_all_digits(account_number) {
        return Err(BankError::validation("account number must be 4-17 digits"));
    }
    Ok(())
}

pub fn validate_payment_day(day: u32) -> Result<()> {
    if !(1..=28).contains(&day) {
        return Err(BankError::validation("payment day must be between 1 and 28"));
    }
    Ok(())
}

pub fn validate_beneficiary_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(BankError::validation("beneficiary name is required"));
    }
    if trimmed.chars().count() > 100 {
        return Err(BankError::validation("beneficiary name must be at most 100 characters"));
    }
    Ok(())
}

/// optional 8 or 11 character SWIFT/BIC
pub fn validate_swift_code(swift: &str) -> Result<()> {
    let ok = swift.is_ascii()
        && (swift.len() == 8 || swift.len() == 11)
        && swift[..6].chars().all(|c| c.is_ascii_uppercase())
        && swift[6..].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if !ok {
        return Err(BankError::validation("SWIFT code must be 8 or 11 characters"));
    }
    Ok(())
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ValidationGate {
        ValidationGate::new(EngineConfig::default())
    }

    #[test]
    fn test_aba_checksum() {
        assert!(validate_routing_number("021000021").is_ok());
        assert!(validate_routing_number("011000015").is_ok());
        assert!(validate_routing_number("123456789").is_err());
        assert!(validate_routing_number("02100002").is_err());
        assert!(validate_routing_number("02100002a").is_err());
    }

    #[test]
    fn test_account_number_shape() {
        assert!(validate_account_number("1234").is_ok());
        assert!(validate_account_number("12345678901234567").is_ok());
        assert!(validate_account_number("123").is_err());
        assert!(validate_account_number("123456789012345678").is_err());
        assert!(validate_account_number("12-34").is_err());
    }

    #[test]
    fn test_amount_bounds() {
        let gate = gate();
        assert!(gate.validate_internal_amount(Money::from_major(100)).is_ok());
        assert!(gate.validate_internal_amount(Money::ZERO).is_err());
        assert!(gate.validate_internal_amount(Money::from_major(-5)).is_err());
        assert!(gate.validate_internal_amount(Money::from_str_exact("1.005").unwrap()).is_err());
        assert!(gate.validate_internal_amount(Money::from_str_exact("1.50").unwrap()).is_ok());
    }

    #[test]
    fn test_external_ceiling() {
        let gate = gate();
        assert!(gate.validate_external_amount(Money::from_major(10_000)).is_ok());
        let err = gate.validate_external_amount(Money::from_major(15_000)).unwrap_err();
        assert!(err.to_string().contains("manual review"));
    }

    #[test]
    fn test_verification_code_format() {
        let gate = gate();
        assert!(gate.validate_verification_code("123456").is_ok());
        assert!(gate.validate_verification_code("12345").is_err());
        assert!(gate.validate_verification_code("12a456").is_err());
    }

    #[test]
    fn test_misc_fields() {
        assert!(validate_payment_day(1).is_ok());
        assert!(validate_payment_day(28).is_ok());
        assert!(validate_payment_day(29).is_err());
        assert!(validate_payment_day(0).is_err());
        assert!(validate_beneficiary_name("  ").is_err());
        assert!(validate_swift_code("DEUTDEFF").is_ok());
        assert!(validate_swift_code("DEUTDEFF500").is_ok());
        assert!(validate_swift_code("DEUT").is_err());
        assert!(gate().validate_memo(Some(&"x".repeat(256))).is_err());
    }
}
