//! Reference numbers and identifiers.
//!
//! References double as idempotency keys, so they have to be unique across
//! processes. They are built from a UUIDv7 (millisecond timestamp followed by
//! random bits, monotonic within a process) behind a short human-readable
//! prefix that support staff can search for.

use uuid::Uuid;

use crate::errors::{BankError, Result};
use crate::types::TransferGroupId;

pub const INTERNAL_PREFIX: &str = "TRF";
pub const EXTERNAL_PREFIX: &str = "EXT";
pub const WIRE_PREFIX: &str = "WIRE";
pub const PAYOFF_PREFIX: &str = "PAYOFF";
pub const LOAN_PAYMENT_PREFIX: &str = "LNPMT";
pub const LATE_FEE_PREFIX: &str = "LATEFEE";

/// generate a fresh reference such as `EXT-01920C3B7F5A7C2D9E0F112233445566`
pub fn generate(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::now_v7().simple().to_string().to_uppercase())
}

/// derive a deterministic reference from a caller-supplied idempotency key
pub fn from_idempotency_key(prefix: &str, key: &str) -> Result<String> {
    let key = key.trim();
    if key.len() < 8 || key.len() > 64 {
        return Err(BankError::validation("idempotency key must be 8-64 characters"));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(BankError::validation(
            "idempotency key may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(format!("{}-{}", prefix, key.to_uppercase()))
}

pub fn new_transfer_group() -> TransferGroupId {
    Uuid::now_v7()
}

/// debit leg of an internal transfer
pub fn debit_leg(base: &str) -> String {
    format!("{}-DR", base)
}

/// credit leg of an internal transfer
pub fn credit_leg(base: &str) -> String {
    format!("{}-CR", base)
}

/// reference for the n-th attempt under one idempotency key; the first
/// attempt keeps the bare reference
pub fn attempt(base: &str, n: u32) -> String {
    if n <= 1 {
        base.to_string()
    } else {
        format!("{}-A{}", base, n)
    }
}

/// ledger row that reverses a previously posted row
pub fn reversal_of(reference: &str) -> String {
    format!("{}-RV", reference)
}
