//! Persistence abstraction.
//!
//! The stores expose single-row primitives only: reads, inserts, and
//! conditional updates keyed on the version observed by the caller. Nothing
//! here spans more than one row, so multi-step operations keep their own
//! compensation log (see `transfers::saga`).

pub mod memory;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::decimal::Money;
use crate::ledger::{Account, Transaction, VerificationCode, WireTransfer};
use crate::loans::{Loan, LoanPayment};
use crate::types::{AccountId, LoanId, LoanStatus, TransferGroupId, WireTransferId};

pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("version conflict on {entity} {id}")]
    VersionConflict { entity: String, id: String },

    #[error("record already exists: {entity} with key {key}")]
    Duplicate { entity: String, key: String },

    #[error("verification code for transfer {transfer_id} already consumed")]
    AlreadyConsumed { transfer_id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &str, id: impl ToString) -> Self {
        Self::VersionConflict {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn duplicate(entity: &str, key: impl ToString) -> Self {
        Self::Duplicate {
            entity: entity.to_string(),
            key: key.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// accounts, ledger rows and wire transfers
pub trait LedgerStore: Send + Sync {
    fn account(&self, id: AccountId) -> StoreResult<Account>;

    fn account_by_number(&self, account_number: &str) -> StoreResult<Account>;

    /// `UPDATE accounts SET balance = ?, version = version + 1 WHERE id = ? AND version = ?`
    fn update_balance(&self, id: AccountId, expected_version: u64, new_balance: Money) -> StoreResult<Account>;

    /// fails with `Duplicate` when the reference is already taken
    fn insert_transaction(&self, transaction: &Transaction) -> StoreResult<()>;

    fn transaction_by_reference(&self, reference: &str) -> StoreResult<Option<Transaction>>;

    fn transactions_for_account(&self, account_id: AccountId) -> StoreResult<Vec<Transaction>>;

    fn transactions_in_group(&self, group: TransferGroupId) -> StoreResult<Vec<Transaction>>;

    fn insert_wire_transfer(&self, wire: &WireTransfer) -> StoreResult<()>;

    fn wire_transfer(&self, id: WireTransferId) -> StoreResult<WireTransfer>;

    /// conditional on `expected_version`; returns the stored row with its new version
    fn update_wire_transfer(&self, wire: &WireTransfer, expected_version: u64) -> StoreResult<WireTransfer>;

    fn insert_verification_code(&self, code: &VerificationCode) -> StoreResult<()>;

    fn verification_code(&self, transfer_id: WireTransferId) -> StoreResult<VerificationCode>;

    /// marks the code used; `AlreadyConsumed` if another caller got there first
    fn consume_verification_code(&self, transfer_id: WireTransferId, at: DateTime<Utc>) -> StoreResult<VerificationCode>;

    /// counts one wrong guess and returns the updated code
    fn record_failed_code_attempt(&self, transfer_id: WireTransferId) -> StoreResult<VerificationCode>;
}

/// loans and their payment history
pub trait LoanStore: Send + Sync {
    fn loan(&self, id: LoanId) -> StoreResult<Loan>;

    fn loans_by_status(&self, status: LoanStatus) -> StoreResult<Vec<Loan>>;

    /// conditional on `expected_version`; returns the stored row with its new version
    fn update_loan(&self, loan: &Loan, expected_version: u64) -> StoreResult<Loan>;

    fn insert_loan_payment(&self, payment: &LoanPayment) -> StoreResult<()>;

    /// ordered by payment date
    fn loan_payments(&self, loan_id: LoanId) -> StoreResult<Vec<LoanPayment>>;

    /// marks every pending late-fee charge on the loan completed in one write;
    /// returns how many rows changed
    fn settle_late_fee_charges(&self, loan_id: LoanId) -> StoreResult<usize>;
}
