//! Deposit accounts, the append-only transaction ledger, and the conditional
//! balance update every money movement goes through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::decimal::Money;
use crate::errors::{BankError, Result};
use crate::store::{LedgerStore, StoreError};
use crate::types::{
    AccountId, AccountStatus, TransactionId, TransactionStatus, TransactionType, TransferGroupId,
    UserId, WireStatus, WireTransferId,
};

/// deposit account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner_id: UserId,
    pub account_number: String,
    pub balance: Money,
    pub status: AccountStatus,
    /// bumped by the store on every balance write
    pub version: u64,
}

impl Account {
    pub fn new(owner_id: UserId, account_number: impl Into<String>, balance: Money) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            account_number: account_number.into(),
            balance,
            status: AccountStatus::Active,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.owner_id == user
    }

    /// last four digits, for notifications
    pub fn masked_number(&self) -> String {
        mask_account_number(&self.account_number)
    }
}

pub fn mask_account_number(number: &str) -> String {
    let tail: String = number.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{}", tail)
}

/// immutable ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub transaction_type: TransactionType,
    pub amount: Money,
    pub status: TransactionStatus,
    /// globally unique, doubles as idempotency key
    pub reference: String,
    pub transfer_group_id: Option<TransferGroupId>,
    pub balance_before: Money,
    pub balance_after: Money,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// completed row built from an applied balance change
    pub fn posted(
        change: &BalanceChange,
        transaction_type: TransactionType,
        amount: Money,
        reference: String,
        description: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: change.account_id,
            transaction_type,
            amount,
            status: TransactionStatus::Completed,
            reference,
            transfer_group_id: None,
            balance_before: change.before,
            balance_after: change.after,
            description,
            created_at,
        }
    }

    pub fn in_group(mut self, group: TransferGroupId) -> Self {
        self.transfer_group_id = Some(group);
        self
    }
}

/// wire transfer awaiting or past verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTransfer {
    pub id: WireTransferId,
    pub owner_id: UserId,
    pub from_account_id: AccountId,
    pub beneficiary_name: String,
    pub beneficiary_bank: String,
    pub account_number: String,
    pub routing_number: String,
    pub swift_code: Option<String>,
    pub amount: Money,
    pub status: WireStatus,
    /// assigned when the transfer enters processing
    pub reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// one-time code bound to a single wire transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCode {
    pub transfer_id: WireTransferId,
    /// hex sha-256 of `<transfer_id>:<code>`
    pub code_digest: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    /// wrong codes entered so far
    #[serde(default)]
    pub failed_attempts: u32,
}

impl VerificationCode {
    pub fn issue(transfer_id: WireTransferId, code: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            transfer_id,
            code_digest: digest_code(transfer_id, code),
            expires_at,
            consumed_at: None,
            failed_attempts: 0,
        }
    }

    pub fn matches(&self, code: &str) -> bool {
        self.code_digest == digest_code(self.transfer_id, code)
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

fn digest_code(transfer_id: WireTransferId, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(transfer_id.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// balance snapshot around one conditional update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub account_id: AccountId,
    pub before: Money,
    pub after: Money,
}

/// how strictly a balance mutation checks the account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posting {
    /// normal customer movement: account must be active
    Regular,
    /// refunds and reversals: applied whatever the account status
    Compensation,
}

/// decrease a balance with compare-and-swap, re-reading on version conflicts
pub fn debit(
    store: &dyn LedgerStore,
    account_id: AccountId,
    amount: Money,
    posting: Posting,
    retry: &RetryPolicy,
) -> Result<BalanceChange> {
    apply_delta(store, account_id, -amount, posting, retry)
}

/// increase a balance with compare-and-swap, re-reading on version conflicts
pub fn credit(
    store: &dyn LedgerStore,
    account_id: AccountId,
    amount: Money,
    posting: Posting,
    retry: &RetryPolicy,
) -> Result<BalanceChange> {
    apply_delta(store, account_id, amount, posting, retry)
}

fn apply_delta(
    store: &dyn LedgerStore,
    account_id: AccountId,
    delta: Money,
    posting: Posting,
    retry: &RetryPolicy,
) -> Result<BalanceChange> {
    for attempt in 1..=retry.max_attempts {
        let account = store.account(account_id)?;
        if posting == Posting::Regular && !account.is_active() {
            return Err(BankError::validation(format!("account {} is not active", account.masked_number())));
        }

        let new_balance = account.balance + delta;
        if new_balance.is_negative() {
            return Err(BankError::insufficient_funds(-delta, account.balance));
        }

        match store.update_balance(account_id, account.version, new_balance) {
            Ok(updated) => {
                return Ok(BalanceChange {
                    account_id,
                    before: account.balance,
                    after: updated.balance,
                })
            }
            Err(StoreError::VersionConflict { .. }) => {
                tracing::debug!(
                    account_id = %account_id,
                    attempt,
                    "balance update lost a race, retrying"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::warn!(account_id = %account_id, attempts = retry.max_attempts, "balance update retries exhausted");
    Err(BankError::conflict("account is busy, please retry"))
}
