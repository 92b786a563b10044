//! Append-only audit trail.
//!
//! Every mutating operation records exactly one entry, whether it succeeded,
//! was rejected, or was rolled back.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Money;
use crate::errors::{BankError, ErrorKind, Result};
use crate::ledger::BalanceChange;
use crate::types::{AccountId, Actor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    InternalTransfer,
    ExternalTransfer,
    WireInitiated,
    WireCompleted,
    WireSettled,
    WireFailed,
    EarlyPayoff,
    LateFeeAssessed,
    LoanPayment,
    AutoPaymentEnabled,
    AutoPaymentDisabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// refused before anything was written
    Rejected { kind: ErrorKind, message: String },
    /// failed midway and every applied step was undone
    RolledBack { kind: ErrorKind, message: String },
    /// failed midway and at least one undo step failed too
    CompensationFailed { message: String },
}

impl AuditOutcome {
    pub fn rejected(error: &BankError) -> Self {
        AuditOutcome::Rejected {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn rolled_back(error: &BankError) -> Self {
        AuditOutcome::RolledBack {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AuditOutcome::Success)
    }
}

/// balance of one account around an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub account_id: AccountId,
    pub before: Money,
    pub after: Money,
}

impl From<BalanceChange> for BalanceSnapshot {
    fn from(change: BalanceChange) -> Self {
        Self {
            account_id: change.account_id,
            before: change.before,
            after: change.after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub actor: Actor,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    /// the loan, wire or account the operation targeted
    pub subject_id: Option<Uuid>,
    pub reference: Option<String>,
    pub amount: Option<Money>,
    pub balances: Vec<BalanceSnapshot>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(actor: Actor, action: AuditAction, outcome: AuditOutcome, recorded_at: DateTime<Utc>) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            actor,
            action,
            outcome,
            subject_id: None,
            reference: None,
            amount: None,
            balances: Vec::new(),
            recorded_at,
        }
    }

    pub fn subject(mut self, id: Uuid) -> Self {
        self.subject_id = Some(id);
        self
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn amount(mut self, amount: Money) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn balance(mut self, snapshot: impl Into<BalanceSnapshot>) -> Self {
        self.balances.push(snapshot.into());
        self
    }
}

/// append-only audit store
pub trait AuditLog: Send + Sync {
    fn append(&self, entry: AuditEntry) -> Result<()>;
}

/// in-memory audit log
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn entries_for(&self, action: AuditAction) -> Vec<AuditEntry> {
        self.entries().into_iter().filter(|e| e.action == action).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditLog for MemoryAuditLog {
    fn append(&self, entry: AuditEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| BankError::system("audit log unavailable"))?
            .push(entry);
        Ok(())
    }
}
