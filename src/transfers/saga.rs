//! Compensation log for multi-step money movements.
//!
//! The stores only offer single-row conditional writes, so an operation that
//! touches several rows records each applied step here. When a later step
//! fails the log is unwound in reverse order, re-applying the inverse balance
//! deltas with the same compare-and-swap retry as the forward path.

use chrono::{DateTime, Utc};

use crate::audit::{AuditEntry, AuditOutcome};
use crate::context::EngineContext;
use crate::decimal::Money;
use crate::errors::{BankError, Result};
use crate::ledger::{self, BalanceChange, Posting, Transaction, WireTransfer};
use crate::loans::Loan;
use crate::reference;
use crate::store::StoreError;
use crate::types::{AccountId, TransactionType, WireStatus, WireTransferId};

/// an applied mutation and how to undo it
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// undoes a debit; `posted_reference` is set once the ledger row was written
    CreditBack {
        account_id: AccountId,
        amount: Money,
        posted_reference: Option<String>,
    },
    /// undoes a credit
    DebitBack {
        account_id: AccountId,
        amount: Money,
        posted_reference: Option<String>,
    },
    /// puts a loan row back the way it was
    RestoreLoan { previous: Loan, applied_version: u64 },
    /// marks a wire failed after its code was spent
    FailWire { transfer_id: WireTransferId, reason: String },
    /// puts a wire row back the way it was
    RestoreWire { previous: WireTransfer, applied_version: u64 },
}

/// result of unwinding a failed operation
#[derive(Debug, Clone, PartialEq)]
pub struct Unwound {
    /// what the caller gets back
    pub error: BankError,
    pub outcome: AuditOutcome,
}

pub struct Saga<'a> {
    ctx: &'a EngineContext,
    operation: &'static str,
    now: DateTime<Utc>,
    steps: Vec<Step>,
}

impl<'a> Saga<'a> {
    pub fn new(ctx: &'a EngineContext, operation: &'static str, now: DateTime<Utc>) -> Self {
        Self {
            ctx,
            operation,
            now,
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn debited(&mut self, change: &BalanceChange, amount: Money) {
        self.record(Step::CreditBack {
            account_id: change.account_id,
            amount,
            posted_reference: None,
        });
    }

    pub fn credited(&mut self, change: &BalanceChange, amount: Money) {
        self.record(Step::DebitBack {
            account_id: change.account_id,
            amount,
            posted_reference: None,
        });
    }

    /// remember that the balance move on `account_id` now has a ledger row
    pub fn posted(&mut self, account_id: AccountId, reference: &str) {
        for step in self.steps.iter_mut().rev() {
            match step {
                Step::CreditBack { account_id: id, posted_reference, .. }
                | Step::DebitBack { account_id: id, posted_reference, .. }
                    if *id == account_id && posted_reference.is_none() =>
                {
                    *posted_reference = Some(reference.to_string());
                    return;
                }
                _ => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Undo every recorded step, newest first.
    ///
    /// Steps are all attempted even if one fails; any failure turns the
    /// result into a system error since the books may now be inconsistent.
    pub fn unwind(self, cause: BankError) -> Unwound {
        if self.steps.is_empty() {
            return Unwound {
                outcome: AuditOutcome::rejected(&cause),
                error: cause,
            };
        }

        let mut failures = Vec::new();
        for step in self.steps.iter().rev() {
            if let Err(e) = self.undo(step) {
                tracing::error!(
                    operation = self.operation,
                    step = ?step,
                    error = %e,
                    "compensation step failed"
                );
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            tracing::warn!(
                operation = self.operation,
                steps = self.steps.len(),
                cause = %cause,
                "operation rolled back"
            );
            Unwound {
                outcome: AuditOutcome::rolled_back(&cause),
                error: cause,
            }
        } else {
            Unwound {
                outcome: AuditOutcome::CompensationFailed {
                    message: format!("{}; compensation errors: {}", cause, failures.join("; ")),
                },
                error: BankError::system(format!("{} failed and could not be fully reversed", self.operation)),
            }
        }
    }

    /// Unwind, record the audit entry built from the outcome, and hand back
    /// the error for the caller.
    pub fn abort<F>(self, cause: BankError, entry: F) -> BankError
    where
        F: FnOnce(AuditOutcome) -> AuditEntry,
    {
        let ctx = self.ctx;
        let unwound = self.unwind(cause);
        ctx.record(entry(unwound.outcome));
        unwound.error
    }

    fn undo(&self, step: &Step) -> Result<()> {
        let retry = &self.ctx.config.retry;
        match step {
            Step::CreditBack {
                account_id,
                amount,
                posted_reference,
            } => {
                let change = ledger::credit(self.ctx.ledger.as_ref(), *account_id, *amount, Posting::Compensation, retry)?;
                if let Some(original) = posted_reference {
                    self.post_reversal(&change, TransactionType::Credit, *amount, original)?;
                }
                Ok(())
            }
            Step::DebitBack {
                account_id,
                amount,
                posted_reference,
            } => {
                let change = ledger::debit(self.ctx.ledger.as_ref(), *account_id, *amount, Posting::Compensation, retry)?;
                if let Some(original) = posted_reference {
                    self.post_reversal(&change, TransactionType::Debit, *amount, original)?;
                }
                Ok(())
            }
            Step::RestoreLoan {
                previous,
                applied_version,
            } => {
                self.ctx.loans.update_loan(previous, *applied_version)?;
                Ok(())
            }
            Step::FailWire { transfer_id, reason } => {
                let wire = self.ctx.ledger.wire_transfer(*transfer_id)?;
                if !wire.status.can_transition_to(WireStatus::Failed) {
                    return Ok(());
                }
                let mut failed = wire.clone();
                failed.status = WireStatus::Failed;
                failed.failure_reason = Some(reason.clone());
                failed.updated_at = self.now;
                self.ctx.ledger.update_wire_transfer(&failed, wire.version)?;
                Ok(())
            }
            Step::RestoreWire {
                previous,
                applied_version,
            } => {
                self.ctx.ledger.update_wire_transfer(previous, *applied_version)?;
                Ok(())
            }
        }
    }

    fn post_reversal(&self, change: &BalanceChange, kind: TransactionType, amount: Money, original: &str) -> Result<()> {
        let row = Transaction::posted(
            change,
            kind,
            amount,
            reference::reversal_of(original),
            Some(format!("reversal of {}", original)),
            self.now,
        );
        match self.ctx.ledger.insert_transaction(&row) {
            Ok(()) => Ok(()),
            Err(StoreError::Duplicate { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
