//! Loan accounting: schedules, payoff, late fees, auto-payment and
//! installment servicing.

pub mod amortization;
pub mod autopay;
pub mod late_fee;
pub mod payoff;
pub mod servicing;
pub mod waterfall;

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::context::EngineContext;
use crate::decimal::{Money, Rate};
use crate::errors::{BankError, Result};
use crate::store::{LoanStore, StoreError};
use crate::types::{
    AccountId, LoanId, LoanPaymentId, LoanStatus, PaymentType, TransactionStatus, UserId,
};

pub use amortization::{AmortizationSchedule, ScheduleRow};
pub use autopay::{AutoPayment, AutoPaymentSettings};
pub use late_fee::LateFeeAssessor;
pub use payoff::{EarlyPayoffCalculator, PayoffQuote, PayoffSettlement};
pub use servicing::{InstallmentReceipt, LoanServicer, PaymentRequest};

/// loan record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    /// disbursement and default repayment account
    pub account_id: AccountId,
    pub owner_id: UserId,
    pub principal: Money,
    /// annual rate as a fraction
    pub interest_rate: Rate,
    pub term_months: u32,
    pub monthly_payment: Option<Money>,
    /// unpaid principal plus unpaid late fees
    pub remaining_balance: Money,
    pub status: LoanStatus,
    pub payments_made: u32,
    pub is_late: bool,
    /// late fees assessed and not yet paid
    pub late_fee_amount: Money,
    pub auto_payment_enabled: bool,
    pub auto_payment_account_id: Option<AccountId>,
    pub auto_payment_day: Option<u32>,
    pub start_date: NaiveDate,
    pub next_payment_date: Option<NaiveDate>,
    pub last_payment_date: Option<NaiveDate>,
    pub version: u64,
}

impl Loan {
    /// active loan as created on approval, first installment due one month after start
    pub fn originate(
        owner_id: UserId,
        account_id: AccountId,
        principal: Money,
        interest_rate: Rate,
        term_months: u32,
        start_date: NaiveDate,
    ) -> Result<Self> {
        if !principal.is_positive() {
            return Err(BankError::validation("loan principal must be positive"));
        }
        if term_months == 0 {
            return Err(BankError::validation("loan term must be at least one month"));
        }
        if interest_rate < Rate::ZERO {
            return Err(BankError::validation("interest rate must not be negative"));
        }

        let payment = amortization::monthly_payment(principal, interest_rate, term_months)?;
        Ok(Self {
            id: Uuid::new_v4(),
            account_id,
            owner_id,
            principal,
            interest_rate,
            term_months,
            monthly_payment: Some(payment.round_cents()),
            remaining_balance: principal,
            status: LoanStatus::Active,
            payments_made: 0,
            is_late: false,
            late_fee_amount: Money::ZERO,
            auto_payment_enabled: false,
            auto_payment_account_id: None,
            auto_payment_day: None,
            start_date,
            next_payment_date: Some(due_date(start_date, 1)?),
            last_payment_date: None,
            version: 0,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == LoanStatus::Active
    }

    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.owner_id == user
    }

    /// stored installment, or the annuity payment when none was stored
    pub fn installment_amount(&self) -> Result<Money> {
        match self.monthly_payment {
            Some(payment) => Ok(payment),
            None => Ok(amortization::monthly_payment(self.principal, self.interest_rate, self.term_months)?.round_cents()),
        }
    }

    /// remaining balance net of unpaid late fees
    pub fn principal_outstanding(&self) -> Money {
        (self.remaining_balance - self.late_fee_amount).max(Money::ZERO)
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        matches!(self.next_payment_date, Some(due) if due < today)
    }

    /// due date of installment `month` (1-based)
    pub fn due_date(&self, month: u32) -> Result<NaiveDate> {
        due_date(self.start_date, month)
    }
}

/// `start + month` months, clamped to the last day of the target month
pub fn due_date(start: NaiveDate, month: u32) -> Result<NaiveDate> {
    start
        .checked_add_months(Months::new(month))
        .ok_or_else(|| BankError::validation("loan due date out of range"))
}

/// loan payment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanPayment {
    pub id: LoanPaymentId,
    pub loan_id: LoanId,
    pub amount: Money,
    pub principal_amount: Money,
    pub interest_amount: Money,
    pub late_fee: Money,
    pub payment_type: PaymentType,
    pub status: TransactionStatus,
    pub payment_date: DateTime<Utc>,
    pub balance_after: Money,
    /// schedule row this payment settles
    pub installment_number: Option<u32>,
    pub reference: String,
}

impl LoanPayment {
    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }
}

/// sum of principal settled by completed payments
pub fn principal_paid(payments: &[LoanPayment]) -> Money {
    payments
        .iter()
        .filter(|p| p.is_completed())
        .map(|p| p.principal_amount)
        .sum()
}

/// what happened to one loan during a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BatchOutcome {
    Processed { amount: Money },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDetail {
    pub loan_id: LoanId,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

/// Result of a scheduler-triggered run. One loan failing never stops the
/// rest of the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub details: Vec<BatchDetail>,
}

impl BatchSummary {
    pub fn push(&mut self, loan_id: LoanId, outcome: BatchOutcome) {
        match outcome {
            BatchOutcome::Processed { .. } => self.processed_count += 1,
            BatchOutcome::Skipped { .. } => self.skipped_count += 1,
            BatchOutcome::Failed { .. } => self.failed_count += 1,
        }
        self.details.push(BatchDetail { loan_id, outcome });
    }

    pub fn total_processed(&self) -> Money {
        self.details
            .iter()
            .map(|d| match d.outcome {
                BatchOutcome::Processed { amount } => amount,
                _ => Money::ZERO,
            })
            .sum()
    }
}

/// loan lookup that hides other customers' loans behind NotFound
pub(crate) fn load_owned_loan(ctx: &EngineContext, caller: UserId, loan_id: LoanId) -> Result<Loan> {
    match ctx.loans.loan(loan_id) {
        Ok(loan) if loan.is_owned_by(caller) => Ok(loan),
        Ok(_) | Err(StoreError::NotFound { .. }) => Err(BankError::not_found("Loan", loan_id)),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn ensure_active(loan: &Loan) -> Result<()> {
    if !loan.is_active() {
        return Err(BankError::conflict(format!("loan is {:?}, not active", loan.status).to_lowercase()));
    }
    Ok(())
}

/// loan row before and after a successful conditional update
#[derive(Debug, Clone)]
pub(crate) struct LoanChange {
    pub before: Loan,
    pub after: Loan,
}

/// Late-fee charges are pending until a payment clears the fees they added.
pub(crate) fn settle_fee_charges(ctx: &EngineContext, change: &LoanChange) -> Result<()> {
    if change.before.late_fee_amount.is_positive() && change.after.late_fee_amount.is_zero() {
        let settled = ctx.loans.settle_late_fee_charges(change.after.id)?;
        tracing::debug!(loan_id = %change.after.id, settled, "late-fee charges settled");
    }
    Ok(())
}

/// Read-modify-write on a loan with compare-and-swap.
///
/// `mutate` sees the freshly read row on every attempt and returns the row to
/// write, or `None` when there is nothing to do any more (for example another
/// writer already applied the change).
pub(crate) fn update_loan_with_retry<F>(
    store: &dyn LoanStore,
    loan_id: LoanId,
    retry: &RetryPolicy,
    mut mutate: F,
) -> Result<Option<LoanChange>>
where
    F: FnMut(&Loan) -> Result<Option<Loan>>,
{
    for attempt in 1..=retry.max_attempts {
        let before = store.loan(loan_id)?;
        let Some(next) = mutate(&before)? else {
            return Ok(None);
        };

        match store.update_loan(&next, before.version) {
            Ok(after) => return Ok(Some(LoanChange { before, after })),
            Err(StoreError::VersionConflict { .. }) => {
                tracing::debug!(loan_id = %loan_id, attempt, "loan update lost a race, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::warn!(loan_id = %loan_id, attempts = retry.max_attempts, "loan update retries exhausted");
    Err(BankError::conflict("loan is busy, please retry"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{Fault, MemoryStore};

    fn loan() -> Loan {
        Loan::originate(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Money::from_major(10_000),
            Rate::from_percentage(6),
            12,
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_origination() {
        let loan = loan();
        assert_eq!(loan.monthly_payment, Some(Money::from_cents(86066)));
        assert_eq!(loan.remaining_balance, Money::from_major(10_000));
        // jan 31 + 1 month clamps to the end of february
        assert_eq!(loan.next_payment_date, NaiveDate::from_ymd_opt(2024, 2, 29));
        assert!(loan.is_active());
    }

    #[test]
    fn test_origination_rejects_bad_terms() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(Loan::originate(Uuid::new_v4(), Uuid::new_v4(), Money::ZERO, Rate::ZERO, 12, start).is_err());
        assert!(Loan::originate(Uuid::new_v4(), Uuid::new_v4(), Money::from_major(1), Rate::ZERO, 0, start).is_err());
    }

    #[test]
    fn test_overdue() {
        let loan = loan();
        assert!(!loan.is_overdue(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()));
        assert!(loan.is_overdue(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
    }

    #[test]
    fn test_update_retries_then_skips() {
        let store = MemoryStore::new();
        let loan = loan();
        store.insert_loan(loan.clone()).unwrap();
        store.inject(Fault::StaleLoan(loan.id));

        let change = update_loan_with_retry(&store, loan.id, &RetryPolicy::default(), |l| {
            if l.is_late {
                return Ok(None);
            }
            Ok(Some(Loan { is_late: true, ..l.clone() }))
        })
        .unwrap()
        .unwrap();
        assert!(change.after.is_late);
        assert_eq!(change.after.version, 1);

        let again = update_loan_with_retry(&store, loan.id, &RetryPolicy::default(), |l| {
            if l.is_late {
                return Ok(None);
            }
            Ok(Some(l.clone()))
        })
        .unwrap();
        assert!(again.is_none());
    }
}
