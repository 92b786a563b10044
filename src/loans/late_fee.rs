use chrono::{DateTime, NaiveDate, Utc};
use hourglass_rs::SafeTimeProvider;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditOutcome};
use crate::config::LoanPolicy;
use crate::context::EngineContext;
use crate::decimal::Money;
use crate::errors::Result;
use crate::notify::Notification;
use crate::reference;
use crate::transfers::{Saga, Step};
use crate::types::{Actor, LoanStatus, PaymentType, TransactionStatus};

use super::{update_loan_with_retry, BatchOutcome, BatchSummary, Loan, LoanPayment};

/// late fee for one missed installment, rounded to cents
pub fn late_fee_for(loan: &Loan, policy: &LoanPolicy) -> Result<Money> {
    let installment = loan.installment_amount()?;
    Ok(installment.apply(policy.late_fee_rate).max(policy.late_fee_floor).round_cents())
}

/// Scheduler job that flags overdue loans and charges the late fee.
///
/// Each loan is handled on its own: a conditional update that re-checks the
/// late flag means two concurrent runs charge a loan at most once.
#[derive(Debug, Clone)]
pub struct LateFeeAssessor {
    ctx: EngineContext,
}

impl LateFeeAssessor {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub fn assess(&self, time: &SafeTimeProvider) -> Result<BatchSummary> {
        let now = time.now();
        let today = now.date_naive();
        let mut summary = BatchSummary::default();

        let candidates: Vec<Loan> = self
            .ctx
            .loans
            .loans_by_status(LoanStatus::Active)?
            .into_iter()
            .filter(|l| !l.is_late && l.is_overdue(today))
            .collect();

        for loan in candidates {
            let outcome = match self.assess_loan(&loan, today, now) {
                Ok(Some(fee)) => BatchOutcome::Processed { amount: fee },
                Ok(None) => BatchOutcome::Skipped {
                    reason: "already assessed or no longer overdue".to_string(),
                },
                Err(e) => {
                    tracing::error!(loan_id = %loan.id, error = %e, "late fee assessment failed");
                    BatchOutcome::Failed { error: e.to_string() }
                }
            };
            summary.push(loan.id, outcome);
        }

        tracing::info!(
            processed = summary.processed_count,
            skipped = summary.skipped_count,
            failed = summary.failed_count,
            "late fee run finished"
        );
        Ok(summary)
    }

    fn assess_loan(&self, loan: &Loan, today: NaiveDate, now: DateTime<Utc>) -> Result<Option<Money>> {
        let mut saga = Saga::new(&self.ctx, "late fee assessment", now);
        match self.run_assess(loan, today, now, &mut saga) {
            Ok(fee) => Ok(fee),
            Err(e) => Err(saga.abort(e, |outcome| {
                AuditEntry::new(Actor::System, AuditAction::LateFeeAssessed, outcome, now).subject(loan.id)
            })),
        }
    }

    fn run_assess(&self, loan: &Loan, today: NaiveDate, now: DateTime<Utc>, saga: &mut Saga<'_>) -> Result<Option<Money>> {
        let policy = &self.ctx.config.loans;
        let mut fee = Money::ZERO;

        let change = update_loan_with_retry(self.ctx.loans.as_ref(), loan.id, &self.ctx.config.retry, |current| {
            if !current.is_active() || current.is_late || !current.is_overdue(today) {
                return Ok(None);
            }
            fee = late_fee_for(current, policy)?;
            Ok(Some(Loan {
                is_late: true,
                late_fee_amount: current.late_fee_amount + fee,
                remaining_balance: current.remaining_balance + fee,
                ..current.clone()
            }))
        })?;
        let Some(change) = change else {
            return Ok(None);
        };
        saga.record(Step::RestoreLoan {
            previous: change.before.clone(),
            applied_version: change.after.version,
        });

        let reference = reference::generate(reference::LATE_FEE_PREFIX);
        let charge = LoanPayment {
            id: Uuid::new_v4(),
            loan_id: loan.id,
            amount: fee,
            principal_amount: Money::ZERO,
            interest_amount: Money::ZERO,
            late_fee: fee,
            payment_type: PaymentType::LateFee,
            status: TransactionStatus::Pending,
            payment_date: now,
            balance_after: change.after.remaining_balance,
            installment_number: None,
            reference: reference.clone(),
        };
        self.ctx.loans.insert_loan_payment(&charge)?;

        tracing::info!(loan_id = %loan.id, fee = %fee, reference = %reference, "late fee assessed");

        self.ctx.notify(Notification::LateFeeAssessed {
            recipient: change.after.owner_id,
            loan_id: loan.id,
            fee,
            due_date: change.before.next_payment_date,
        });
        self.ctx.record(
            AuditEntry::new(Actor::System, AuditAction::LateFeeAssessed, AuditOutcome::Success, now)
                .subject(loan.id)
                .reference(&reference)
                .amount(fee),
        );
        Ok(Some(fee))
    }
}
