use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry, AuditOutcome};
use crate::context::EngineContext;
use crate::errors::{BankError, Result};
use crate::notify::Notification;
use crate::transfers::load_owned_account;
use crate::types::{AccountId, Actor, LoanId, LoanStatus, PaymentType, UserId};
use crate::validation::validate_payment_day;

use super::servicing::{LoanServicer, PaymentRequest};
use super::{ensure_active, load_owned_loan, update_loan_with_retry, BatchOutcome, BatchSummary, Loan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoPaymentSettings {
    pub account_id: AccountId,
    /// day of month, 1-28
    pub payment_day: u32,
}

/// auto-payment enrollment and the daily collection run
#[derive(Debug, Clone)]
pub struct AutoPayment {
    ctx: EngineContext,
    servicer: LoanServicer,
}

impl AutoPayment {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            servicer: LoanServicer::new(ctx.clone()),
            ctx,
        }
    }

    pub fn enable(
        &self,
        caller: UserId,
        loan_id: LoanId,
        settings: AutoPaymentSettings,
        time: &SafeTimeProvider,
    ) -> Result<Loan> {
        let now = time.now();
        let result = self.run_enable(caller, loan_id, settings, now);
        self.audit(caller, loan_id, AuditAction::AutoPaymentEnabled, &result, now);
        result
    }

    fn run_enable(&self, caller: UserId, loan_id: LoanId, settings: AutoPaymentSettings, now: DateTime<Utc>) -> Result<Loan> {
        validate_payment_day(settings.payment_day)?;
        let loan = load_owned_loan(&self.ctx, caller, loan_id)?;
        ensure_active(&loan)?;
        // due days past the 28th clamp to month end, so any valid payment day precedes them
        if settings.payment_day > loan.start_date.day() {
            return Err(BankError::validation(format!(
                "payment day must fall on or before the loan's due day ({})",
                loan.start_date.day()
            )));
        }
        let account = load_owned_account(&self.ctx, caller, settings.account_id)?;
        if !account.is_active() {
            return Err(BankError::validation("auto-payment account is not active"));
        }

        let change = update_loan_with_retry(self.ctx.loans.as_ref(), loan_id, &self.ctx.config.retry, |current| {
            ensure_active(current)?;
            Ok(Some(Loan {
                auto_payment_enabled: true,
                auto_payment_account_id: Some(account.id),
                auto_payment_day: Some(settings.payment_day),
                ..current.clone()
            }))
        })?
        .ok_or_else(|| BankError::conflict("auto-payment could not be enabled"))?;

        tracing::info!(loan_id = %loan_id, payment_day = settings.payment_day, at = %now, "auto-payment enabled");
        self.ctx.notify(Notification::AutoPaymentEnabled {
            recipient: caller,
            loan_id,
            account: account.masked_number(),
            payment_day: settings.payment_day,
        });
        Ok(change.after)
    }

    /// Turn auto-payment off. Disabling an already disabled loan is a no-op.
    pub fn disable(&self, caller: UserId, loan_id: LoanId, time: &SafeTimeProvider) -> Result<Loan> {
        let now = time.now();
        let result = self.run_disable(caller, loan_id);
        self.audit(caller, loan_id, AuditAction::AutoPaymentDisabled, &result, now);
        result
    }

    fn run_disable(&self, caller: UserId, loan_id: LoanId) -> Result<Loan> {
        let loan = load_owned_loan(&self.ctx, caller, loan_id)?;
        let change = update_loan_with_retry(self.ctx.loans.as_ref(), loan_id, &self.ctx.config.retry, |current| {
            if !current.auto_payment_enabled && current.auto_payment_account_id.is_none() {
                return Ok(None);
            }
            Ok(Some(Loan {
                auto_payment_enabled: false,
                auto_payment_account_id: None,
                auto_payment_day: None,
                ..current.clone()
            }))
        })?;

        match change {
            Some(change) => {
                tracing::info!(loan_id = %loan_id, "auto-payment disabled");
                self.ctx.notify(Notification::AutoPaymentDisabled {
                    recipient: caller,
                    loan_id,
                });
                Ok(change.after)
            }
            None => Ok(loan),
        }
    }

    /// Collect today's auto-payments.
    ///
    /// On its payment day a loan pays the installment falling due before the
    /// next payment day, so the draw lands on or ahead of the due date. A loan
    /// already paid today is left alone, which keeps a second run on the same
    /// day from collecting again.
    pub fn run_due(&self, time: &SafeTimeProvider) -> Result<BatchSummary> {
        let today = time.now().date_naive();
        let mut summary = BatchSummary::default();

        let due: Vec<Loan> = self
            .ctx
            .loans
            .loans_by_status(LoanStatus::Active)?
            .into_iter()
            .filter(|l| l.auto_payment_enabled && l.auto_payment_day == Some(today.day()))
            .filter(|l| l.last_payment_date != Some(today))
            .filter(|l| matches!(l.next_payment_date, Some(d) if collects_before(d, today)))
            .collect();

        for loan in due {
            let Some(account_id) = loan.auto_payment_account_id else {
                summary.push(
                    loan.id,
                    BatchOutcome::Skipped {
                        reason: "no auto-payment account".to_string(),
                    },
                );
                continue;
            };
            let request = PaymentRequest {
                funding_account_id: account_id,
                amount: None,
            };
            let outcome = match self.servicer.pay(loan.owner_id, loan.id, &request, PaymentType::Auto, time) {
                Ok(receipt) => BatchOutcome::Processed { amount: receipt.amount },
                Err(e) => {
                    tracing::warn!(loan_id = %loan.id, error = %e, "auto-payment failed");
                    BatchOutcome::Failed { error: e.to_string() }
                }
            };
            summary.push(loan.id, outcome);
        }

        tracing::info!(
            processed = summary.processed_count,
            failed = summary.failed_count,
            total = %summary.total_processed(),
            "auto-payment run finished"
        );
        Ok(summary)
    }

    fn audit(&self, caller: UserId, loan_id: LoanId, action: AuditAction, result: &Result<Loan>, now: DateTime<Utc>) {
        let outcome = match result {
            Ok(_) => AuditOutcome::Success,
            Err(e) => AuditOutcome::rejected(e),
        };
        self.ctx
            .record(AuditEntry::new(Actor::User(caller), action, outcome, now).subject(loan_id));
    }
}

/// true when `due` falls before the payment day one month after `today`
fn collects_before(due: NaiveDate, today: NaiveDate) -> bool {
    match today.checked_add_months(Months::new(1)) {
        Some(next_run) => due < next_run,
        None => due <= today,
    }
}
