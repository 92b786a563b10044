use chrono::{DateTime, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditOutcome};
use crate::config::LoanPolicy;
use crate::context::EngineContext;
use crate::decimal::Money;
use crate::errors::{BankError, Result};
use crate::ledger::{self, Posting, Transaction};
use crate::notify::Notification;
use crate::reference;
use crate::transfers::{load_owned_account, Saga, Step};
use crate::types::{AccountId, Actor, LoanId, LoanStatus, PaymentType, TransactionStatus, TransactionType, UserId};

use super::{
    amortization, ensure_active, load_owned_loan, principal_paid, settle_fee_charges, update_loan_with_retry, Loan, LoanPayment,
};

/// early payoff figures for a loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoffQuote {
    pub loan_id: LoanId,
    pub outstanding_principal: Money,
    /// late fees and other charges already posted to the balance
    pub assessed_fees_and_interest: Money,
    pub discount: Money,
    pub payoff_amount: Money,
    /// scheduled interest no longer owed, plus the discount
    pub interest_waived: Money,
    pub remaining_term_months: u32,
}

/// settled early payoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoffSettlement {
    pub loan_id: LoanId,
    pub reference_number: String,
    pub amount_paid: Money,
    pub interest_waived: Money,
    pub new_account_balance: Money,
    pub loan_status: LoanStatus,
}

/// Pure payoff computation over the loan and its payment history.
pub fn quote(loan: &Loan, payments: &[LoanPayment], policy: &LoanPolicy) -> Result<PayoffQuote> {
    let outstanding = (loan.principal - principal_paid(payments)).max(Money::ZERO);
    let assessed = (loan.remaining_balance - outstanding).max(Money::ZERO);
    let discount = outstanding.apply(policy.early_payoff_discount).round_cents();
    let payoff_amount = (outstanding - discount + assessed).round_cents();

    let remaining_term = loan.term_months.saturating_sub(loan.payments_made);
    let remaining_interest = amortization::remaining_interest(outstanding, loan.interest_rate, remaining_term)?;

    Ok(PayoffQuote {
        loan_id: loan.id,
        outstanding_principal: outstanding.round_cents(),
        assessed_fees_and_interest: assessed.round_cents(),
        discount,
        payoff_amount,
        interest_waived: remaining_interest + discount,
        remaining_term_months: remaining_term,
    })
}

/// early payoff quotes and settlement
#[derive(Debug, Clone)]
pub struct EarlyPayoffCalculator {
    ctx: EngineContext,
}

impl EarlyPayoffCalculator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// quote for a loan the caller owns
    pub fn quote(&self, caller: UserId, loan_id: LoanId) -> Result<PayoffQuote> {
        let loan = load_owned_loan(&self.ctx, caller, loan_id)?;
        ensure_active(&loan)?;
        let payments = self.ctx.loans.loan_payments(loan_id)?;
        quote(&loan, &payments, &self.ctx.config.loans)
    }

    /// Pay the loan off from one of the caller's accounts.
    ///
    /// The loan is never left active with the account already debited: any
    /// failure after the debit refunds it and restores the loan row.
    pub fn execute(
        &self,
        caller: UserId,
        loan_id: LoanId,
        funding_account_id: AccountId,
        time: &SafeTimeProvider,
    ) -> Result<PayoffSettlement> {
        let now = time.now();
        let mut saga = Saga::new(&self.ctx, "early payoff", now);

        match self.run_execute(caller, loan_id, funding_account_id, now, &mut saga) {
            Ok(settlement) => Ok(settlement),
            Err(e) => Err(saga.abort(e, |outcome| {
                AuditEntry::new(Actor::User(caller), AuditAction::EarlyPayoff, outcome, now).subject(loan_id)
            })),
        }
    }

    fn run_execute(
        &self,
        caller: UserId,
        loan_id: LoanId,
        funding_account_id: AccountId,
        now: DateTime<Utc>,
        saga: &mut Saga<'_>,
    ) -> Result<PayoffSettlement> {
        let loan = load_owned_loan(&self.ctx, caller, loan_id)?;
        ensure_active(&loan)?;
        let account = load_owned_account(&self.ctx, caller, funding_account_id)?;
        if !account.is_active() {
            return Err(BankError::validation("funding account is not active"));
        }

        let payments = self.ctx.loans.loan_payments(loan_id)?;
        let quote = quote(&loan, &payments, &self.ctx.config.loans)?;
        if account.balance < quote.payoff_amount {
            return Err(BankError::insufficient_funds(quote.payoff_amount, account.balance));
        }

        let reference = reference::generate(reference::PAYOFF_PREFIX);
        let debit = ledger::debit(
            self.ctx.ledger.as_ref(),
            account.id,
            quote.payoff_amount,
            Posting::Regular,
            &self.ctx.config.retry,
        )?;
        saga.debited(&debit, quote.payoff_amount);

        let today = now.date_naive();
        let change = update_loan_with_retry(self.ctx.loans.as_ref(), loan_id, &self.ctx.config.retry, |current| {
            ensure_active(current)?;
            if current.remaining_balance != loan.remaining_balance {
                return Err(BankError::conflict("loan balance changed since the payoff was quoted"));
            }
            Ok(Some(Loan {
                status: LoanStatus::Completed,
                remaining_balance: Money::ZERO,
                is_late: false,
                late_fee_amount: Money::ZERO,
                auto_payment_enabled: false,
                auto_payment_account_id: None,
                auto_payment_day: None,
                next_payment_date: None,
                last_payment_date: Some(today),
                ..current.clone()
            }))
        })?
        .ok_or_else(|| BankError::conflict("loan could not be closed"))?;
        saga.record(Step::RestoreLoan {
            previous: change.before.clone(),
            applied_version: change.after.version,
        });

        let row = Transaction::posted(
            &debit,
            TransactionType::LoanPayoff,
            quote.payoff_amount,
            reference.clone(),
            Some(format!("early payoff of loan {}", loan_id)),
            now,
        );
        self.ctx.ledger.insert_transaction(&row)?;
        saga.posted(account.id, &reference);

        let payment = LoanPayment {
            id: Uuid::new_v4(),
            loan_id,
            amount: quote.payoff_amount,
            principal_amount: quote.outstanding_principal - quote.discount,
            interest_amount: Money::ZERO,
            late_fee: quote.assessed_fees_and_interest,
            payment_type: PaymentType::EarlyPayoff,
            status: TransactionStatus::Completed,
            payment_date: now,
            balance_after: Money::ZERO,
            installment_number: None,
            reference: reference.clone(),
        };
        self.ctx.loans.insert_loan_payment(&payment)?;
        settle_fee_charges(&self.ctx, &change)?;

        tracing::info!(
            loan_id = %loan_id,
            reference = %reference,
            payoff = %quote.payoff_amount,
            discount = %quote.discount,
            "loan paid off early"
        );

        self.ctx.notify(Notification::LoanPaidOff {
            recipient: loan.owner_id,
            loan_id,
            amount: quote.payoff_amount,
            interest_waived: quote.interest_waived,
            reference: reference.clone(),
        });
        self.ctx.record(
            AuditEntry::new(Actor::User(caller), AuditAction::EarlyPayoff, AuditOutcome::Success, now)
                .subject(loan_id)
                .reference(&reference)
                .amount(quote.payoff_amount)
                .balance(debit),
        );

        Ok(PayoffSettlement {
            loan_id,
            reference_number: reference,
            amount_paid: quote.payoff_amount,
            interest_waived: quote.interest_waived,
            new_account_balance: debit.after,
            loan_status: change.after.status,
        })
    }
}
