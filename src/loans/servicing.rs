use chrono::{DateTime, NaiveDate, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditOutcome};
use crate::context::EngineContext;
use crate::decimal::Money;
use crate::errors::{BankError, Result};
use crate::ledger::{self, Posting, Transaction};
use crate::notify::Notification;
use crate::reference;
use crate::transfers::{load_owned_account, Saga, Step};
use crate::types::{AccountId, Actor, LoanId, LoanStatus, PaymentType, TransactionStatus, TransactionType, UserId};

use super::amortization::{self, AmortizationSchedule};
use super::waterfall::{self, Allocation, AmountsDue};
use super::{ensure_active, load_owned_loan, settle_fee_charges, update_loan_with_retry, Loan, LoanPayment};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub funding_account_id: AccountId,
    /// defaults to the installment currently due
    #[serde(default)]
    pub amount: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallmentReceipt {
    pub loan_id: LoanId,
    pub reference_number: String,
    pub amount: Money,
    pub allocation: Allocation,
    /// set when the payment settled a full installment
    pub installment_number: Option<u32>,
    pub remaining_balance: Money,
    pub next_payment_date: Option<NaiveDate>,
    pub loan_status: LoanStatus,
    pub is_late: bool,
    pub new_account_balance: Money,
}

/// What the borrower owes right now: unpaid fees, one month of interest on
/// the principal still outstanding, and the principal itself.
pub fn amounts_due(loan: &Loan) -> AmountsDue {
    let principal = loan.principal_outstanding();
    AmountsDue {
        late_fees: loan.late_fee_amount,
        interest: principal.apply(loan.interest_rate.monthly_rate()).round_cents(),
        principal,
    }
}

/// Installment due: the regular payment plus unpaid fees, never more than
/// it takes to settle the loan. The final installment settles it in full.
pub fn installment_due(loan: &Loan, due: &AmountsDue) -> Result<Money> {
    let settle = due.total();
    if loan.payments_made + 1 >= loan.term_months {
        return Ok(settle);
    }
    Ok((loan.installment_amount()? + due.late_fees).min(settle))
}

#[derive(Debug, Clone, Copy)]
struct Applied {
    allocation: Allocation,
    installment_number: Option<u32>,
}

/// installment payments and loan read models
#[derive(Debug, Clone)]
pub struct LoanServicer {
    ctx: EngineContext,
}

impl LoanServicer {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub fn loan(&self, caller: UserId, loan_id: LoanId) -> Result<Loan> {
        load_owned_loan(&self.ctx, caller, loan_id)
    }

    pub fn payments(&self, caller: UserId, loan_id: LoanId) -> Result<Vec<LoanPayment>> {
        load_owned_loan(&self.ctx, caller, loan_id)?;
        Ok(self.ctx.loans.loan_payments(loan_id)?)
    }

    pub fn schedule(&self, caller: UserId, loan_id: LoanId) -> Result<AmortizationSchedule> {
        let loan = load_owned_loan(&self.ctx, caller, loan_id)?;
        let payments = self.ctx.loans.loan_payments(loan_id)?;
        amortization::compute_schedule(&loan, &payments)
    }

    /// Borrower-initiated payment.
    pub fn pay_installment(
        &self,
        caller: UserId,
        loan_id: LoanId,
        request: &PaymentRequest,
        time: &SafeTimeProvider,
    ) -> Result<InstallmentReceipt> {
        self.pay(caller, loan_id, request, PaymentType::Manual, time)
    }

    pub(crate) fn pay(
        &self,
        caller: UserId,
        loan_id: LoanId,
        request: &PaymentRequest,
        payment_type: PaymentType,
        time: &SafeTimeProvider,
    ) -> Result<InstallmentReceipt> {
        let now = time.now();
        let mut saga = Saga::new(&self.ctx, "loan payment", now);

        match self.run_pay(caller, loan_id, request, payment_type, now, &mut saga) {
            Ok(receipt) => Ok(receipt),
            Err(e) => Err(saga.abort(e, |outcome| {
                let entry = AuditEntry::new(Actor::User(caller), AuditAction::LoanPayment, outcome, now).subject(loan_id);
                match request.amount {
                    Some(amount) => entry.amount(amount),
                    None => entry,
                }
            })),
        }
    }

    fn run_pay(
        &self,
        caller: UserId,
        loan_id: LoanId,
        request: &PaymentRequest,
        payment_type: PaymentType,
        now: DateTime<Utc>,
        saga: &mut Saga<'_>,
    ) -> Result<InstallmentReceipt> {
        let loan = load_owned_loan(&self.ctx, caller, loan_id)?;
        ensure_active(&loan)?;

        let due = amounts_due(&loan);
        let amount = match request.amount {
            Some(amount) => amount,
            None => installment_due(&loan, &due)?,
        };
        // never more than it takes to settle the loan
        self.ctx.gate().validate_amount(amount, due.total())?;

        let account = load_owned_account(&self.ctx, caller, request.funding_account_id)?;
        if !account.is_active() {
            return Err(BankError::validation("funding account is not active"));
        }
        if account.balance < amount {
            return Err(BankError::insufficient_funds(amount, account.balance));
        }

        let debit = ledger::debit(
            self.ctx.ledger.as_ref(),
            account.id,
            amount,
            Posting::Regular,
            &self.ctx.config.retry,
        )?;
        saga.debited(&debit, amount);

        let today = now.date_naive();
        let mut applied = None;
        let change = update_loan_with_retry(self.ctx.loans.as_ref(), loan_id, &self.ctx.config.retry, |current| {
            ensure_active(current)?;
            let (next, result) = self.apply_payment(current, amount, today)?;
            applied = Some(result);
            Ok(Some(next))
        })?
        .ok_or_else(|| BankError::conflict("loan payment could not be applied"))?;
        let applied = applied.ok_or_else(|| BankError::system("loan payment allocation missing"))?;
        saga.record(Step::RestoreLoan {
            previous: change.before.clone(),
            applied_version: change.after.version,
        });

        let reference = reference::generate(reference::LOAN_PAYMENT_PREFIX);
        let row = Transaction::posted(
            &debit,
            TransactionType::LoanPayment,
            amount,
            reference.clone(),
            Some(format!("payment on loan {}", loan_id)),
            now,
        );
        self.ctx.ledger.insert_transaction(&row)?;
        saga.posted(account.id, &reference);

        let allocation = applied.allocation;
        let after = &change.after;
        let payment = LoanPayment {
            id: Uuid::new_v4(),
            loan_id,
            amount,
            principal_amount: allocation.to_principal,
            interest_amount: allocation.to_interest,
            late_fee: allocation.to_late_fees,
            payment_type,
            status: TransactionStatus::Completed,
            payment_date: now,
            balance_after: after.remaining_balance,
            installment_number: applied.installment_number,
            reference: reference.clone(),
        };
        self.ctx.loans.insert_loan_payment(&payment)?;
        settle_fee_charges(&self.ctx, &change)?;

        tracing::info!(
            loan_id = %loan_id,
            reference = %reference,
            amount = %amount,
            to_fees = %allocation.to_late_fees,
            to_interest = %allocation.to_interest,
            to_principal = %allocation.to_principal,
            remaining = %after.remaining_balance,
            "loan payment applied"
        );

        self.ctx.notify(Notification::LoanPaymentReceived {
            recipient: after.owner_id,
            loan_id,
            amount,
            remaining_balance: after.remaining_balance,
            next_payment_date: after.next_payment_date,
        });
        self.ctx.record(
            AuditEntry::new(Actor::User(caller), AuditAction::LoanPayment, AuditOutcome::Success, now)
                .subject(loan_id)
                .reference(&reference)
                .amount(amount)
                .balance(debit),
        );

        Ok(InstallmentReceipt {
            loan_id,
            reference_number: reference,
            amount,
            allocation,
            installment_number: applied.installment_number,
            remaining_balance: after.remaining_balance,
            next_payment_date: after.next_payment_date,
            loan_status: after.status,
            is_late: after.is_late,
            new_account_balance: debit.after,
        })
    }

    /// New loan row after `amount` is run through the waterfall.
    fn apply_payment(&self, loan: &Loan, amount: Money, today: NaiveDate) -> Result<(Loan, Applied)> {
        let due = amounts_due(loan);
        let allocation = waterfall::allocate(amount, &due);
        if allocation.excess.is_positive() {
            return Err(BankError::validation(format!(
                "payment exceeds the payoff amount {}",
                due.total()
            )));
        }

        let mut next = loan.clone();
        next.remaining_balance = (loan.remaining_balance - allocation.reduces_balance_by()).max(Money::ZERO);
        next.late_fee_amount = (loan.late_fee_amount - allocation.to_late_fees).max(Money::ZERO);
        next.last_payment_date = Some(today);

        let mut installment_number = None;
        if amount >= installment_due(loan, &due)? {
            next.payments_made = loan.payments_made + 1;
            installment_number = Some(next.payments_made);
            next.next_payment_date = Some(loan.due_date(next.payments_made + 1)?);
        }

        if next.remaining_balance.is_zero() {
            next.status = LoanStatus::Completed;
            next.is_late = false;
            next.next_payment_date = None;
            next.auto_payment_enabled = false;
            next.auto_payment_account_id = None;
            next.auto_payment_day = None;
        } else if next.is_late && next.late_fee_amount.is_zero() && matches!(next.next_payment_date, Some(d) if d > today) {
            next.is_late = false;
        }

        Ok((
            next,
            Applied {
                allocation,
                installment_number,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::InMemoryBackend;
    use crate::decimal::Rate;
    use crate::ledger::Account;
    use crate::loans::LateFeeAssessor;
    use crate::store::memory::Fault;
    use crate::store::{LedgerStore, LoanStore};
    use chrono::{Duration, TimeZone};
    use hourglass_rs::TimeSource;

    struct Fixture {
        backend: InMemoryBackend,
        servicer: LoanServicer,
        time: SafeTimeProvider,
        owner: UserId,
        account: Account,
        loan: Loan,
    }

    fn fixture(balance: i64) -> Fixture {
        let backend = InMemoryBackend::new();
        let servicer = LoanServicer::new(backend.context(EngineConfig::default()));
        let time = SafeTimeProvider::new(TimeSource::Test(Utc.with_ymd_and_hms(2024, 2, 14, 10, 0, 0).unwrap()));
        let owner = Uuid::new_v4();
        let account = Account::new(owner, "60000006", Money::from_major(balance));
        let loan = Loan::originate(
            owner,
            account.id,
            Money::from_major(10_000),
            Rate::from_percentage(6),
            12,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        )
        .unwrap();
        backend.store.insert_account(account.clone()).unwrap();
        backend.store.insert_loan(loan.clone()).unwrap();
        Fixture {
            backend,
            servicer,
            time,
            owner,
            account,
            loan,
        }
    }

    fn pay(f: &Fixture, amount: Option<Money>) -> Result<InstallmentReceipt> {
        let request = PaymentRequest {
            funding_account_id: f.account.id,
            amount,
        };
        f.servicer.pay_installment(f.owner, f.loan.id, &request, &f.time)
    }

    #[test]
    fn test_regular_installment() {
        let f = fixture(5_000);
        let receipt = pay(&f, None).unwrap();

        assert_eq!(receipt.amount, Money::from_cents(86066));
        assert_eq!(receipt.allocation.to_interest, Money::from_major(50));
        assert_eq!(receipt.allocation.to_principal, Money::from_cents(81066));
        assert_eq!(receipt.installment_number, Some(1));
        assert_eq!(receipt.remaining_balance, Money::from_cents(918934));
        assert_eq!(receipt.next_payment_date, NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(receipt.new_account_balance, Money::from_cents(413934));

        let schedule = f.servicer.schedule(f.owner, f.loan.id).unwrap();
        assert!(schedule.row(1).unwrap().is_paid);
        assert!(!schedule.row(2).unwrap().is_paid);
    }

    #[test]
    fn test_partial_payment_is_not_an_installment() {
        let f = fixture(5_000);
        let receipt = pay(&f, Some(Money::from_major(100))).unwrap();

        assert_eq!(receipt.installment_number, None);
        assert_eq!(receipt.allocation.to_principal, Money::from_major(50));
        let loan = f.backend.store.loan(f.loan.id).unwrap();
        assert_eq!(loan.payments_made, 0);
        assert_eq!(loan.next_payment_date, NaiveDate::from_ymd_opt(2024, 2, 15));
    }

    #[test]
    fn test_overpayment_rejected() {
        let f = fixture(20_000);
        let err = pay(&f, Some(Money::from_major(10_051))).unwrap_err();
        assert!(matches!(err, BankError::Validation { .. }));
        assert_eq!(f.backend.store.account(f.account.id).unwrap().balance, Money::from_major(20_000));
    }

    #[test]
    fn test_full_settlement_completes_loan() {
        let f = fixture(20_000);
        let receipt = pay(&f, Some(Money::from_major(10_050))).unwrap();
        assert_eq!(receipt.loan_status, LoanStatus::Completed);
        assert_eq!(receipt.remaining_balance, Money::ZERO);
        assert_eq!(receipt.next_payment_date, None);
    }

    #[test]
    fn test_late_fee_paid_first_and_flag_cleared() {
        let f = fixture(5_000);
        f.time.test_control().unwrap().advance(Duration::days(16));
        LateFeeAssessor::new(f.backend.context(EngineConfig::default()))
            .assess(&f.time)
            .unwrap();
        assert!(f.backend.store.loan(f.loan.id).unwrap().is_late);

        let receipt = pay(&f, None).unwrap();
        assert_eq!(receipt.amount, Money::from_str_exact("903.69").unwrap());
        assert_eq!(receipt.allocation.to_late_fees, Money::from_str_exact("43.03").unwrap());
        assert_eq!(receipt.allocation.to_interest, Money::from_major(50));
        assert_eq!(receipt.remaining_balance, Money::from_cents(918934));
        assert!(!receipt.is_late);

        let charge = f
            .backend
            .store
            .loan_payments(f.loan.id)
            .unwrap()
            .into_iter()
            .find(|p| p.payment_type == PaymentType::LateFee)
            .unwrap();
        assert_eq!(charge.status, TransactionStatus::Completed);
    }

    #[test]
    fn test_partial_payment_leaves_fee_charge_pending() {
        let f = fixture(5_000);
        f.time.test_control().unwrap().advance(Duration::days(16));
        LateFeeAssessor::new(f.backend.context(EngineConfig::default()))
            .assess(&f.time)
            .unwrap();

        // covers only part of the 43.03 fee
        pay(&f, Some(Money::from_major(20))).unwrap();
        let payments = f.backend.store.loan_payments(f.loan.id).unwrap();
        let charge = payments.iter().find(|p| p.payment_type == PaymentType::LateFee).unwrap();
        assert_eq!(charge.status, TransactionStatus::Pending);
    }

    #[test]
    fn test_loan_update_failure_refunds() {
        let f = fixture(5_000);
        f.backend.store.inject(Fault::UpdateLoan(f.loan.id));

        assert!(pay(&f, None).is_err());
        assert_eq!(f.backend.store.account(f.account.id).unwrap().balance, Money::from_major(5_000));
        assert_eq!(f.backend.store.loan(f.loan.id).unwrap().remaining_balance, Money::from_major(10_000));
    }

    #[test]
    fn test_payment_row_failure_restores_loan() {
        let f = fixture(5_000);
        f.backend.store.inject(Fault::InsertLoanPayment(f.loan.id));

        assert!(pay(&f, None).is_err());
        let loan = f.backend.store.loan(f.loan.id).unwrap();
        assert_eq!(loan.payments_made, 0);
        assert_eq!(loan.remaining_balance, Money::from_major(10_000));
        assert_eq!(f.backend.store.account(f.account.id).unwrap().balance, Money::from_major(5_000));
    }

    #[test]
    fn test_twelve_installments_settle_loan() {
        let f = fixture(20_000);
        for month in 1..=12u32 {
            let receipt = pay(&f, None).unwrap();
            assert_eq!(receipt.installment_number, Some(month));
            f.time.test_control().unwrap().advance(Duration::days(30));
        }
        let loan = f.backend.store.loan(f.loan.id).unwrap();
        assert_eq!(loan.status, LoanStatus::Completed);

        let interest: Money = f
            .backend
            .store
            .loan_payments(f.loan.id)
            .unwrap()
            .iter()
            .map(|p| p.interest_amount)
            .sum();
        assert!((interest - Money::from_str_exact("327.97").unwrap()).abs() <= Money::from_str_exact("0.10").unwrap());
    }

    #[test]
    fn test_other_users_loan_not_found() {
        let f = fixture(5_000);
        let request = PaymentRequest {
            funding_account_id: f.account.id,
            amount: None,
        };
        let err = f.servicer.pay_installment(Uuid::new_v4(), f.loan.id, &request, &f.time).unwrap_err();
        assert!(matches!(err, BankError::NotFound { .. }));
    }
}
