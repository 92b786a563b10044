use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::{Money, Rate};
use crate::errors::{BankError, Result};
use crate::types::{LoanId, PaymentType};

use super::{Loan, LoanPayment};

/// one month of an amortization schedule, presented in cents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub month: u32,
    pub due_date: NaiveDate,
    pub beginning_balance: Money,
    pub payment: Money,
    pub principal_portion: Money,
    pub interest_portion: Money,
    pub ending_balance: Money,
    pub cumulative_interest: Money,
    pub is_paid: bool,
}

/// amortization schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmortizationSchedule {
    pub loan_id: LoanId,
    pub principal: Money,
    pub interest_rate: Rate,
    pub term_months: u32,
    pub monthly_payment: Money,
    pub rows: Vec<ScheduleRow>,
    pub total_interest: Money,
    pub total_amount: Money,
}

impl AmortizationSchedule {
    pub fn row(&self, month: u32) -> Option<&ScheduleRow> {
        self.rows.iter().find(|r| r.month == month)
    }

    pub fn paid_rows(&self) -> usize {
        self.rows.iter().filter(|r| r.is_paid).count()
    }

    /// first row not yet settled
    pub fn next_unpaid(&self) -> Option<&ScheduleRow> {
        self.rows.iter().find(|r| !r.is_paid)
    }
}

/// Level annuity payment, full precision.
///
/// `P * r * (1 + r)^n / ((1 + r)^n - 1)` with `r` the monthly rate, or
/// `P / n` for interest-free loans.
pub fn monthly_payment(principal: Money, annual_rate: Rate, term_months: u32) -> Result<Money> {
    if term_months == 0 {
        return Err(BankError::validation("loan term must be at least one month"));
    }

    let r = annual_rate.monthly_rate().as_decimal();
    if r.is_zero() {
        return Ok(principal / Decimal::from(term_months));
    }

    let mut compound = Decimal::ONE;
    let base = Decimal::ONE + r;
    for _ in 0..term_months {
        compound = compound
            .checked_mul(base)
            .ok_or_else(|| BankError::validation("loan term too long for the interest rate"))?;
    }

    let numerator = principal.as_decimal() * r * compound;
    let denominator = compound - Decimal::ONE;
    Ok(Money::from_decimal(numerator / denominator))
}

/// Interest still to be paid if `outstanding` is amortized over `months`.
pub fn remaining_interest(outstanding: Money, annual_rate: Rate, months: u32) -> Result<Money> {
    if months == 0 || !outstanding.is_positive() {
        return Ok(Money::ZERO);
    }
    let payment = monthly_payment(outstanding, annual_rate, months)?;
    let total = payment * Decimal::from(months);
    Ok((total - outstanding).max(Money::ZERO).round_cents())
}

/// Build the schedule for a loan and mark rows settled by completed payments.
///
/// A row is paid when a completed payment names it through
/// `installment_number`; a completed early payoff settles every row. The
/// computation is pure and safe to repeat on every request.
pub fn compute_schedule(loan: &Loan, completed_payments: &[LoanPayment]) -> Result<AmortizationSchedule> {
    let payment = monthly_payment(loan.principal, loan.interest_rate, loan.term_months)?;
    let r = loan.interest_rate.monthly_rate().as_decimal();

    let paid_off = completed_payments
        .iter()
        .any(|p| p.is_completed() && p.payment_type == PaymentType::EarlyPayoff);
    let is_paid = |month: u32| {
        paid_off
            || completed_payments
                .iter()
                .any(|p| p.is_completed() && p.installment_number == Some(month))
    };

    let mut rows = Vec::with_capacity(loan.term_months as usize);
    let mut balance = loan.principal;
    let mut total_interest = Money::ZERO;
    let mut cumulative_interest = Money::ZERO;
    let mut principal_presented = Money::ZERO;

    for month in 1..=loan.term_months {
        let interest = Money::from_decimal(balance.as_decimal() * r);
        let principal_portion = payment - interest;
        let ending = (balance - principal_portion).max(Money::ZERO);
        total_interest += interest;

        let interest_cents = interest.round_cents();
        cumulative_interest += interest_cents;
        let principal_cents = principal_portion.round_cents();
        principal_presented += principal_cents;

        rows.push(ScheduleRow {
            month,
            due_date: loan.due_date(month)?,
            beginning_balance: balance.round_cents(),
            payment: (principal_cents + interest_cents).round_cents(),
            principal_portion: principal_cents,
            interest_portion: interest_cents,
            ending_balance: ending.round_cents(),
            cumulative_interest,
            is_paid: is_paid(month),
        });

        balance = ending;
    }

    // rounding residue goes into the last row so presented principal sums exactly
    if let Some(last) = rows.last_mut() {
        let residue = loan.principal.round_cents() - principal_presented;
        if !residue.is_zero() {
            last.principal_portion += residue;
            last.payment = last.principal_portion + last.interest_portion;
        }
        last.ending_balance = Money::ZERO;
    }

    let total_interest = total_interest.round_cents();
    Ok(AmortizationSchedule {
        loan_id: loan.id,
        principal: loan.principal,
        interest_rate: loan.interest_rate,
        term_months: loan.term_months,
        monthly_payment: payment.round_cents(),
        rows,
        total_interest,
        total_amount: (loan.principal + total_interest).round_cents(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn loan(principal: i64, rate: u32, term: u32) -> Loan {
        Loan::originate(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Money::from_major(principal),
            Rate::from_percentage(rate),
            term,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        )
        .unwrap()
    }

    fn payment(loan: &Loan, installment: Option<u32>, payment_type: PaymentType) -> LoanPayment {
        LoanPayment {
            id: Uuid::new_v4(),
            loan_id: loan.id,
            amount: Money::from_major(1),
            principal_amount: Money::from_major(1),
            interest_amount: Money::ZERO,
            late_fee: Money::ZERO,
            payment_type,
            status: TransactionStatus::Completed,
            payment_date: Utc::now(),
            balance_after: Money::ZERO,
            installment_number: installment,
            reference: format!("LNPMT-{}", Uuid::new_v4()),
        }
    }

    #[test]
    fn test_interest_free_schedule() {
        let schedule = compute_schedule(&loan(12_000, 0, 12), &[]).unwrap();

        assert_eq!(schedule.monthly_payment, Money::from_str_exact("1000.00").unwrap());
        assert!(schedule.rows.iter().all(|r| r.payment == Money::from_major(1000)));
        let principal: Money = schedule.rows.iter().map(|r| r.principal_portion).sum();
        assert_eq!(principal, Money::from_major(12_000));
        assert_eq!(schedule.total_interest, Money::ZERO);
        assert_eq!(schedule.total_amount, Money::from_major(12_000));
    }

    #[test]
    fn test_standard_annuity() {
        let schedule = compute_schedule(&loan(10_000, 6, 12), &[]).unwrap();

        assert_eq!(schedule.monthly_payment, Money::from_cents(86066));
        // exact annuity arithmetic gives 327.97
        assert_eq!(schedule.total_interest, Money::from_cents(32797));
        let diff = (schedule.total_interest - Money::from_str_exact("327.92").unwrap()).abs();
        assert!(diff <= Money::from_decimal(dec!(0.10)));

        let first = &schedule.rows[0];
        assert_eq!(first.interest_portion, Money::from_major(50));
        assert_eq!(first.principal_portion, Money::from_cents(81066));

        let principal: Money = schedule.rows.iter().map(|r| r.principal_portion).sum();
        assert_eq!(principal, Money::from_major(10_000));
        assert_eq!(schedule.rows[11].ending_balance, Money::ZERO);
    }

    #[test]
    fn test_due_dates_follow_start() {
        let schedule = compute_schedule(&loan(1_200, 0, 3), &[]).unwrap();
        let dates: Vec<NaiveDate> = schedule.rows.iter().map(|r| r.due_date).collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2024, 2, 15).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
                NaiveDate::from_ymd_opt(2024, 4, 15).unwrap(),
            ]
        );
    }

    #[test]
    fn test_rows_marked_by_explicit_link() {
        let loan = loan(12_000, 0, 12);
        let payments = vec![
            payment(&loan, Some(1), PaymentType::Manual),
            payment(&loan, Some(3), PaymentType::Auto),
            // partial payment settles no row
            payment(&loan, None, PaymentType::Manual),
        ];
        let schedule = compute_schedule(&loan, &payments).unwrap();

        assert!(schedule.row(1).unwrap().is_paid);
        assert!(!schedule.row(2).unwrap().is_paid);
        assert!(schedule.row(3).unwrap().is_paid);
        assert_eq!(schedule.paid_rows(), 2);
        assert_eq!(schedule.next_unpaid().unwrap().month, 2);
    }

    #[test]
    fn test_pending_payments_do_not_count() {
        let loan = loan(12_000, 0, 12);
        let mut pending = payment(&loan, Some(1), PaymentType::Manual);
        pending.status = TransactionStatus::Pending;
        let schedule = compute_schedule(&loan, &[pending]).unwrap();
        assert_eq!(schedule.paid_rows(), 0);
    }

    #[test]
    fn test_early_payoff_settles_everything() {
        let loan = loan(12_000, 5, 12);
        let schedule = compute_schedule(&loan, &[payment(&loan, None, PaymentType::EarlyPayoff)]).unwrap();
        assert_eq!(schedule.paid_rows(), 12);
    }

    #[test]
    fn test_remaining_interest() {
        assert_eq!(remaining_interest(Money::from_major(10_000), Rate::from_percentage(6), 12).unwrap(), Money::from_cents(32797));
        assert_eq!(remaining_interest(Money::from_major(10_000), Rate::from_percentage(6), 0).unwrap(), Money::ZERO);
        assert_eq!(remaining_interest(Money::from_major(10_000), Rate::ZERO, 12).unwrap(), Money::ZERO);
    }

    #[test]
    fn test_schedule_is_deterministic() {
        let loan = loan(25_000, 7, 36);
        assert_eq!(compute_schedule(&loan, &[]).unwrap(), compute_schedule(&loan, &[]).unwrap());
    }
}
