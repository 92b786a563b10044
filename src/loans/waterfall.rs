use serde::{Deserialize, Serialize};

use crate::decimal::Money;

/// amounts a payment can settle, each already rounded to cents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountsDue {
    pub late_fees: Money,
    pub interest: Money,
    pub principal: Money,
}

impl AmountsDue {
    pub fn total(&self) -> Money {
        self.late_fees + self.interest + self.principal
    }
}

/// how a payment was split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub to_late_fees: Money,
    pub to_interest: Money,
    pub to_principal: Money,
    pub excess: Money,
}

impl Allocation {
    pub fn total_applied(&self) -> Money {
        self.to_late_fees + self.to_interest + self.to_principal
    }

    /// portion that reduces the loan's remaining balance
    pub fn reduces_balance_by(&self) -> Money {
        self.to_late_fees + self.to_principal
    }
}

/// Split `amount` over what is due: late fees, then interest, then
/// principal. Whatever is left lands in `excess`.
pub fn allocate(amount: Money, due: &AmountsDue) -> Allocation {
    let mut remaining = amount;
    let mut take = |owed: Money| {
        let portion = remaining.min(owed).max(Money::ZERO);
        remaining -= portion;
        portion
    };

    let to_late_fees = take(due.late_fees);
    let to_interest = take(due.interest);
    let to_principal = take(due.principal);
    Allocation {
        to_late_fees,
        to_interest,
        to_principal,
        excess: remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn due() -> AmountsDue {
        AmountsDue {
            late_fees: Money::from_major(43),
            interest: Money::from_major(50),
            principal: Money::from_major(9_000),
        }
    }

    #[test]
    fn test_fees_then_interest_then_principal() {
        let allocation = allocate(Money::from_major(200), &due());
        assert_eq!(allocation.to_late_fees, Money::from_major(43));
        assert_eq!(allocation.to_interest, Money::from_major(50));
        assert_eq!(allocation.to_principal, Money::from_major(107));
        assert_eq!(allocation.excess, Money::ZERO);
        assert_eq!(allocation.reduces_balance_by(), Money::from_major(150));
    }

    #[test]
    fn test_small_payment_only_touches_fees() {
        let allocation = allocate(Money::from_major(20), &due());
        assert_eq!(allocation.to_late_fees, Money::from_major(20));
        assert_eq!(allocation.to_interest, Money::ZERO);
        assert_eq!(allocation.to_principal, Money::ZERO);
    }

    #[test]
    fn test_overpayment_is_reported() {
        let total = due().total();
        let allocation = allocate(total + Money::from_major(5), &due());
        assert_eq!(allocation.total_applied(), total);
        assert_eq!(allocation.excess, Money::from_major(5));
    }
}
