use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::decimal::Money;
use crate::ledger::{Account, Transaction, VerificationCode, WireTransfer};
use crate::loans::{Loan, LoanPayment};
use crate::types::{
    AccountId, AccountStatus, LoanId, LoanStatus, PaymentType, TransactionStatus, TransferGroupId, WireTransferId,
};

use super::{LedgerStore, LoanStore, StoreError, StoreResult};

/// One-shot failure injected into the next matching store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// next balance write on the account fails as unavailable
    UpdateBalance(AccountId),
    /// next balance write on the account reports a version conflict
    StaleBalance(AccountId),
    /// next transaction insert whose reference contains the pattern fails
    InsertTransaction(String),
    UpdateLoan(LoanId),
    /// next loan update reports a version conflict
    StaleLoan(LoanId),
    InsertLoanPayment(LoanId),
    UpdateWire(WireTransferId),
}

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    transactions: Vec<Transaction>,
    references: HashSet<String>,
    wires: HashMap<WireTransferId, WireTransfer>,
    codes: HashMap<WireTransferId, VerificationCode>,
    loans: HashMap<LoanId, Loan>,
    loan_payments: Vec<LoanPayment>,
    faults: Vec<Fault>,
}

impl Tables {
    /// removes and reports the first pending fault matching the predicate
    fn trip(&mut self, matches: impl Fn(&Fault) -> bool) -> bool {
        match self.faults.iter().position(matches) {
            Some(i) => {
                let fault = self.faults.remove(i);
                tracing::debug!(?fault, "injected store fault triggered");
                true
            }
            None => false,
        }
    }
}

fn injected() -> StoreError {
    StoreError::Unavailable("injected fault".to_string())
}

/// In-memory store with the same conditional-update semantics as a real
/// backend. Every call takes the table lock once, so each primitive is atomic
/// on its own and nothing spans two calls.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    /// onboarding hook: accounts are created outside the engine
    pub fn insert_account(&self, account: Account) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.accounts.values().any(|a| a.account_number == account.account_number) {
            return Err(StoreError::duplicate("Account", &account.account_number));
        }
        t.accounts.insert(account.id, account);
        Ok(())
    }

    pub fn set_account_status(&self, id: AccountId, status: AccountStatus) -> StoreResult<()> {
        let mut t = self.tables()?;
        let account = t.accounts.get_mut(&id).ok_or_else(|| StoreError::not_found("Account", id))?;
        account.status = status;
        Ok(())
    }

    /// origination hook: loans are created on approval, outside the engine
    pub fn insert_loan(&self, loan: Loan) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.loans.contains_key(&loan.id) {
            return Err(StoreError::duplicate("Loan", loan.id));
        }
        t.loans.insert(loan.id, loan);
        Ok(())
    }

    pub fn inject(&self, fault: Fault) {
        if let Ok(mut t) = self.tables() {
            t.faults.push(fault);
        }
    }

    pub fn pending_faults(&self) -> usize {
        self.tables().map(|t| t.faults.len()).unwrap_or(0)
    }

    pub fn transaction_count(&self) -> usize {
        self.tables().map(|t| t.transactions.len()).unwrap_or(0)
    }
}

impl LedgerStore for MemoryStore {
    fn account(&self, id: AccountId) -> StoreResult<Account> {
        let t = self.tables()?;
        t.accounts.get(&id).cloned().ok_or_else(|| StoreError::not_found("Account", id))
    }

    fn account_by_number(&self, account_number: &str) -> StoreResult<Account> {
        let t = self.tables()?;
        t.accounts
            .values()
            .find(|a| a.account_number == account_number)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Account", account_number))
    }

    fn update_balance(&self, id: AccountId, expected_version: u64, new_balance: Money) -> StoreResult<Account> {
        let mut t = self.tables()?;
        if t.trip(|f| *f == Fault::UpdateBalance(id)) {
            return Err(injected());
        }
        if t.trip(|f| *f == Fault::StaleBalance(id)) {
            return Err(StoreError::conflict("Account", id));
        }

        let account = t.accounts.get_mut(&id).ok_or_else(|| StoreError::not_found("Account", id))?;
        if account.version != expected_version {
            return Err(StoreError::conflict("Account", id));
        }
        account.balance = new_balance;
        account.version += 1;
        Ok(account.clone())
    }

    fn insert_transaction(&self, transaction: &Transaction) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.trip(|f| matches!(f, Fault::InsertTransaction(p) if transaction.reference.contains(p.as_str()))) {
            return Err(injected());
        }
        if !t.references.insert(transaction.reference.clone()) {
            return Err(StoreError::duplicate("Transaction", &transaction.reference));
        }
        t.transactions.push(transaction.clone());
        Ok(())
    }

    fn transaction_by_reference(&self, reference: &str) -> StoreResult<Option<Transaction>> {
        let t = self.tables()?;
        Ok(t.transactions.iter().find(|tx| tx.reference == reference).cloned())
    }

    fn transactions_for_account(&self, account_id: AccountId) -> StoreResult<Vec<Transaction>> {
        let t = self.tables()?;
        Ok(t.transactions.iter().filter(|tx| tx.account_id == account_id).cloned().collect())
    }

    fn transactions_in_group(&self, group: TransferGroupId) -> StoreResult<Vec<Transaction>> {
        let t = self.tables()?;
        Ok(t.transactions
            .iter()
            .filter(|tx| tx.transfer_group_id == Some(group))
            .cloned()
            .collect())
    }

    fn insert_wire_transfer(&self, wire: &WireTransfer) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.wires.contains_key(&wire.id) {
            return Err(StoreError::duplicate("WireTransfer", wire.id));
        }
        t.wires.insert(wire.id, wire.clone());
        Ok(())
    }

    fn wire_transfer(&self, id: WireTransferId) -> StoreResult<WireTransfer> {
        let t = self.tables()?;
        t.wires.get(&id).cloned().ok_or_else(|| StoreError::not_found("WireTransfer", id))
    }

    fn update_wire_transfer(&self, wire: &WireTransfer, expected_version: u64) -> StoreResult<WireTransfer> {
        let mut t = self.tables()?;
        if t.trip(|f| *f == Fault::UpdateWire(wire.id)) {
            return Err(injected());
        }
        let stored = t.wires.get_mut(&wire.id).ok_or_else(|| StoreError::not_found("WireTransfer", wire.id))?;
        if stored.version != expected_version {
            return Err(StoreError::conflict("WireTransfer", wire.id));
        }
        *stored = WireTransfer {
            version: expected_version + 1,
            ..wire.clone()
        };
        Ok(stored.clone())
    }

    fn insert_verification_code(&self, code: &VerificationCode) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.codes.contains_key(&code.transfer_id) {
            return Err(StoreError::duplicate("VerificationCode", code.transfer_id));
        }
        t.codes.insert(code.transfer_id, code.clone());
        Ok(())
    }

    fn verification_code(&self, transfer_id: WireTransferId) -> StoreResult<VerificationCode> {
        let t = self.tables()?;
        t.codes
            .get(&transfer_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("VerificationCode", transfer_id))
    }

    fn consume_verification_code(&self, transfer_id: WireTransferId, at: DateTime<Utc>) -> StoreResult<VerificationCode> {
        let mut t = self.tables()?;
        let code = t
            .codes
            .get_mut(&transfer_id)
            .ok_or_else(|| StoreError::not_found("VerificationCode", transfer_id))?;
        if code.consumed_at.is_some() {
            return Err(StoreError::AlreadyConsumed {
                transfer_id: transfer_id.to_string(),
            });
        }
        code.consumed_at = Some(at);
        Ok(code.clone())
    }

    fn record_failed_code_attempt(&self, transfer_id: WireTransferId) -> StoreResult<VerificationCode> {
        let mut t = self.tables()?;
        let code = t
            .codes
            .get_mut(&transfer_id)
            .ok_or_else(|| StoreError::not_found("VerificationCode", transfer_id))?;
        code.failed_attempts += 1;
        Ok(code.clone())
    }
}

impl LoanStore for MemoryStore {
    fn loan(&self, id: LoanId) -> StoreResult<Loan> {
        let t = self.tables()?;
        t.loans.get(&id).cloned().ok_or_else(|| StoreError::not_found("Loan", id))
    }

    fn loans_by_status(&self, status: LoanStatus) -> StoreResult<Vec<Loan>> {
        let t = self.tables()?;
        let mut loans: Vec<Loan> = t.loans.values().filter(|l| l.status == status).cloned().collect();
        loans.sort_by_key(|l| l.id);
        Ok(loans)
    }

    fn update_loan(&self, loan: &Loan, expected_version: u64) -> StoreResult<Loan> {
        let mut t = self.tables()?;
        if t.trip(|f| *f == Fault::UpdateLoan(loan.id)) {
            return Err(injected());
        }
        if t.trip(|f| *f == Fault::StaleLoan(loan.id)) {
            return Err(StoreError::conflict("Loan", loan.id));
        }
        let stored = t.loans.get_mut(&loan.id).ok_or_else(|| StoreError::not_found("Loan", loan.id))?;
        if stored.version != expected_version {
            return Err(StoreError::conflict("Loan", loan.id));
        }
        *stored = Loan {
            version: expected_version + 1,
            ..loan.clone()
        };
        Ok(stored.clone())
    }

    fn insert_loan_payment(&self, payment: &LoanPayment) -> StoreResult<()> {
        let mut t = self.tables()?;
        if t.trip(|f| *f == Fault::InsertLoanPayment(payment.loan_id)) {
            return Err(injected());
        }
        if t.loan_payments.iter().any(|p| p.reference == payment.reference) {
            return Err(StoreError::duplicate("LoanPayment", &payment.reference));
        }
        t.loan_payments.push(payment.clone());
        Ok(())
    }

    fn loan_payments(&self, loan_id: LoanId) -> StoreResult<Vec<LoanPayment>> {
        let t = self.tables()?;
        let mut payments: Vec<LoanPayment> = t.loan_payments.iter().filter(|p| p.loan_id == loan_id).cloned().collect();
        payments.sort_by_key(|p| p.payment_date);
        Ok(payments)
    }

    fn settle_late_fee_charges(&self, loan_id: LoanId) -> StoreResult<usize> {
        let mut t = self.tables()?;
        let mut settled = 0;
        for charge in t.loan_payments.iter_mut().filter(|p| {
            p.loan_id == loan_id && p.payment_type == PaymentType::LateFee && p.status == TransactionStatus::Pending
        }) {
            charge.status = TransactionStatus::Completed;
            settled += 1;
        }
        Ok(settled)
    }
}
