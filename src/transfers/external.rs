use chrono::{DateTime, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry, AuditOutcome};
use crate::decimal::Money;
use crate::errors::{BankError, Result};
use crate::ledger::{self, Posting, Transaction};
use crate::notify::Notification;
use crate::reference;
use crate::types::{AccountId, Actor, TransactionType, UserId};
use crate::validation::{validate_account_number, validate_beneficiary_name, validate_routing_number};

use super::{Saga, TransferProcessor};

/// ACH transfer to an account at another institution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTransferRequest {
    pub from_account_id: AccountId,
    pub beneficiary_name: String,
    pub beneficiary_bank: String,
    pub account_number: String,
    pub routing_number: String,
    pub amount: Money,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTransferReceipt {
    pub reference_number: String,
    pub new_balance: Money,
}

impl TransferProcessor {
    /// Send funds out of the bank. Only the local debit is recorded here;
    /// the receiving institution is never mutated.
    pub fn external_transfer(
        &self,
        caller: UserId,
        request: &ExternalTransferRequest,
        time: &SafeTimeProvider,
    ) -> Result<ExternalTransferReceipt> {
        let now = time.now();
        let mut saga = Saga::new(&self.ctx, "external transfer", now);

        match self.run_external(caller, request, now, &mut saga) {
            Ok(receipt) => Ok(receipt),
            Err(e) => Err(saga.abort(e, |outcome| {
                AuditEntry::new(Actor::User(caller), AuditAction::ExternalTransfer, outcome, now)
                    .subject(request.from_account_id)
                    .amount(request.amount)
            })),
        }
    }

    fn run_external(
        &self,
        caller: UserId,
        request: &ExternalTransferRequest,
        now: DateTime<Utc>,
        saga: &mut Saga<'_>,
    ) -> Result<ExternalTransferReceipt> {
        // ceiling first so oversized requests never reach the ledger
        self.gate.validate_external_amount(request.amount)?;
        validate_routing_number(&request.routing_number)?;
        validate_account_number(&request.account_number)?;
        validate_beneficiary_name(&request.beneficiary_name)?;
        if request.beneficiary_bank.trim().is_empty() {
            return Err(BankError::validation("beneficiary bank is required"));
        }
        self.gate.validate_memo(request.description.as_deref())?;

        let source = self.source_account(caller, request.from_account_id)?;
        if source.balance < request.amount {
            return Err(BankError::insufficient_funds(request.amount, source.balance));
        }

        let reference = reference::generate(reference::EXTERNAL_PREFIX);
        let debit = ledger::debit(
            self.ctx.ledger.as_ref(),
            source.id,
            request.amount,
            Posting::Regular,
            &self.ctx.config.retry,
        )?;
        saga.debited(&debit, request.amount);

        let description = request.description.clone().unwrap_or_else(|| {
            format!(
                "transfer to {} at {} ({})",
                request.beneficiary_name.trim(),
                request.beneficiary_bank.trim(),
                ledger::mask_account_number(&request.account_number)
            )
        });
        let row = Transaction::posted(
            &debit,
            TransactionType::ExternalTransfer,
            request.amount,
            reference.clone(),
            Some(description),
            now,
        );
        self.ctx.ledger.insert_transaction(&row)?;
        saga.posted(source.id, &reference);

        tracing::info!(reference = %reference, amount = %request.amount, "external transfer submitted");

        self.ctx.notify(Notification::ExternalTransferSent {
            recipient: source.owner_id,
            amount: request.amount,
            beneficiary_name: request.beneficiary_name.trim().to_string(),
            reference: reference.clone(),
            new_balance: debit.after,
        });
        self.ctx.record(
            AuditEntry::new(Actor::User(caller), AuditAction::ExternalTransfer, AuditOutcome::Success, now)
                .subject(source.id)
                .reference(&reference)
                .amount(request.amount)
                .balance(debit),
        );

        Ok(ExternalTransferReceipt {
            reference_number: reference,
            new_balance: debit.after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::InMemoryBackend;
    use crate::ledger::Account;
    use crate::store::memory::Fault;
    use crate::store::LedgerStore;
    use chrono::TimeZone;
    use hourglass_rs::TimeSource;
    use uuid::Uuid;

    fn setup(balance: i64) -> (InMemoryBackend, TransferProcessor, SafeTimeProvider, UserId, Account) {
        let backend = InMemoryBackend::new();
        let processor = TransferProcessor::new(backend.context(EngineConfig::default()));
        let time = SafeTimeProvider::new(TimeSource::Test(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let owner = Uuid::new_v4();
        let account = Account::new(owner, "30000003", Money::from_major(balance));
        backend.store.insert_account(account.clone()).unwrap();
        (backend, processor, time, owner, account)
    }

    fn request(account: &Account, amount: i64) -> ExternalTransferRequest {
        ExternalTransferRequest {
            from_account_id: account.id,
            beneficiary_name: "Dana Whitfield".into(),
            beneficiary_bank: "First Example Bank".into(),
            account_number: "987654321".into(),
            routing_number: "021000021".into(),
            amount: Money::from_major(amount),
            description: None,
        }
    }

    #[test]
    fn test_external_transfer_debits_once() {
        let (backend, processor, time, owner, account) = setup(20_000);
        let receipt = processor.external_transfer(owner, &request(&account, 2_500), &time).unwrap();

        assert!(receipt.reference_number.starts_with("EXT-"));
        assert_eq!(receipt.new_balance, Money::from_major(17_500));
        let rows = backend.store.transactions_for_account(account.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].transaction_type, TransactionType::ExternalTransfer);
        assert_eq!(rows[0].reference, receipt.reference_number);
    }

    #[test]
    fn test_over_ceiling_rejected_before_debit() {
        let (backend, processor, time, owner, account) = setup(20_000);
        let err = processor.external_transfer(owner, &request(&account, 15_000), &time).unwrap_err();

        assert!(matches!(err, BankError::Validation { .. }));
        assert_eq!(backend.store.account(account.id).unwrap().balance, Money::from_major(20_000));
        assert_eq!(backend.store.transaction_count(), 0);
    }

    #[test]
    fn test_bad_routing_number() {
        let (_backend, processor, time, owner, account) = setup(100);
        let mut req = request(&account, 10);
        req.routing_number = "123456789".into();
        assert!(matches!(
            processor.external_transfer(owner, &req, &time),
            Err(BankError::Validation { .. })
        ));
    }

    #[test]
    fn test_ledger_failure_refunds_debit() {
        let (backend, processor, time, owner, account) = setup(1_000);
        backend.store.inject(Fault::InsertTransaction("EXT-".into()));

        assert!(processor.external_transfer(owner, &request(&account, 300), &time).is_err());
        assert_eq!(backend.store.account(account.id).unwrap().balance, Money::from_major(1_000));
        assert_eq!(backend.store.transaction_count(), 0);
        assert!(matches!(backend.audit.entries()[0].outcome, AuditOutcome::RolledBack { .. }));
    }
}
