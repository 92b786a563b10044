use chrono::{DateTime, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry, AuditOutcome};
use crate::decimal::Money;
use crate::errors::{BankError, Result};
use crate::ledger::{self, Posting, Transaction};
use crate::notify::Notification;
use crate::reference;
use crate::store::StoreError;
use crate::types::{AccountId, Actor, TransactionType, TransferGroupId, UserId};

use super::{Saga, TransferProcessor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalTransferRequest {
    pub from_account_id: AccountId,
    pub to_account_number: String,
    pub amount: Money,
    #[serde(default)]
    pub memo: Option<String>,
    /// retries carrying the same key return the first result
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalTransferReceipt {
    pub reference_number: String,
    pub transfer_group_id: TransferGroupId,
    pub new_balance: Money,
    /// true when this is the stored result of an earlier identical request
    #[serde(default)]
    pub replayed: bool,
}

impl TransferProcessor {
    /// Move funds between two accounts held at this bank.
    ///
    /// Either both legs and both ledger rows are written, or every applied
    /// step is reversed before the error is returned.
    pub fn internal_transfer(
        &self,
        caller: UserId,
        request: &InternalTransferRequest,
        time: &SafeTimeProvider,
    ) -> Result<InternalTransferReceipt> {
        let now = time.now();
        let mut saga = Saga::new(&self.ctx, "internal transfer", now);

        match self.run_internal(caller, request, now, &mut saga) {
            Ok(receipt) => Ok(receipt),
            Err(e) => Err(saga.abort(e, |outcome| {
                AuditEntry::new(Actor::User(caller), AuditAction::InternalTransfer, outcome, now)
                    .subject(request.from_account_id)
                    .amount(request.amount)
            })),
        }
    }

    fn run_internal(
        &self,
        caller: UserId,
        request: &InternalTransferRequest,
        now: DateTime<Utc>,
        saga: &mut Saga<'_>,
    ) -> Result<InternalTransferReceipt> {
        self.gate.validate_internal_amount(request.amount)?;
        self.gate.validate_memo(request.memo.as_deref())?;

        let base = match &request.idempotency_key {
            Some(key) => {
                let base = reference::from_idempotency_key(reference::INTERNAL_PREFIX, key)?;
                match self.resolve_key(caller, request, &base)? {
                    KeyState::Applied(receipt) => return Ok(receipt),
                    KeyState::Unused(reference) => reference,
                }
            }
            None => reference::generate(reference::INTERNAL_PREFIX),
        };

        let source = self.source_account(caller, request.from_account_id)?;
        let destination = match self.ctx.ledger.account_by_number(request.to_account_number.trim()) {
            Ok(account) => account,
            Err(StoreError::NotFound { .. }) => {
                return Err(BankError::not_found("Account", &request.to_account_number))
            }
            Err(e) => return Err(e.into()),
        };
        if destination.id == source.id {
            return Err(BankError::validation("cannot transfer to the same account"));
        }
        if !destination.is_active() {
            return Err(BankError::validation("destination account is not active"));
        }
        if source.balance < request.amount {
            return Err(BankError::insufficient_funds(request.amount, source.balance));
        }

        let group = reference::new_transfer_group();
        let debit_ref = reference::debit_leg(&base);
        let credit_ref = reference::credit_leg(&base);
        let retry = &self.ctx.config.retry;

        let debit = ledger::debit(self.ctx.ledger.as_ref(), source.id, request.amount, Posting::Regular, retry)?;
        saga.debited(&debit, request.amount);

        let credit = ledger::credit(self.ctx.ledger.as_ref(), destination.id, request.amount, Posting::Regular, retry)?;
        saga.credited(&credit, request.amount);

        let description = request
            .memo
            .clone()
            .unwrap_or_else(|| format!("transfer to {}", destination.masked_number()));
        let debit_row = Transaction::posted(&debit, TransactionType::Debit, request.amount, debit_ref.clone(), Some(description), now)
            .in_group(group);
        self.ctx.ledger.insert_transaction(&debit_row)?;
        saga.posted(source.id, &debit_ref);

        let credit_row = Transaction::posted(
            &credit,
            TransactionType::Credit,
            request.amount,
            credit_ref.clone(),
            Some(format!("transfer from {}", source.masked_number())),
            now,
        )
        .in_group(group);
        self.ctx.ledger.insert_transaction(&credit_row)?;
        saga.posted(destination.id, &credit_ref);

        tracing::info!(
            reference = %base,
            transfer_group_id = %group,
            amount = %request.amount,
            "internal transfer completed"
        );

        self.ctx.notify(Notification::TransferSent {
            recipient: source.owner_id,
            amount: request.amount,
            to_account: destination.masked_number(),
            reference: debit_ref,
            new_balance: debit.after,
        });
        self.ctx.notify(Notification::TransferReceived {
            recipient: destination.owner_id,
            amount: request.amount,
            from_account: source.masked_number(),
            reference: credit_ref,
        });
        self.ctx.record(
            AuditEntry::new(Actor::User(caller), AuditAction::InternalTransfer, AuditOutcome::Success, now)
                .subject(source.id)
                .reference(&base)
                .amount(request.amount)
                .balance(debit)
                .balance(credit),
        );

        Ok(InternalTransferReceipt {
            reference_number: base,
            transfer_group_id: group,
            new_balance: debit.after,
            replayed: false,
        })
    }

    /// Look up earlier attempts made under an idempotency key.
    ///
    /// An attempt whose debit row was reversed never applied, so the key
    /// moves on to the next attempt reference. An attempt counts as applied
    /// only once both legs are posted.
    fn resolve_key(&self, caller: UserId, request: &InternalTransferRequest, base: &str) -> Result<KeyState> {
        let ledger = self.ctx.ledger.as_ref();
        let mut n = 1;
        loop {
            let attempt = reference::attempt(base, n);
            let debit_ref = reference::debit_leg(&attempt);
            let Some(previous) = ledger.transaction_by_reference(&debit_ref)? else {
                return Ok(KeyState::Unused(attempt));
            };

            let source = super::load_owned_account(&self.ctx, caller, request.from_account_id)?;
            if previous.account_id != source.id || previous.amount != request.amount {
                return Err(BankError::conflict("idempotency key was already used for a different transfer"));
            }

            if ledger.transaction_by_reference(&reference::reversal_of(&debit_ref))?.is_some() {
                tracing::info!(reference = %attempt, "earlier attempt was rolled back, retrying");
                n += 1;
                continue;
            }
            if ledger.transaction_by_reference(&reference::credit_leg(&attempt))?.is_none() {
                return Err(BankError::conflict("a transfer with this idempotency key has not finished"));
            }

            let group = previous
                .transfer_group_id
                .ok_or_else(|| BankError::system("transfer record is missing its group"))?;
            tracing::info!(reference = %attempt, "replaying completed internal transfer");
            return Ok(KeyState::Applied(InternalTransferReceipt {
                reference_number: attempt,
                transfer_group_id: group,
                new_balance: previous.balance_after,
                replayed: true,
            }));
        }
    }
}

/// where an idempotency key stands
enum KeyState {
    /// nothing applied yet, run under this reference
    Unused(String),
    Applied(InternalTransferReceipt),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::InMemoryBackend;
    use crate::ledger::Account;
    use crate::store::memory::Fault;
    use crate::store::LedgerStore;
    use crate::types::TransactionStatus;
    use chrono::TimeZone;
    use hourglass_rs::TimeSource;
    use uuid::Uuid;

    struct Fixture {
        backend: InMemoryBackend,
        processor: TransferProcessor,
        time: SafeTimeProvider,
        alice: UserId,
        a: Account,
        b: Account,
    }

    fn fixture() -> Fixture {
        let backend = InMemoryBackend::new();
        let processor = TransferProcessor::new(backend.context(EngineConfig::default()));
        let time = SafeTimeProvider::new(TimeSource::Test(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let alice = Uuid::new_v4();
        let a = Account::new(alice, "10000001", Money::from_major(500));
        let b = Account::new(Uuid::new_v4(), "20000002", Money::from_major(200));
        backend.store.insert_account(a.clone()).unwrap();
        backend.store.insert_account(b.clone()).unwrap();
        Fixture {
            backend,
            processor,
            time,
            alice,
            a,
            b,
        }
    }

    fn request(f: &Fixture, amount: i64) -> InternalTransferRequest {
        InternalTransferRequest {
            from_account_id: f.a.id,
            to_account_number: f.b.account_number.clone(),
            amount: Money::from_major(amount),
            memo: Some("rent".into()),
            idempotency_key: None,
        }
    }

    fn balance(f: &Fixture, id: AccountId) -> Money {
        f.backend.store.account(id).unwrap().balance
    }

    #[test]
    fn test_transfer_moves_funds_and_links_rows() {
        let f = fixture();
        let receipt = f.processor.internal_transfer(f.alice, &request(&f, 100), &f.time).unwrap();

        assert_eq!(receipt.new_balance, Money::from_major(400));
        assert_eq!(balance(&f, f.a.id), Money::from_major(400));
        assert_eq!(balance(&f, f.b.id), Money::from_major(300));

        let rows = f.backend.store.transactions_in_group(receipt.transfer_group_id).unwrap();
        assert_eq!(rows.len(), 2);
        let dr = rows.iter().find(|r| r.reference.ends_with("-DR")).unwrap();
        let cr = rows.iter().find(|r| r.reference.ends_with("-CR")).unwrap();
        assert_eq!(dr.reference, format!("{}-DR", receipt.reference_number));
        assert_eq!(cr.reference, format!("{}-CR", receipt.reference_number));
        assert_eq!(dr.amount, cr.amount);
        assert_eq!(dr.status, TransactionStatus::Completed);
        assert_eq!((dr.balance_before, dr.balance_after), (Money::from_major(500), Money::from_major(400)));
        assert_eq!((cr.balance_before, cr.balance_after), (Money::from_major(200), Money::from_major(300)));

        assert_eq!(f.backend.outbox.len(), 2);
        assert!(f.backend.audit.entries()[0].outcome.is_success());
    }

    #[test]
    fn test_insufficient_funds_changes_nothing() {
        let f = fixture();
        let err = f.processor.internal_transfer(f.alice, &request(&f, 1000), &f.time).unwrap_err();

        match err {
            BankError::InsufficientFunds {
                required,
                available,
                shortfall,
            } => {
                assert_eq!(required, Money::from_major(1000));
                assert_eq!(available, Money::from_major(500));
                assert_eq!(shortfall, Money::from_major(500));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(balance(&f, f.a.id), Money::from_major(500));
        assert_eq!(balance(&f, f.b.id), Money::from_major(200));
        assert_eq!(f.backend.store.transaction_count(), 0);
        assert!(matches!(f.backend.audit.entries()[0].outcome, AuditOutcome::Rejected { .. }));
    }

    #[test]
    fn test_foreign_source_is_not_found() {
        let f = fixture();
        let err = f.processor.internal_transfer(Uuid::new_v4(), &request(&f, 10), &f.time).unwrap_err();
        assert!(matches!(err, BankError::NotFound { .. }));
    }

    #[test]
    fn test_same_account_rejected() {
        let f = fixture();
        let mut req = request(&f, 10);
        req.to_account_number = f.a.account_number.clone();
        assert!(matches!(
            f.processor.internal_transfer(f.alice, &req, &f.time),
            Err(BankError::Validation { .. })
        ));
    }

    #[test]
    fn test_credit_failure_reverses_debit() {
        let f = fixture();
        f.backend.store.inject(Fault::UpdateBalance(f.b.id));

        let err = f.processor.internal_transfer(f.alice, &request(&f, 100), &f.time).unwrap_err();
        assert!(matches!(err, BankError::System { .. }));
        assert_eq!(balance(&f, f.a.id), Money::from_major(500));
        assert_eq!(balance(&f, f.b.id), Money::from_major(200));
        assert_eq!(f.backend.store.transaction_count(), 0);
        assert!(matches!(f.backend.audit.entries()[0].outcome, AuditOutcome::RolledBack { .. }));
        assert!(f.backend.outbox.is_empty());
    }

    #[test]
    fn test_second_row_failure_reverses_both_legs() {
        let f = fixture();
        f.backend.store.inject(Fault::InsertTransaction("-CR".into()));

        assert!(f.processor.internal_transfer(f.alice, &request(&f, 100), &f.time).is_err());
        assert_eq!(balance(&f, f.a.id), Money::from_major(500));
        assert_eq!(balance(&f, f.b.id), Money::from_major(200));

        // the debit row was already posted, so it gets an offsetting credit row
        let rows = f.backend.store.transactions_for_account(f.a.id).unwrap();
        assert_eq!(rows.len(), 2);
        let reversal = rows.iter().find(|r| r.reference.ends_with("-DR-RV")).unwrap();
        assert_eq!(reversal.transaction_type, TransactionType::Credit);
        assert!(f.backend.store.transactions_for_account(f.b.id).unwrap().is_empty());
    }

    #[test]
    fn test_idempotent_retry_returns_first_result() {
        let f = fixture();
        let mut req = request(&f, 100);
        req.idempotency_key = Some("client-req-0001".into());

        let first = f.processor.internal_transfer(f.alice, &req, &f.time).unwrap();
        let second = f.processor.internal_transfer(f.alice, &req, &f.time).unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.reference_number, second.reference_number);
        assert_eq!(first.transfer_group_id, second.transfer_group_id);
        assert_eq!(balance(&f, f.a.id), Money::from_major(400));
        assert_eq!(f.backend.store.transaction_count(), 2);

        req.amount = Money::from_major(50);
        assert!(matches!(
            f.processor.internal_transfer(f.alice, &req, &f.time),
            Err(BankError::Conflict { .. })
        ));
    }

    #[test]
    fn test_retry_after_rollback_runs_the_transfer() {
        let f = fixture();
        let mut req = request(&f, 100);
        req.idempotency_key = Some("client-req-0001".into());

        f.backend.store.inject(Fault::InsertTransaction("-CR".into()));
        assert!(f.processor.internal_transfer(f.alice, &req, &f.time).is_err());
        assert_eq!(balance(&f, f.a.id), Money::from_major(500));
        assert_eq!(balance(&f, f.b.id), Money::from_major(200));

        let retry = f.processor.internal_transfer(f.alice, &req, &f.time).unwrap();
        assert!(!retry.replayed);
        assert_eq!(retry.reference_number, "TRF-CLIENT-REQ-0001-A2");
        assert_eq!(retry.new_balance, Money::from_major(400));
        assert_eq!(balance(&f, f.a.id), Money::from_major(400));
        assert_eq!(balance(&f, f.b.id), Money::from_major(300));

        // a further retry replays the applied attempt
        let replay = f.processor.internal_transfer(f.alice, &req, &f.time).unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.reference_number, retry.reference_number);
        assert_eq!(replay.transfer_group_id, retry.transfer_group_id);
        assert_eq!(balance(&f, f.b.id), Money::from_major(300));
    }

    #[test]
    fn test_half_posted_key_is_not_replayed() {
        let f = fixture();
        let mut req = request(&f, 100);
        req.idempotency_key = Some("client-req-0002".into());

        // debit row present without a credit row or a reversal
        let debit = f.backend.store.account(f.a.id).unwrap();
        let change = crate::ledger::BalanceChange {
            account_id: debit.id,
            before: debit.balance,
            after: debit.balance - Money::from_major(100),
        };
        let row = Transaction::posted(
            &change,
            TransactionType::Debit,
            Money::from_major(100),
            "TRF-CLIENT-REQ-0002-DR".into(),
            None,
            f.time.now(),
        )
        .in_group(Uuid::new_v4());
        f.backend.store.insert_transaction(&row).unwrap();

        assert!(matches!(
            f.processor.internal_transfer(f.alice, &req, &f.time),
            Err(BankError::Conflict { .. })
        ));
    }

    #[test]
    fn test_conservation_over_many_transfers() {
        let f = fixture();
        let before = balance(&f, f.a.id) + balance(&f, f.b.id);
        for amount in [1, 7, 33, 120, 400] {
            let _ = f.processor.internal_transfer(f.alice, &request(&f, amount), &f.time);
        }
        assert_eq!(balance(&f, f.a.id) + balance(&f, f.b.id), before);
        assert!(!balance(&f, f.a.id).is_negative());
    }
}
