mod common;

use common::{money, user, Bank};
use funds_ledger_rs::store::memory::Fault;
use funds_ledger_rs::types::{TransactionType, WireStatus};
use funds_ledger_rs::{
    AuditAction, BankError, EngineConfig, ExternalTransferRequest, InternalTransferRequest, LedgerStore, Money, Notification,
    SafeTimeProvider, TimeSource, TransferProcessor, WireRequest,
};

fn internal(from: &funds_ledger_rs::Account, to_number: &str, amount: &str) -> InternalTransferRequest {
    InternalTransferRequest {
        from_account_id: from.id,
        to_account_number: to_number.to_string(),
        amount: money(amount),
        memo: None,
        idempotency_key: None,
    }
}

#[test]
fn internal_transfer_posts_paired_rows() {
    let bank = Bank::new();
    let (alice, bob) = (user(), user());
    let a = bank.open_account(alice, "10000001", Money::from_major(500));
    let b = bank.open_account(bob, "10000002", Money::from_major(100));
    let processor = TransferProcessor::new(bank.ctx.clone());

    let receipt = processor.internal_transfer(alice, &internal(&a, "10000002", "200.00"), &bank.time).unwrap();

    assert_eq!(bank.balance(&a), Money::from_major(300));
    assert_eq!(bank.balance(&b), Money::from_major(300));
    let rows = bank.backend.store.transactions_in_group(receipt.transfer_group_id).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r.reference == format!("{}-DR", receipt.reference_number)));
    assert!(rows.iter().any(|r| r.reference == format!("{}-CR", receipt.reference_number)));
    assert_eq!(bank.backend.audit.entries_for(AuditAction::InternalTransfer).len(), 1);
}

#[test]
fn insufficient_funds_changes_nothing() {
    let bank = Bank::new();
    let alice = user();
    let a = bank.open_account(alice, "10000001", Money::from_major(50));
    let b = bank.open_account(user(), "10000002", Money::ZERO);
    let processor = TransferProcessor::new(bank.ctx.clone());

    let err = processor.internal_transfer(alice, &internal(&a, "10000002", "75.00"), &bank.time).unwrap_err();
    match err {
        BankError::InsufficientFunds { shortfall, .. } => assert_eq!(shortfall, money("25.00")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(bank.balance(&a), Money::from_major(50));
    assert_eq!(bank.balance(&b), Money::ZERO);
    assert_eq!(bank.backend.store.transaction_count(), 0);
}

#[test]
fn concurrent_transfers_never_overdraw() {
    let mut config = EngineConfig::default();
    config.retry.max_attempts = 100;
    let bank = Bank::with_config(2024, 1, 15, config);
    let alice = user();
    let a = bank.open_account(alice, "10000001", Money::from_major(1_000));
    let b = bank.open_account(user(), "10000002", Money::ZERO);
    let processor = TransferProcessor::new(bank.ctx.clone());

    let outcomes: Vec<bool> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let processor = &processor;
                let a = &a;
                s.spawn(move || {
                    let time = SafeTimeProvider::new(TimeSource::System);
                    (0..5)
                        .map(|_| {
                            processor
                                .internal_transfer(alice, &internal(a, "10000002", "30.00"), &time)
                                .is_ok()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let succeeded = outcomes.iter().filter(|ok| **ok).count() as i64;
    let moved = Money::from_major(30 * succeeded);
    assert_eq!(bank.balance(&a), Money::from_major(1_000) - moved);
    assert_eq!(bank.balance(&b), moved);
    assert!(!bank.balance(&a).is_negative());
    assert_eq!(bank.balance(&a) + bank.balance(&b), Money::from_major(1_000));
}

#[test]
fn external_transfer_ceiling_and_rollback() {
    let bank = Bank::new();
    let alice = user();
    let a = bank.open_account(alice, "10000001", Money::from_major(50_000));
    let processor = TransferProcessor::new(bank.ctx.clone());
    let request = |amount: &str| ExternalTransferRequest {
        from_account_id: a.id,
        beneficiary_name: "Sam Ortiz".into(),
        beneficiary_bank: "Harbor Credit Union".into(),
        account_number: "44556677".into(),
        routing_number: "021000021".into(),
        amount: money(amount),
        description: None,
    };

    assert!(matches!(
        processor.external_transfer(alice, &request("15000.00"), &bank.time),
        Err(BankError::Validation { .. })
    ));

    bank.backend.store.inject(Fault::InsertTransaction("EXT-".into()));
    assert!(processor.external_transfer(alice, &request("100.00"), &bank.time).is_err());
    assert_eq!(bank.balance(&a), Money::from_major(50_000));

    processor.external_transfer(alice, &request("100.00"), &bank.time).unwrap();
    assert_eq!(bank.balance(&a), money("49900.00"));
}

#[test]
fn wire_flow_with_delivered_code() {
    let bank = Bank::new();
    let alice = user();
    let a = bank.open_account(alice, "10000001", Money::from_major(5_000));
    let processor = TransferProcessor::new(bank.ctx.clone());
    let request = WireRequest {
        from_account_id: a.id,
        beneficiary_name: "Meridian Imports".into(),
        beneficiary_bank: "Coastal Trust".into(),
        account_number: "99887766".into(),
        routing_number: "021000021".into(),
        swift_code: Some("CHASUS33".into()),
        amount: Money::from_major(1_200),
    };

    let initiation = processor.initiate_wire(alice, &request, &bank.time).unwrap();
    let code = bank
        .backend
        .outbox
        .take()
        .into_iter()
        .find_map(|n| match n {
            Notification::WireVerificationCode { code, .. } => Some(code),
            _ => None,
        })
        .unwrap();

    let completion = processor.wire_transfer_complete(alice, initiation.transfer.id, &code, &bank.time).unwrap();
    assert_eq!(completion.status, WireStatus::Processing);
    assert_eq!(bank.balance(&a), Money::from_major(3_800));

    // reusing the code fails and moves no money
    assert!(processor.wire_transfer_complete(alice, initiation.transfer.id, &code, &bank.time).is_err());
    assert_eq!(bank.balance(&a), Money::from_major(3_800));

    let settled = processor.settle_wire(initiation.transfer.id, &bank.time).unwrap();
    assert_eq!(settled.status, WireStatus::Settled);
    let rows = bank.backend.store.transactions_for_account(a.id).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].transaction_type, TransactionType::WireTransfer);
}
