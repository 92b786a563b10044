/// internal transfer - move funds between two customers and inspect the ledger
use funds_ledger_rs::{
    Account, EngineConfig, InMemoryBackend, InternalTransferRequest, LedgerStore, Money, SafeTimeProvider, TimeSource,
    TransferProcessor, Uuid,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();
    println!("=== internal transfer example ===\n");

    let backend = InMemoryBackend::new();
    let processor = TransferProcessor::new(backend.context(EngineConfig::default()));
    let time = SafeTimeProvider::new(TimeSource::System);

    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let checking = Account::new(alice, "40010001", Money::from_major(500));
    let savings = Account::new(bob, "40010002", Money::from_major(100));
    backend.store.insert_account(checking.clone())?;
    backend.store.insert_account(savings.clone())?;

    let request = InternalTransferRequest {
        from_account_id: checking.id,
        to_account_number: savings.account_number.clone(),
        amount: Money::from_str_exact("200.00")?,
        memo: Some("rent share".into()),
        idempotency_key: Some("rent-2024-05".into()),
    };
    let receipt = processor.internal_transfer(alice, &request, &time)?;
    println!("reference: {}", receipt.reference_number);
    println!("new balance: ${}", receipt.new_balance);

    // retrying with the same key replays the first result
    let replay = processor.internal_transfer(alice, &request, &time)?;
    println!("replayed: {} (same reference: {})", replay.replayed, replay.reference_number == receipt.reference_number);

    // more than the balance
    let too_much = InternalTransferRequest {
        amount: Money::from_major(1_000),
        idempotency_key: None,
        ..request
    };
    if let Err(e) = processor.internal_transfer(alice, &too_much, &time) {
        println!("rejected: {}", e);
    }

    println!("\nledger rows:");
    for account in [&checking, &savings] {
        for row in backend.store.transactions_for_account(account.id)? {
            println!(
                "  {} {:?} {} ({} -> {})",
                row.reference, row.transaction_type, row.amount, row.balance_before, row.balance_after
            );
        }
    }

    println!("\nnotifications: {}", backend.outbox.len());
    println!("audit entries: {}", backend.audit.len());
    Ok(())
}
