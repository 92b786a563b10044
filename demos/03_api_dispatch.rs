/// api dispatch - drive the engine through the request dispatcher
use std::sync::Arc;

use funds_ledger_rs::{
    Account, ApiRequest, BankingApi, EngineConfig, InMemoryBackend, Money, Notification, SafeTimeProvider,
    StaticTokenAuthenticator, TimeSource, Uuid,
};
use serde_json::json;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();
    println!("=== api dispatch example ===\n");

    let backend = InMemoryBackend::new();
    let customer = Uuid::new_v4();
    let auth = StaticTokenAuthenticator::new()
        .with_user("customer-token", customer)
        .with_system("scheduler-token");
    let api = BankingApi::new(backend.context(EngineConfig::default()), Arc::new(auth));
    let time = SafeTimeProvider::new(TimeSource::System);

    let account = Account::new(customer, "40030001", Money::from_major(25_000));
    backend.store.insert_account(account.clone())?;

    let initiated = api.handle(
        ApiRequest::post(
            "/transfers/wire",
            json!({
                "from_account_id": account.id,
                "beneficiary_name": "Contoso Supply",
                "beneficiary_bank": "Pacific Commerce Bank",
                "account_number": "5566778899",
                "routing_number": "021000021",
                "swift_code": "PCBKUS6L",
                "amount": "12000.00",
            }),
        )
        .bearer("customer-token"),
        &time,
    );
    println!("initiate -> {} {}", initiated.status, initiated.body);

    // the code arrives out of band
    let code = backend
        .outbox
        .take()
        .into_iter()
        .find_map(|n| match n {
            Notification::WireVerificationCode { code, .. } => Some(code),
            _ => None,
        })
        .ok_or("no verification code delivered")?;

    let completed = api.handle(
        ApiRequest::post(
            "/transfers/wire/complete",
            json!({"transfer_id": initiated.body["transfer_id"], "verification_code": code}),
        )
        .bearer("customer-token"),
        &time,
    );
    println!("complete -> {} {}", completed.status, completed.body);

    let external = api.handle(
        ApiRequest::post(
            "/transfers/external",
            json!({
                "from_account_id": account.id,
                "beneficiary_name": "Contoso Supply",
                "beneficiary_bank": "Pacific Commerce Bank",
                "account_number": "5566778899",
                "routing_number": "021000021",
                "amount": "15000.00",
            }),
        )
        .bearer("customer-token"),
        &time,
    );
    println!("external over ceiling -> {} {}", external.status, external.body);

    let forbidden = api.handle(
        ApiRequest::post("/loans/late-fee-assessment", serde_json::Value::Null).bearer("customer-token"),
        &time,
    );
    println!("late fees as customer -> {} {}", forbidden.status, forbidden.body);

    Ok(())
}
