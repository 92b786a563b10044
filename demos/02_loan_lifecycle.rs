/// loan lifecycle - late fee, catch-up payment, auto-pay and early payoff with controlled time
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use funds_ledger_rs::{
    Account, AutoPayment, AutoPaymentSettings, EarlyPayoffCalculator, EngineConfig, InMemoryBackend, LateFeeAssessor,
    Loan, LoanServicer, Money, PaymentRequest, Rate, SafeTimeProvider, TimeSource, Uuid,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();
    println!("=== loan lifecycle example ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()));
    let controller = time.test_control().unwrap();

    let backend = InMemoryBackend::new();
    let ctx = backend.context(EngineConfig::default());
    let owner = Uuid::new_v4();
    let account = Account::new(owner, "40020001", Money::from_major(20_000));
    let loan = Loan::originate(
        owner,
        account.id,
        Money::from_major(10_000),
        Rate::from_percentage(6),
        12,
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
    )?;
    backend.store.insert_account(account.clone())?;
    backend.store.insert_loan(loan.clone())?;

    let servicer = LoanServicer::new(ctx.clone());
    let schedule = servicer.schedule(owner, loan.id)?;
    println!("monthly payment: ${}", schedule.monthly_payment);
    println!("total interest: ${}", schedule.total_interest);

    // miss the first due date
    controller.advance(Duration::days(36));
    let run = LateFeeAssessor::new(ctx.clone()).assess(&time)?;
    println!("\n{}: late fees assessed on {} loan(s)", time.now().format("%Y-%m-%d"), run.processed_count);

    let request = PaymentRequest {
        funding_account_id: account.id,
        amount: None,
    };
    let receipt = servicer.pay_installment(owner, loan.id, &request, &time)?;
    println!(
        "catch-up payment ${}: fees ${}, interest ${}, principal ${}, late: {}",
        receipt.amount,
        receipt.allocation.to_late_fees,
        receipt.allocation.to_interest,
        receipt.allocation.to_principal,
        receipt.is_late
    );

    let autopay = AutoPayment::new(ctx.clone());
    autopay.enable(
        owner,
        loan.id,
        AutoPaymentSettings {
            account_id: account.id,
            payment_day: 15,
        },
        &time,
    )?;
    controller.advance(Duration::days(24));
    let collected = autopay.run_due(&time)?;
    println!("{}: auto-pay collected ${}", time.now().format("%Y-%m-%d"), collected.total_processed());

    let payoff = EarlyPayoffCalculator::new(ctx);
    let quote = payoff.quote(owner, loan.id)?;
    println!(
        "\npayoff quote: outstanding ${}, discount ${}, pay ${}",
        quote.outstanding_principal, quote.discount, quote.payoff_amount
    );
    let settlement = payoff.execute(owner, loan.id, account.id, &time)?;
    println!("loan {:?}, account balance ${}", settlement.loan_status, settlement.new_account_balance);

    Ok(())
}
