#![allow(dead_code)]

use chrono::{NaiveDate, TimeZone, Utc};
use funds_ledger_rs::{
    Account, EngineConfig, EngineContext, InMemoryBackend, Loan, Money, Rate, SafeTimeProvider, TimeSource, UserId,
    Uuid,
};

pub struct Bank {
    pub backend: InMemoryBackend,
    pub ctx: EngineContext,
    pub time: SafeTimeProvider,
}

impl Bank {
    pub fn new() -> Self {
        Self::at(2024, 1, 15)
    }

    pub fn at(year: i32, month: u32, day: u32) -> Self {
        Self::with_config(year, month, day, EngineConfig::default())
    }

    pub fn with_config(year: i32, month: u32, day: u32, config: EngineConfig) -> Self {
        let backend = InMemoryBackend::new();
        let ctx = backend.context(config);
        let time = SafeTimeProvider::new(TimeSource::Test(Utc.with_ymd_and_hms(year, month, day, 9, 0, 0).unwrap()));
        Self { backend, ctx, time }
    }

    pub fn open_account(&self, owner: UserId, number: &str, balance: Money) -> Account {
        let account = Account::new(owner, number, balance);
        self.backend.store.insert_account(account.clone()).unwrap();
        account
    }

    /// 10,000 at 6% over 12 months starting today, funded from `account`
    pub fn originate_loan(&self, owner: UserId, account: &Account) -> Loan {
        let start: NaiveDate = self.time.now().date_naive();
        let loan = Loan::originate(owner, account.id, Money::from_major(10_000), Rate::from_percentage(6), 12, start)
            .unwrap();
        self.backend.store.insert_loan(loan.clone()).unwrap();
        loan
    }

    pub fn balance(&self, account: &Account) -> Money {
        use funds_ledger_rs::LedgerStore;
        self.backend.store.account(account.id).unwrap().balance
    }
}

pub fn user() -> UserId {
    Uuid::new_v4()
}

pub fn money(s: &str) -> Money {
    Money::from_str_exact(s).unwrap()
}
