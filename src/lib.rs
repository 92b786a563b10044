pub mod api;
pub mod audit;
pub mod config;
pub mod context;
pub mod decimal;
pub mod errors;
pub mod ledger;
pub mod loans;
pub mod notify;
pub mod reference;
pub mod store;
pub mod transfers;
pub mod types;
pub mod validation;

// re-export key types
pub use api::{ApiRequest, ApiResponse, Authenticator, BankingApi, ErrorBody, Principal, StaticTokenAuthenticator};
pub use audit::{AuditAction, AuditEntry, AuditLog, AuditOutcome, MemoryAuditLog};
pub use config::EngineConfig;
pub use context::{EngineContext, InMemoryBackend};
pub use decimal::{Money, Rate};
pub use errors::{BankError, ErrorKind, Result};
pub use ledger::{Account, Transaction, WireTransfer};
pub use loans::{
    AmortizationSchedule, AutoPayment, AutoPaymentSettings, BatchSummary, EarlyPayoffCalculator, InstallmentReceipt,
    LateFeeAssessor, Loan, LoanPayment, LoanServicer, PaymentRequest, PayoffQuote, PayoffSettlement,
};
pub use notify::{Notification, NotificationOutbox, Notifier};
pub use store::{LedgerStore, LoanStore, MemoryStore, StoreError};
pub use transfers::{
    ExternalTransferReceipt, ExternalTransferRequest, InternalTransferReceipt, InternalTransferRequest,
    TransferProcessor, WireCompletion, WireInitiation, WireRequest,
};
pub use types::{AccountId, LoanId, UserId, WireStatus, WireTransferId};

// re-export external dependencies that users will need
pub use chrono;
pub use hourglass_rs::{SafeTimeProvider, TimeSource};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
