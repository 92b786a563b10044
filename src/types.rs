use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// unique identifier for a customer
pub type UserId = Uuid;

/// unique identifier for a deposit account
pub type AccountId = Uuid;

/// unique identifier for a ledger row
pub type TransactionId = Uuid;

/// links the two legs of an internal transfer
pub type TransferGroupId = Uuid;

/// unique identifier for a wire transfer
pub type WireTransferId = Uuid;

/// unique identifier for a loan
pub type LoanId = Uuid;

/// unique identifier for a loan payment row
pub type LoanPaymentId = Uuid;

/// deposit account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
    Closed,
}

/// ledger row type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Debit,
    Credit,
    Withdrawal,
    Deposit,
    LoanPayoff,
    LoanPayment,
    ExternalTransfer,
    WireTransfer,
}

/// ledger row and loan payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
    Pending,
    Failed,
}

/// loan status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    /// application received, not yet approved
    Pending,
    /// approved and being repaid
    Active,
    /// fully repaid or settled early (terminal)
    Completed,
    Rejected,
}

/// how a loan payment came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Manual,
    Auto,
    LateFee,
    EarlyPayoff,
}

/// wire transfer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    PendingVerification,
    Processing,
    Settled,
    Failed,
}

impl WireStatus {
    /// whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: WireStatus) -> bool {
        matches!(
            (self, next),
            (WireStatus::PendingVerification, WireStatus::Processing)
                | (WireStatus::PendingVerification, WireStatus::Failed)
                | (WireStatus::Processing, WireStatus::Settled)
                | (WireStatus::Processing, WireStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WireStatus::Settled | WireStatus::Failed)
    }
}

/// who is performing an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Actor {
    User(UserId),
    /// scheduler-triggered batch jobs
    System,
}
