//! Customer notifications.
//!
//! Delivery (email, SMS, push) belongs to an external service. The engine only
//! hands over a structured message and never waits on or fails because of it.

use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::types::{LoanId, UserId, WireTransferId};

/// all messages the engine can send to a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    // transfer messages
    TransferSent {
        recipient: UserId,
        amount: Money,
        to_account: String,
        reference: String,
        new_balance: Money,
    },
    TransferReceived {
        recipient: UserId,
        amount: Money,
        from_account: String,
        reference: String,
    },
    ExternalTransferSent {
        recipient: UserId,
        amount: Money,
        beneficiary_name: String,
        reference: String,
        new_balance: Money,
    },

    // wire messages
    WireVerificationCode {
        recipient: UserId,
        transfer_id: WireTransferId,
        /// plaintext, for the delivery service only
        code: String,
        expires_at: DateTime<Utc>,
    },
    WireProcessing {
        recipient: UserId,
        transfer_id: WireTransferId,
        amount: Money,
        reference: String,
    },
    WireSettled {
        recipient: UserId,
        transfer_id: WireTransferId,
        reference: String,
    },
    WireFailed {
        recipient: UserId,
        transfer_id: WireTransferId,
        reason: String,
        refunded: Money,
    },

    // loan messages
    LoanPaidOff {
        recipient: UserId,
        loan_id: LoanId,
        amount: Money,
        interest_waived: Money,
        reference: String,
    },
    LoanPaymentReceived {
        recipient: UserId,
        loan_id: LoanId,
        amount: Money,
        remaining_balance: Money,
        next_payment_date: Option<NaiveDate>,
    },
    LateFeeAssessed {
        recipient: UserId,
        loan_id: LoanId,
        fee: Money,
        due_date: Option<NaiveDate>,
    },
    AutoPaymentEnabled {
        recipient: UserId,
        loan_id: LoanId,
        account: String,
        payment_day: u32,
    },
    AutoPaymentDisabled {
        recipient: UserId,
        loan_id: LoanId,
    },
}

impl Notification {
    pub fn recipient(&self) -> UserId {
        match self {
            Notification::TransferSent { recipient, .. }
            | Notification::TransferReceived { recipient, .. }
            | Notification::ExternalTransferSent { recipient, .. }
            | Notification::WireVerificationCode { recipient, .. }
            | Notification::WireProcessing { recipient, .. }
            | Notification::WireSettled { recipient, .. }
            | Notification::WireFailed { recipient, .. }
            | Notification::LoanPaidOff { recipient, .. }
            | Notification::LoanPaymentReceived { recipient, .. }
            | Notification::LateFeeAssessed { recipient, .. }
            | Notification::AutoPaymentEnabled { recipient, .. }
            | Notification::AutoPaymentDisabled { recipient, .. } => *recipient,
        }
    }
}

/// fire-and-forget notification sink
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// collects notifications for a delivery worker to drain
#[derive(Debug, Default)]
pub struct NotificationOutbox {
    pending: Mutex<Vec<Notification>>,
}

impl NotificationOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// drain everything queued so far
    pub fn take(&self) -> Vec<Notification> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => Vec::new(),
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.pending.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Notifier for NotificationOutbox {
    fn notify(&self, notification: Notification) {
        match self.pending.lock() {
            Ok(mut pending) => pending.push(notification),
            Err(_) => tracing::warn!(recipient = %notification.recipient(), "notification outbox unavailable, message dropped"),
        }
    }
}
