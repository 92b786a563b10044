//! Account-to-account transfers: internal, external (ACH) and wire.

pub mod external;
pub mod internal;
pub mod saga;
pub mod wire;

use crate::context::EngineContext;
use crate::errors::{BankError, Result};
use crate::ledger::Account;
use crate::store::StoreError;
use crate::types::{AccountId, UserId};
use crate::validation::ValidationGate;

pub use external::{ExternalTransferReceipt, ExternalTransferRequest};
pub use internal::{InternalTransferReceipt, InternalTransferRequest};
pub use saga::{Saga, Step};
pub use wire::{WireCompletion, WireInitiation, WireRequest};

/// orchestrates every money movement between accounts
#[derive(Debug, Clone)]
pub struct TransferProcessor {
    ctx: EngineContext,
    gate: ValidationGate,
}

impl TransferProcessor {
    pub fn new(ctx: EngineContext) -> Self {
        let gate = ctx.gate();
        Self { ctx, gate }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Source account for a customer-initiated movement.
    ///
    /// Accounts owned by someone else are reported as missing.
    fn source_account(&self, caller: UserId, account_id: AccountId) -> Result<Account> {
        let account = load_owned_account(&self.ctx, caller, account_id)?;
        if !account.is_active() {
            return Err(BankError::validation(format!(
                "account {} is not active",
                account.masked_number()
            )));
        }
        Ok(account)
    }
}

/// account lookup that hides other customers' accounts behind NotFound
pub(crate) fn load_owned_account(ctx: &EngineContext, caller: UserId, account_id: AccountId) -> Result<Account> {
    match ctx.ledger.account(account_id) {
        Ok(account) if account.is_owned_by(caller) => Ok(account),
        Ok(_) | Err(StoreError::NotFound { .. }) => Err(BankError::not_found("Account", account_id)),
        Err(e) => Err(e.into()),
    }
}
