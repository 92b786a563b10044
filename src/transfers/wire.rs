//! Wire transfers.
//!
//! `pending_verification -> processing -> settled | failed`. Entering
//! processing spends a one-time code bound to the transfer; the code is
//! consumed with a conditional write before any money moves, so two racing
//! completions can never both debit.

use chrono::{DateTime, Duration, Utc};
use hourglass_rs::SafeTimeProvider;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditOutcome};
use crate::decimal::Money;
use crate::errors::{BankError, Result};
use crate::ledger::{self, Posting, Transaction, VerificationCode, WireTransfer};
use crate::notify::Notification;
use crate::reference;
use crate::store::StoreError;
use crate::types::{AccountId, Actor, TransactionType, UserId, WireStatus, WireTransferId};
use crate::validation::{
    validate_account_number, validate_beneficiary_name, validate_routing_number, validate_swift_code,
};

use super::{Saga, Step, TransferProcessor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub from_account_id: AccountId,
    pub beneficiary_name: String,
    pub beneficiary_bank: String,
    pub account_number: String,
    pub routing_number: String,
    #[serde(default)]
    pub swift_code: Option<String>,
    pub amount: Money,
}

/// a wire waiting for its verification code
#[derive(Debug, Clone, PartialEq)]
pub struct WireInitiation {
    pub transfer: WireTransfer,
    /// plaintext code, also handed to the notifier for delivery
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCompletion {
    pub transfer_id: WireTransferId,
    pub reference_number: String,
    pub status: WireStatus,
    pub new_balance: Money,
}

fn generate_code(length: u32) -> String {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect()
}

impl TransferProcessor {
    /// Create a wire in `pending_verification` and issue its one-time code.
    pub fn initiate_wire(&self, caller: UserId, request: &WireRequest, time: &SafeTimeProvider) -> Result<WireInitiation> {
        let now = time.now();
        match self.run_initiate(caller, request, now) {
            Ok(initiation) => Ok(initiation),
            Err(e) => {
                self.ctx.record(
                    AuditEntry::new(Actor::User(caller), AuditAction::WireInitiated, AuditOutcome::rejected(&e), now)
                        .subject(request.from_account_id)
                        .amount(request.amount),
                );
                Err(e)
            }
        }
    }

    fn run_initiate(&self, caller: UserId, request: &WireRequest, now: DateTime<Utc>) -> Result<WireInitiation> {
        self.gate.validate_wire_amount(request.amount)?;
        validate_beneficiary_name(&request.beneficiary_name)?;
        validate_routing_number(&request.routing_number)?;
        validate_account_number(&request.account_number)?;
        if let Some(swift) = &request.swift_code {
            validate_swift_code(swift)?;
        }
        if request.beneficiary_bank.trim().is_empty() {
            return Err(BankError::validation("beneficiary bank is required"));
        }

        let source = self.source_account(caller, request.from_account_id)?;
        if source.balance < request.amount {
            return Err(BankError::insufficient_funds(request.amount, source.balance));
        }

        let wire = WireTransfer {
            id: Uuid::new_v4(),
            owner_id: caller,
            from_account_id: source.id,
            beneficiary_name: request.beneficiary_name.trim().to_string(),
            beneficiary_bank: request.beneficiary_bank.trim().to_string(),
            account_number: request.account_number.clone(),
            routing_number: request.routing_number.clone(),
            swift_code: request.swift_code.clone(),
            amount: request.amount,
            status: WireStatus::PendingVerification,
            reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.ctx.ledger.insert_wire_transfer(&wire)?;

        let code = generate_code(self.ctx.config.wire.code_length);
        let expires_at = now + Duration::minutes(self.ctx.config.wire.code_ttl_minutes);
        self.ctx
            .ledger
            .insert_verification_code(&VerificationCode::issue(wire.id, &code, expires_at))?;

        tracing::info!(transfer_id = %wire.id, amount = %wire.amount, "wire transfer awaiting verification");

        self.ctx.notify(Notification::WireVerificationCode {
            recipient: caller,
            transfer_id: wire.id,
            code: code.clone(),
            expires_at,
        });
        self.ctx.record(
            AuditEntry::new(Actor::User(caller), AuditAction::WireInitiated, AuditOutcome::Success, now)
                .subject(wire.id)
                .amount(wire.amount),
        );

        Ok(WireInitiation {
            transfer: wire,
            code,
            expires_at,
        })
    }

    /// Verify the one-time code and move the wire into processing.
    pub fn wire_transfer_complete(
        &self,
        caller: UserId,
        transfer_id: WireTransferId,
        verification_code: &str,
        time: &SafeTimeProvider,
    ) -> Result<WireCompletion> {
        let now = time.now();
        let mut saga = Saga::new(&self.ctx, "wire transfer", now);

        match self.run_complete(caller, transfer_id, verification_code, now, &mut saga) {
            Ok(completion) => Ok(completion),
            Err(e) => Err(saga.abort(e, |outcome| {
                AuditEntry::new(Actor::User(caller), AuditAction::WireCompleted, outcome, now).subject(transfer_id)
            })),
        }
    }

    fn run_complete(
        &self,
        caller: UserId,
        transfer_id: WireTransferId,
        verification_code: &str,
        now: DateTime<Utc>,
        saga: &mut Saga<'_>,
    ) -> Result<WireCompletion> {
        self.gate.validate_verification_code(verification_code)?;

        let wire = match self.ctx.ledger.wire_transfer(transfer_id) {
            Ok(wire) if wire.owner_id == caller => wire,
            Ok(_) | Err(StoreError::NotFound { .. }) => return Err(BankError::not_found("WireTransfer", transfer_id)),
            Err(e) => return Err(e.into()),
        };
        if wire.status != WireStatus::PendingVerification {
            return Err(BankError::conflict(format!("wire transfer is already {:?}", wire.status).to_lowercase()));
        }

        let code = self.ctx.ledger.verification_code(transfer_id)?;
        if code.is_consumed() {
            return Err(BankError::conflict("verification code has already been used"));
        }
        if code.is_expired(now) {
            return Err(BankError::conflict("verification code has expired"));
        }
        if !code.matches(verification_code) {
            return Err(self.wrong_code(&wire, now)?);
        }

        // first writer wins; from here on the code stays spent
        self.ctx.ledger.consume_verification_code(transfer_id, now)?;
        saga.record(Step::FailWire {
            transfer_id,
            reason: "completion failed after verification".to_string(),
        });

        let debit = ledger::debit(
            self.ctx.ledger.as_ref(),
            wire.from_account_id,
            wire.amount,
            Posting::Regular,
            &self.ctx.config.retry,
        )?;
        saga.debited(&debit, wire.amount);

        let reference = reference::generate(reference::WIRE_PREFIX);
        let mut processing = wire.clone();
        processing.status = WireStatus::Processing;
        processing.reference = Some(reference.clone());
        processing.updated_at = now;
        let processing = self.ctx.ledger.update_wire_transfer(&processing, wire.version)?;

        let row = Transaction::posted(
            &debit,
            TransactionType::WireTransfer,
            wire.amount,
            reference.clone(),
            Some(format!("wire to {} at {}", wire.beneficiary_name, wire.beneficiary_bank)),
            now,
        );
        self.ctx.ledger.insert_transaction(&row)?;
        saga.posted(wire.from_account_id, &reference);

        tracing::info!(transfer_id = %transfer_id, reference = %reference, "wire transfer processing");

        self.ctx.notify(Notification::WireProcessing {
            recipient: caller,
            transfer_id,
            amount: wire.amount,
            reference: reference.clone(),
        });
        self.ctx.record(
            AuditEntry::new(Actor::User(caller), AuditAction::WireCompleted, AuditOutcome::Success, now)
                .subject(transfer_id)
                .reference(&reference)
                .amount(wire.amount)
                .balance(debit),
        );

        Ok(WireCompletion {
            transfer_id,
            reference_number: reference,
            status: processing.status,
            new_balance: debit.after,
        })
    }

    /// Network confirmation: `processing -> settled`.
    pub fn settle_wire(&self, transfer_id: WireTransferId, time: &SafeTimeProvider) -> Result<WireTransfer> {
        let now = time.now();
        let result = self.transition_wire(transfer_id, WireStatus::Settled, None, now);
        let outcome = match &result {
            Ok(_) => AuditOutcome::Success,
            Err(e) => AuditOutcome::rejected(e),
        };
        self.ctx
            .record(AuditEntry::new(Actor::System, AuditAction::WireSettled, outcome, now).subject(transfer_id));

        let settled = result?;
        self.ctx.notify(Notification::WireSettled {
            recipient: settled.owner_id,
            transfer_id,
            reference: settled.reference.clone().unwrap_or_default(),
        });
        Ok(settled)
    }

    /// Network rejection: `processing -> failed`, refunding the debit with a
    /// reversal row against the wire's reference.
    pub fn fail_wire(&self, transfer_id: WireTransferId, reason: &str, time: &SafeTimeProvider) -> Result<WireTransfer> {
        let now = time.now();
        let mut saga = Saga::new(&self.ctx, "wire failure", now);

        match self.run_fail(transfer_id, reason, now, &mut saga) {
            Ok(failed) => Ok(failed),
            Err(e) => Err(saga.abort(e, |outcome| {
                AuditEntry::new(Actor::System, AuditAction::WireFailed, outcome, now).subject(transfer_id)
            })),
        }
    }

    fn run_fail(
        &self,
        transfer_id: WireTransferId,
        reason: &str,
        now: DateTime<Utc>,
        saga: &mut Saga<'_>,
    ) -> Result<WireTransfer> {
        let before = self.ctx.ledger.wire_transfer(transfer_id)?;
        let failed = self.transition_wire(transfer_id, WireStatus::Failed, Some(reason), now)?;
        saga.record(Step::RestoreWire {
            previous: before,
            applied_version: failed.version,
        });

        let original = failed
            .reference
            .clone()
            .ok_or_else(|| BankError::system("processing wire has no reference"))?;
        let refund = ledger::credit(
            self.ctx.ledger.as_ref(),
            failed.from_account_id,
            failed.amount,
            Posting::Compensation,
            &self.ctx.config.retry,
        )?;
        saga.credited(&refund, failed.amount);

        let row = Transaction::posted(
            &refund,
            TransactionType::Credit,
            failed.amount,
            reference::reversal_of(&original),
            Some(format!("wire returned: {}", reason)),
            now,
        );
        self.ctx.ledger.insert_transaction(&row)?;

        tracing::warn!(transfer_id = %transfer_id, reason, "wire transfer failed and was refunded");

        self.ctx.notify(Notification::WireFailed {
            recipient: failed.owner_id,
            transfer_id,
            reason: reason.to_string(),
            refunded: failed.amount,
        });
        self.ctx.record(
            AuditEntry::new(Actor::System, AuditAction::WireFailed, AuditOutcome::Success, now)
                .subject(transfer_id)
                .reference(reference::reversal_of(&original))
                .amount(failed.amount)
                .balance(refund),
        );
        Ok(failed)
    }

    /// Count a wrong code. Once the allowance is used up the wire fails and
    /// needs to be initiated again. Nothing was debited yet, so there is no
    /// refund.
    fn wrong_code(&self, wire: &WireTransfer, now: DateTime<Utc>) -> Result<BankError> {
        let code = self.ctx.ledger.record_failed_code_attempt(wire.id)?;
        let allowed = self.ctx.config.wire.max_code_attempts;
        if code.failed_attempts < allowed {
            return Ok(BankError::validation(format!(
                "verification code is incorrect, {} attempt(s) left",
                allowed - code.failed_attempts
            )));
        }

        let reason = "too many incorrect verification codes";
        let mut failed = wire.clone();
        failed.status = WireStatus::Failed;
        failed.failure_reason = Some(reason.to_string());
        failed.updated_at = now;
        self.ctx.ledger.update_wire_transfer(&failed, wire.version)?;

        tracing::warn!(transfer_id = %wire.id, attempts = code.failed_attempts, "wire transfer locked out");
        self.ctx.notify(Notification::WireFailed {
            recipient: wire.owner_id,
            transfer_id: wire.id,
            reason: reason.to_string(),
            refunded: Money::ZERO,
        });
        Ok(BankError::conflict("too many incorrect verification codes, wire transfer failed"))
    }

    /// Conditional status change from `processing`; losing a race is a conflict.
    fn transition_wire(
        &self,
        transfer_id: WireTransferId,
        next: WireStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WireTransfer> {
        let wire = self.ctx.ledger.wire_transfer(transfer_id)?;
        if wire.status != WireStatus::Processing || !wire.status.can_transition_to(next) {
            return Err(BankError::conflict(format!(
                "wire transfer cannot move from {:?} to {:?}",
                wire.status, next
            )));
        }
        let mut updated = wire.clone();
        updated.status = next;
        updated.failure_reason = reason.map(str::to_string);
        updated.updated_at = now;
        Ok(self.ctx.ledger.update_wire_transfer(&updated, wire.version)?)
    }
}
