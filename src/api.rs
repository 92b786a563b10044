//! Request dispatcher over the engine operations.
//!
//! Transport is out of scope: callers hand in a method, a path, an optional
//! bearer token and a JSON body, and get back a status code and a JSON body.
//! Errors are rendered as [`ErrorBody`] with the status from
//! [`ErrorKind::http_status`].

use std::collections::HashMap;
use std::sync::Arc;

use hourglass_rs::SafeTimeProvider;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::errors::{BankError, ErrorKind, Result};
use crate::loans::{
    AutoPayment, AutoPaymentSettings, EarlyPayoffCalculator, LateFeeAssessor, LoanServicer, PaymentRequest,
};
use crate::transfers::{ExternalTransferRequest, InternalTransferRequest, TransferProcessor, WireRequest};
use crate::types::{AccountId, UserId};

/// who a bearer token belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    User(UserId),
    /// scheduler and back-office jobs
    System,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Principal>;
}

/// fixed token table, for tests and demos
#[derive(Debug, Default, Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, token: impl Into<String>, user: UserId) -> Self {
        self.tokens.insert(token.into(), Principal::User(user));
        self
    }

    pub fn with_system(mut self, token: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), Principal::System);
        self
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub bearer_token: Option<String>,
    pub body: Value,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            bearer_token: None,
            body: Value::Null,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            bearer_token: None,
            body,
        }
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// error payload returned for every failed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&BankError> for ErrorBody {
    fn from(e: &BankError) -> Self {
        let details = match e {
            BankError::InsufficientFunds {
                required,
                available,
                shortfall,
            } => Some(json!({
                "required": required,
                "available": available,
                "shortfall": shortfall,
            })),
            _ => None,
        };
        Self {
            kind: e.kind(),
            message: e.to_string(),
            details,
        }
    }
}

impl From<BankError> for ApiResponse {
    fn from(e: BankError) -> Self {
        let body = ErrorBody::from(&e);
        Self {
            status: e.kind().http_status(),
            body: serde_json::to_value(body).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCompleteBody {
    transfer_id: Uuid,
    verification_code: String,
}

#[derive(Debug, Deserialize)]
struct WireFailBody {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct PayoffBody {
    #[serde(default)]
    execute: bool,
    account_id: Option<AccountId>,
}

#[derive(Debug, Deserialize)]
struct AutoPaymentBody {
    enabled: bool,
    account_id: Option<AccountId>,
    payment_day: Option<u32>,
}

/// Routes requests to the engine services.
pub struct BankingApi {
    auth: Arc<dyn Authenticator>,
    transfers: TransferProcessor,
    servicer: LoanServicer,
    payoff: EarlyPayoffCalculator,
    late_fees: LateFeeAssessor,
    autopay: AutoPayment,
}

impl std::fmt::Debug for BankingApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BankingApi").finish_non_exhaustive()
    }
}

impl BankingApi {
    pub fn new(ctx: EngineContext, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            auth,
            transfers: TransferProcessor::new(ctx.clone()),
            servicer: LoanServicer::new(ctx.clone()),
            payoff: EarlyPayoffCalculator::new(ctx.clone()),
            late_fees: LateFeeAssessor::new(ctx.clone()),
            autopay: AutoPayment::new(ctx),
        }
    }

    pub fn handle(&self, request: ApiRequest, time: &SafeTimeProvider) -> ApiResponse {
        match self.dispatch(&request, time) {
            Ok(body) => ApiResponse::ok(body),
            Err(e) => {
                tracing::debug!(path = %request.path, kind = e.kind().code(), error = %e, "request failed");
                e.into()
            }
        }
    }

    fn dispatch(&self, request: &ApiRequest, time: &SafeTimeProvider) -> Result<Value> {
        let principal = request
            .bearer_token
            .as_deref()
            .and_then(|token| self.auth.authenticate(token))
            .ok_or_else(|| BankError::auth("missing or invalid bearer token"))?;

        let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();
        match (request.method, segments.as_slice()) {
            (Method::Post, ["transfers", "internal"]) => {
                let body: InternalTransferRequest = parse(&request.body)?;
                to_json(self.transfers.internal_transfer(user(principal)?, &body, time)?)
            }
            (Method::Post, ["transfers", "external"]) => {
                let body: ExternalTransferRequest = parse(&request.body)?;
                to_json(self.transfers.external_transfer(user(principal)?, &body, time)?)
            }
            (Method::Post, ["transfers", "wire"]) => {
                let body: WireRequest = parse(&request.body)?;
                // the code only travels through the notifier
                let initiation = self.transfers.initiate_wire(user(principal)?, &body, time)?;
                Ok(json!({
                    "transfer_id": initiation.transfer.id,
                    "status": initiation.transfer.status,
                    "expires_at": initiation.expires_at,
                }))
            }
            (Method::Post, ["transfers", "wire", "complete"]) => {
                let body: WireCompleteBody = parse(&request.body)?;
                to_json(self.transfers.wire_transfer_complete(
                    user(principal)?,
                    body.transfer_id,
                    &body.verification_code,
                    time,
                )?)
            }
            (Method::Post, ["transfers", "wire", id, "settle"]) => {
                system(principal)?;
                to_json(self.transfers.settle_wire(path_id(id)?, time)?)
            }
            (Method::Post, ["transfers", "wire", id, "fail"]) => {
                system(principal)?;
                let body: WireFailBody = parse(&request.body)?;
                to_json(self.transfers.fail_wire(path_id(id)?, &body.reason, time)?)
            }
            (Method::Post, ["loans", "late-fee-assessment"]) => {
                system(principal)?;
                to_json(self.late_fees.assess(time)?)
            }
            (Method::Post, ["loans", "auto-payment-run"]) => {
                system(principal)?;
                to_json(self.autopay.run_due(time)?)
            }
            (Method::Get, ["loans", id]) => to_json(self.servicer.loan(user(principal)?, path_id(id)?)?),
            (Method::Get, ["loans", id, "payments"]) => {
                to_json(self.servicer.payments(user(principal)?, path_id(id)?)?)
            }
            (Method::Get, ["loans", id, "amortization"]) => {
                let schedule = self.servicer.schedule(user(principal)?, path_id(id)?)?;
                Ok(json!({
                    "loan_id": schedule.loan_id,
                    "monthly_payment": schedule.monthly_payment,
                    "total_interest": schedule.total_interest,
                    "total_amount": schedule.total_amount,
                    "schedule": schedule.rows,
                }))
            }
            (Method::Get, ["loans", id, "early-payoff"]) => {
                to_json(self.payoff.quote(user(principal)?, path_id(id)?)?)
            }
            (Method::Post, ["loans", id, "early-payoff"]) => {
                let caller = user(principal)?;
                let loan_id = path_id(id)?;
                let body: PayoffBody = parse(&request.body)?;
                if !body.execute {
                    return to_json(self.payoff.quote(caller, loan_id)?);
                }
                let account_id = match body.account_id {
                    Some(account_id) => account_id,
                    None => self.servicer.loan(caller, loan_id)?.account_id,
                };
                to_json(self.payoff.execute(caller, loan_id, account_id, time)?)
            }
            (Method::Post, ["loans", id, "auto-payment"]) => {
                let caller = user(principal)?;
                let loan_id = path_id(id)?;
                let body: AutoPaymentBody = parse(&request.body)?;
                let loan = if body.enabled {
                    let settings = AutoPaymentSettings {
                        account_id: body
                            .account_id
                            .ok_or_else(|| BankError::validation("account_id is required to enable auto-payment"))?,
                        payment_day: body
                            .payment_day
                            .ok_or_else(|| BankError::validation("payment_day is required to enable auto-payment"))?,
                    };
                    self.autopay.enable(caller, loan_id, settings, time)?
                } else {
                    self.autopay.disable(caller, loan_id, time)?
                };
                Ok(json!({
                    "loan_id": loan.id,
                    "auto_payment_enabled": loan.auto_payment_enabled,
                    "account_id": loan.auto_payment_account_id,
                    "payment_day": loan.auto_payment_day,
                }))
            }
            (Method::Post, ["loans", id, "payments"]) => {
                let body: PaymentRequest = parse(&request.body)?;
                to_json(self.servicer.pay_installment(user(principal)?, path_id(id)?, &body, time)?)
            }
            _ => Err(BankError::not_found("Route", &request.path)),
        }
    }
}

fn user(principal: Principal) -> Result<UserId> {
    match principal {
        Principal::User(id) => Ok(id),
        Principal::System => Err(BankError::auth("customer credentials required")),
    }
}

fn system(principal: Principal) -> Result<()> {
    match principal {
        Principal::System => Ok(()),
        Principal::User(_) => Err(BankError::auth("system credentials required")),
    }
}

fn path_id(segment: &str) -> Result<Uuid> {
    Uuid::parse_str(segment).map_err(|_| BankError::validation(format!("invalid id in path: {}", segment)))
}

fn parse<T: DeserializeOwned>(body: &Value) -> Result<T> {
    serde_json::from_value(body.clone()).map_err(|e| BankError::validation(format!("invalid request body: {}", e)))
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BankError::system(format!("response serialization failed: {}", e)))
}
