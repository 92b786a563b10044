use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decimal::Money;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BankError {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
    },

    #[error("authentication failed: {message}")]
    Auth {
        message: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    #[error("insufficient funds: required {required}, available {available}, shortfall {shortfall}")]
    InsufficientFunds {
        required: Money,
        available: Money,
        shortfall: Money,
    },

    #[error("conflict: {message}")]
    Conflict {
        message: String,
    },

    #[error("system error: {message}")]
    System {
        message: String,
    },
}

/// stable machine-readable classification of a [`BankError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    AuthError,
    NotFound,
    InsufficientFunds,
    Conflict,
    SystemError,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::Conflict => "conflict",
            ErrorKind::SystemError => "system_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::ValidationError => 400,
            ErrorKind::AuthError => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::InsufficientFunds => 400,
            ErrorKind::Conflict => 400,
            ErrorKind::SystemError => 500,
        }
    }
}

impl BankError {
    pub fn validation(message: impl Into<String>) -> Self {
        BankError::Validation { message: message.into() }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        BankError::Auth { message: message.into() }
    }

    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        BankError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        BankError::Conflict { message: message.into() }
    }

    pub fn system(message: impl Into<String>) -> Self {
        BankError::System { message: message.into() }
    }

    /// insufficient funds with the shortfall derived from the two amounts
    pub fn insufficient_funds(required: Money, available: Money) -> Self {
        BankError::InsufficientFunds {
            required,
            available,
            shortfall: (required - available).max(Money::ZERO),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BankError::Validation { .. } => ErrorKind::ValidationError,
            BankError::Auth { .. } => ErrorKind::AuthError,
            BankError::NotFound { .. } => ErrorKind::NotFound,
            BankError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            BankError::Conflict { .. } => ErrorKind::Conflict,
            BankError::System { .. } => ErrorKind::SystemError,
        }
    }
}

/// Storage failures never reach callers verbatim; only the entity and key
/// survive the conversion.
impl From<StoreError> for BankError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => BankError::NotFound { entity, id },
            StoreError::VersionConflict { entity, id } => {
                BankError::conflict(format!("{} {} was modified concurrently", entity, id))
            }
            StoreError::Duplicate { entity, key } => {
                BankError::conflict(format!("{} with key {} already exists", entity, key))
            }
            StoreError::AlreadyConsumed { transfer_id } => {
                BankError::conflict(format!("verification code for {} was already used", transfer_id))
            }
            StoreError::Unavailable(_) => BankError::system("persistence layer unavailable"),
        }
    }
}

pub type Result<T> = std::result::Result<T, BankError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortfall_is_derived() {
        let err = BankError::insufficient_funds(Money::from_major(1000), Money::from_major(500));
        match err {
            BankError::InsufficientFunds { shortfall, .. } => assert_eq!(shortfall, Money::from_major(500)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(BankError::validation("x").kind().http_status(), 400);
        assert_eq!(BankError::auth("x").kind().http_status(), 401);
        assert_eq!(BankError::not_found("Account", "1").kind().http_status(), 404);
        assert_eq!(BankError::conflict("x").kind().http_status(), 400);
        assert_eq!(BankError::system("x").kind().http_status(), 500);
        assert_eq!(BankError::system("x").kind().code(), "system_error");
    }

    #[test]
    fn test_store_errors_are_sanitized() {
        let err: BankError = StoreError::Unavailable("connection reset by 10.0.0.7:5432".into()).into();
        assert_eq!(err, BankError::system("persistence layer unavailable"));
        assert!(!err.to_string().contains("10.0.0.7"));
    }
}
