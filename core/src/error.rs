use crate::types::{format_amount, Amount};
use thiserror::Error;

/// Failure taxonomy exposed to callers. Every `ShopError` maps onto one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed amount, duration or credential. Nothing was mutated.
    Validation,
    /// Balance does not cover the request. Recoverable.
    InsufficientFunds,
    /// Banned customer, non-admin on an admin action, or a policy refusal.
    Forbidden,
    /// A gateway call failed or timed out. Retried by the next tick where applicable.
    GatewayTransient,
    /// The provisioning backend explicitly refused the request.
    GatewayRejected,
    /// Ledger persistence failed. The enclosing operation was rolled back.
    IoFailure,
}

#[derive(Error, Debug)]
pub enum ShopError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: Amount, required: Amount },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Trial already used")]
    TrialUnavailable,

    #[error("Payment session {order_id} is still outstanding")]
    SessionOutstanding { order_id: String },

    #[error("Gateway unavailable: {0}")]
    GatewayTransient(String),

    #[error("Gateway rejected request: {0}")]
    GatewayRejected(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Ledger lock poisoned")]
    LockPoisoned,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ShopResult<T> = Result<T, ShopError>;

impl ShopError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::Forbidden(_) | Self::TrialUnavailable | Self::SessionOutstanding { .. } => {
                ErrorKind::Forbidden
            }
            Self::GatewayTransient(_) => ErrorKind::GatewayTransient,
            Self::GatewayRejected(_) => ErrorKind::GatewayRejected,
            Self::Database(_) | Self::LockPoisoned | Self::Serialization(_) | Self::Other(_) => {
                ErrorKind::IoFailure
            }
        }
    }

    /// Text shown to the customer for this failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("❌ {msg}"),
            Self::InsufficientFunds { balance, required } => format!(
                "⚠️ Insufficient balance: you have {}, {} is required.",
                format_amount(*balance),
                format_amount(*required)
            ),
            Self::Forbidden(msg) => format!("⛔ {msg}"),
            Self::TrialUnavailable => {
                "⚠️ You have already used your trial. Top up to get another one.".into()
            }
            Self::SessionOutstanding { order_id } => format!(
                "⚠️ Payment {order_id} is still waiting for confirmation. Cancel it or wait before starting another."
            ),
            Self::GatewayTransient(_) => {
                "❌ The service is temporarily unavailable. Please try again shortly.".into()
            }
            Self::GatewayRejected(msg) => format!("❌ Request refused: {msg}"),
            Self::Database(_) | Self::LockPoisoned | Self::Serialization(_) | Self::Other(_) => {
                "❌ Internal error, nothing was changed. Please try again.".into()
            }
        }
    }
}
