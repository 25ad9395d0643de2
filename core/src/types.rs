//! Shared primitive types used across the shop.

use crate::error::{ShopError, ShopResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A customer identity as assigned by the chat platform.
pub type CustomerId = i64;

/// Money in the smallest currency unit. Never negative.
pub type Amount = u64;

/// Account validity in whole days.
pub type Days = u32;

/// Chat handle that replies for a customer are delivered to.
pub type Destination = i64;

pub const CREDENTIAL_MIN_LEN: usize = 3;
pub const CREDENTIAL_MAX_LEN: usize = 20;

/// The password-like identifier naming one VPN account.
///
/// Always 3–20 characters drawn from `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Credential(String);

impl Credential {
    pub fn parse(raw: &str) -> ShopResult<Self> {
        let raw = raw.trim();
        let len = raw.chars().count();
        if !(CREDENTIAL_MIN_LEN..=CREDENTIAL_MAX_LEN).contains(&len) {
            return Err(ShopError::Validation(format!(
                "password must be {CREDENTIAL_MIN_LEN}-{CREDENTIAL_MAX_LEN} characters"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ShopError::Validation(
                "password may only contain letters, digits, '-' and '_'".into(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Rebuild a credential that was validated before it was persisted.
    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Credential {
    type Error = ShopError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Credential> for String {
    fn from(value: Credential) -> Self {
        value.0
    }
}

/// Render an amount the way customers see it.
pub fn format_amount(amount: Amount) -> String {
    format!("Rp {amount}")
}
