//! Contracts for the two external gateways the shop depends on.
//!
//! RULE: an `Err(GatewayTransient)` means "try again later"; an
//! `Err(GatewayRejected)` means the backend answered and said no.

use crate::{
    error::{ShopError, ShopResult},
    types::{Amount, Credential, Days},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod sandbox;

// ── Payments ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
}

impl PaymentStatus {
    /// Map a raw gateway status string. Only "completed" and "success" settle.
    pub fn from_gateway(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" | "success" => Self::Confirmed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub payment_reference: String,
    pub expires_at: DateTime<Utc>,
}

pub trait PaymentGateway: Send + Sync {
    fn create_transaction(&self, order_id: &str, amount: Amount) -> ShopResult<PaymentTransaction>;

    /// Errors are transient: the session stays open for the next tick.
    fn get_status(&self, order_id: &str, amount: Amount) -> ShopResult<PaymentStatus>;
}

// ── Provisioning ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub credential: Credential,
    pub expires_on: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountListing {
    pub credential: Credential,
    pub expires_on: NaiveDate,
    pub status: AccountStatus,
}

pub trait Provisioner: Send + Sync {
    fn create(&self, credential: &Credential, days: Days) -> ShopResult<AccountInfo>;
    fn renew(&self, credential: &Credential, days: Days) -> ShopResult<AccountInfo>;
    fn delete(&self, credential: &Credential) -> ShopResult<()>;
    fn list(&self) -> ShopResult<Vec<AccountListing>>;
}

/// Envelope returned by the provisioning HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<ProvisionedData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedData {
    pub password: String,
    /// `YYYY-MM-DD`
    pub expired: String,
}

impl ProvisionResponse {
    /// Turn the envelope into an account, or a rejection carrying the
    /// backend's own message.
    pub fn into_account(self) -> ShopResult<AccountInfo> {
        if !self.success {
            return Err(ShopError::GatewayRejected(self.message));
        }
        let data = self
            .data
            .ok_or_else(|| ShopError::GatewayTransient("response carried no account data".into()))?;
        let expires_on = NaiveDate::parse_from_str(&data.expired, "%Y-%m-%d").map_err(|e| {
            ShopError::GatewayTransient(format!("bad expiry date {:?}: {e}", data.expired))
        })?;
        Ok(AccountInfo {
            credential: Credential::parse(&data.password)?,
            expires_on,
        })
    }
}
