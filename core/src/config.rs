use crate::{
    error::{ShopError, ShopResult},
    types::{Amount, CustomerId, Days},
};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for the bot and its ledger.
///
/// Loaded from a JSON file; every field has a default so partial files work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShopConfig {
    /// Chat identity allowed to run admin actions and bypass the trial limit.
    pub admin_id: CustomerId,
    /// Currency cost of one day of account validity.
    pub daily_price: Amount,
    pub min_topup: Amount,
    pub trial_days: Days,
    pub max_purchase_days: Days,
    pub max_renew_days: Days,
    /// Seconds between settlement ticks.
    pub poll_interval_secs: u64,
    /// Upper bound on a single payment-status query.
    pub gateway_timeout_secs: u64,
    /// How long past its gateway expiry a session is still polled.
    pub late_confirmation_grace_hours: i64,
    /// Offset used for calendar bucketing and expiry dates.
    pub utc_offset_hours: i32,
    pub db_path: String,
    pub domain: String,
}

impl Default for ShopConfig {
    fn default() -> Self {
        Self {
            admin_id: 0,
            daily_price: 1_000,
            min_topup: 5_000,
            trial_days: 1,
            max_purchase_days: 365,
            max_renew_days: 3_650,
            poll_interval_secs: 60,
            gateway_timeout_secs: 15,
            late_confirmation_grace_hours: 24,
            utc_offset_hours: 7,
            db_path: "/etc/zivpn/wallets.db".into(),
            domain: String::new(),
        }
    }
}

impl ShopConfig {
    /// Load from a JSON file.
    /// In tests, use ShopConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: ShopConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Config with hardcoded values for use in tests.
    pub fn default_test() -> Self {
        Self {
            admin_id: 1,
            daily_price: 1_000,
            min_topup: 5_000,
            utc_offset_hours: 0,
            db_path: ":memory:".into(),
            domain: "vpn.test".into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.daily_price == 0 {
            anyhow::bail!("daily_price must be positive");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be positive");
        }
        if self.gateway_timeout_secs == 0 {
            anyhow::bail!("gateway_timeout_secs must be positive");
        }
        if self.trial_days == 0 || self.max_purchase_days == 0 || self.max_renew_days == 0 {
            anyhow::bail!("day limits must be positive");
        }
        if !(-23..=23).contains(&self.utc_offset_hours) {
            anyhow::bail!("utc_offset_hours must be within ±23");
        }
        Ok(())
    }

    pub fn is_admin(&self, customer: CustomerId) -> bool {
        customer == self.admin_id
    }

    /// Price of `days` days of validity.
    pub fn price_for(&self, days: Days) -> ShopResult<Amount> {
        Amount::from(days)
            .checked_mul(self.daily_price)
            .ok_or_else(|| ShopError::Validation(format!("{days} days is too long")))
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3_600).unwrap_or_else(|| Utc.fix())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn late_confirmation_grace(&self) -> chrono::Duration {
        chrono::Duration::hours(self.late_confirmation_grace_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: ShopConfig =
            serde_json::from_str(r#"{"admin_id": 42, "daily_price": 2000}"#).unwrap();
        assert_eq!(cfg.admin_id, 42);
        assert_eq!(cfg.daily_price, 2000);
        assert_eq!(cfg.min_topup, 5_000);
        assert_eq!(cfg.poll_interval_secs, 60);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn price_overflow_is_a_validation_error() {
        let cfg = ShopConfig {
            daily_price: u64::MAX,
            ..ShopConfig::default_test()
        };
        assert!(matches!(cfg.price_for(2), Err(ShopError::Validation(_))));
        assert_eq!(ShopConfig::default_test().price_for(3).unwrap(), 3_000);
    }

    #[test]
    fn zero_price_is_rejected() {
        let cfg = ShopConfig {
            daily_price: 0,
            ..ShopConfig::default_test()
        };
        assert!(cfg.validate().is_err());
    }
}
