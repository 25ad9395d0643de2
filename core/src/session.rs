//! Payment Session Registry: outstanding payment intents awaiting gateway
//! confirmation.
//!
//! RULE: at most one *active* session per customer. A cancelled session is
//! detached rather than removed. It no longer blocks new sessions but stays
//! in the registry so a late confirmation is still credited.
//!
//! The registry is plain in-memory state. The settlement engine owns it and
//! guards it with its own mutex.

use crate::{
    error::{ShopError, ShopResult},
    types::{Amount, Credential, CustomerId, Days, Destination},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a confirmed payment is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentIntent {
    /// Credit the wallet, then complete any parked purchase.
    Topup,
    /// Credit the wallet, then immediately buy this account.
    DirectPurchase { credential: Credential, days: Days },
}

impl PaymentIntent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Topup => "topup",
            Self::DirectPurchase { .. } => "direct_purchase",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub customer_id: CustomerId,
    pub order_id: String,
    pub amount: Amount,
    pub destination: Destination,
    pub intent: PaymentIntent,
    /// Reference the customer pays against (the QR payload).
    pub payment_reference: String,
    pub created_at: DateTime<Utc>,
    /// When the gateway stops accepting payment for this order.
    pub expires_at: DateTime<Utc>,
    /// Set once the customer cancelled. Still polled.
    pub detached: bool,
}

impl PaymentSession {
    /// Gateway expiry passed more than `grace` ago. Only a session the
    /// gateway still reports as unpaid may be dropped on this basis.
    pub fn is_stale(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.expires_at + grace < now
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_order: BTreeMap<String, PaymentSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Rejected while the customer already has an
    /// active one, or if the order id was used before.
    pub fn open(&mut self, session: PaymentSession) -> ShopResult<()> {
        if let Some(active) = self.get_by_customer(session.customer_id) {
            return Err(ShopError::SessionOutstanding {
                order_id: active.order_id.clone(),
            });
        }
        if self.by_order.contains_key(&session.order_id) {
            return Err(ShopError::Validation(format!(
                "order {} already exists",
                session.order_id
            )));
        }
        self.by_order.insert(session.order_id.clone(), session);
        Ok(())
    }

    /// The customer's active (not detached) session, if any.
    pub fn get_by_customer(&self, customer: CustomerId) -> Option<&PaymentSession> {
        self.by_order
            .values()
            .find(|s| s.customer_id == customer && !s.detached)
    }

    pub fn get(&self, order_id: &str) -> Option<&PaymentSession> {
        self.by_order.get(order_id)
    }

    /// Remove the customer's active session outright.
    pub fn close(&mut self, customer: CustomerId) -> Option<PaymentSession> {
        let order_id = self.get_by_customer(customer)?.order_id.clone();
        self.by_order.remove(&order_id)
    }

    pub fn close_order(&mut self, order_id: &str) -> Option<PaymentSession> {
        self.by_order.remove(order_id)
    }

    /// Detach the customer's active session. Returns its order id.
    pub fn detach(&mut self, customer: CustomerId) -> Option<String> {
        let session = self
            .by_order
            .values_mut()
            .find(|s| s.customer_id == customer && !s.detached)?;
        session.detached = true;
        Some(session.order_id.clone())
    }

    /// Snapshot of every session still awaiting confirmation, in order-id order.
    pub fn outstanding(&self) -> Vec<PaymentSession> {
        self.by_order.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_order.is_empty()
    }
}
