//! Turning a committed debit into a provisioned account.
//!
//! RULE: the debit is always written before the provisioning call. If the
//! call fails the money stays debited and an open settlement exception is
//! recorded for an operator; nothing here retries.

use crate::{
    clock::Clock,
    error::ShopResult,
    gateway::{AccountInfo, Provisioner},
    store::{LedgerStore, SettlementExceptionRow},
    types::{Amount, Credential, CustomerId, Days},
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionKind {
    Create,
    Renew,
}

/// One paid provisioning request whose debit is already committed.
#[derive(Debug, Clone)]
pub struct PaidProvision<'a> {
    pub customer: CustomerId,
    pub credential: &'a Credential,
    pub days: Days,
    pub amount: Amount,
    pub order_id: Option<&'a str>,
    pub kind: ProvisionKind,
}

pub struct Fulfiller {
    provisioner: Arc<dyn Provisioner>,
    clock: Arc<dyn Clock>,
}

impl Fulfiller {
    pub fn new(provisioner: Arc<dyn Provisioner>, clock: Arc<dyn Clock>) -> Self {
        Self { provisioner, clock }
    }

    pub fn provisioner(&self) -> &dyn Provisioner {
        self.provisioner.as_ref()
    }

    /// Call the backend for an already-paid request.
    ///
    /// A successful create bumps the customer's created counter and appends
    /// a metrics event. Bookkeeping failures after a successful call are
    /// logged, not returned, since the customer already has the account.
    pub fn provision_after_debit(
        &self,
        store: &LedgerStore,
        req: &PaidProvision<'_>,
    ) -> ShopResult<AccountInfo> {
        let result = match req.kind {
            ProvisionKind::Create => self.provisioner.create(req.credential, req.days),
            ProvisionKind::Renew => self.provisioner.renew(req.credential, req.days),
        };

        match result {
            Ok(account) => {
                log::info!(
                    "provisioned {:?} {} for customer {} ({} days, until {})",
                    req.kind,
                    req.credential,
                    req.customer,
                    req.days,
                    account.expires_on
                );
                if req.kind == ProvisionKind::Create {
                    let now = self.clock.now();
                    if let Err(e) = store.increment_created_count(req.customer, now) {
                        log::error!("created count for {} not updated: {e}", req.customer);
                    }
                    if let Err(e) = store.append_metric(req.customer, now) {
                        log::error!("metrics event for {} not recorded: {e}", req.customer);
                    }
                }
                Ok(account)
            }
            Err(e) => {
                self.record_exception(store, req, &format!("provisioning failed after debit: {e}"));
                Err(e)
            }
        }
    }

    /// Queue a paid request for manual follow-up.
    pub fn record_exception(&self, store: &LedgerStore, req: &PaidProvision<'_>, reason: &str) {
        let row = SettlementExceptionRow {
            exception_id: uuid::Uuid::new_v4().to_string(),
            customer_id: req.customer,
            order_id: req.order_id.map(str::to_string),
            credential: req.credential.as_str().to_string(),
            days: req.days,
            amount: req.amount,
            reason: reason.to_string(),
            detected_at: self.clock.now(),
            status: "open".into(),
            resolution_note: None,
            resolved_at: None,
        };
        match store.insert_settlement_exception(&row) {
            Ok(()) => log::error!(
                "MANUAL INTERVENTION {}: customer {} paid {} for {} ({} days): {reason}",
                row.exception_id,
                req.customer,
                req.amount,
                req.credential,
                req.days
            ),
            Err(e) => log::error!(
                "MANUAL INTERVENTION (not persisted: {e}): customer {} paid {} for {} ({} days): {reason}",
                req.customer,
                req.amount,
                req.credential,
                req.days
            ),
        }
    }
}
