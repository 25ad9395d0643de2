//! Request handling: the operations the chat layer and the scheduler call.
//!
//! RULE: every balance-affecting request checks the ban flag first and
//! holds the ledger lock for its whole read-decide-write sequence.
//! RULE: validation and access errors are returned before anything is written.

use crate::{
    chat::ChatTransport,
    clock::Clock,
    config::ShopConfig,
    error::{ShopError, ShopResult},
    fulfil::{Fulfiller, PaidProvision, ProvisionKind},
    gateway::{AccountInfo, AccountListing, PaymentGateway, Provisioner},
    metrics::{compute_metrics, window_start, ActivityCounts},
    session::{PaymentIntent, PaymentSession},
    settlement::{SettlementEngine, TickReport},
    store::{EntryReason, Ledger, LedgerStore, PendingPurchase, SettlementExceptionRow, WalletRecord},
    types::{format_amount, Amount, Credential, CustomerId, Days, Destination},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// External adapters the shop is wired to.
pub struct Collaborators {
    pub payments: Arc<dyn PaymentGateway>,
    pub provisioner: Arc<dyn Provisioner>,
    pub transport: Arc<dyn ChatTransport>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    /// Paid from the wallet and provisioned.
    Completed { account: AccountInfo, balance_after: Amount },
    /// Not enough funds; stored as the customer's pending purchase.
    Parked { balance: Amount, required: Amount },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewOutcome {
    pub account: AccountInfo,
    pub balance_after: Amount,
}

/// Read-only view of one customer's wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub customer_id: CustomerId,
    pub balance: Amount,
    pub trial_used: bool,
    pub banned: bool,
    pub created_count: u32,
    pub pending: Option<PendingPurchase>,
    pub open_session: Option<PaymentSession>,
}

pub struct Shop {
    config: Arc<ShopConfig>,
    ledger: Ledger,
    fulfiller: Arc<Fulfiller>,
    settlement: SettlementEngine,
    clock: Arc<dyn Clock>,
}

impl Shop {
    /// Wire a shop around an already opened store. Migrations are applied here.
    pub fn new(config: ShopConfig, store: LedgerStore, c: Collaborators) -> ShopResult<Self> {
        config.validate()?;
        store.migrate()?;
        let config = Arc::new(config);
        let ledger = Ledger::new(store);
        let fulfiller = Arc::new(Fulfiller::new(c.provisioner, Arc::clone(&c.clock)));
        let settlement = SettlementEngine::new(
            Arc::clone(&config),
            ledger.clone(),
            c.payments,
            Arc::clone(&fulfiller),
            c.transport,
            Arc::clone(&c.clock),
        );
        Ok(Self {
            config,
            ledger,
            fulfiller,
            settlement,
            clock: c.clock,
        })
    }

    /// Open the store at `config.db_path` and wire the shop around it.
    pub fn open(config: ShopConfig, c: Collaborators) -> ShopResult<Self> {
        let store = LedgerStore::open(&config.db_path)?;
        Self::new(config, store, c)
    }

    pub fn config(&self) -> &ShopConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn settlement(&self) -> &SettlementEngine {
        &self.settlement
    }

    // ── Customer operations ───────────────────────────────────────

    /// Issue a payment QR for a wallet top-up.
    pub fn handle_topup_request(
        &self,
        customer: CustomerId,
        destination: Destination,
        amount: Amount,
    ) -> ShopResult<PaymentSession> {
        {
            let store = self.ledger.lock()?;
            ensure_not_banned(&store, customer)?;
        }
        if amount < self.config.min_topup {
            return Err(ShopError::Validation(format!(
                "minimum top-up is {}",
                format_amount(self.config.min_topup)
            )));
        }
        self.settlement
            .open_session(customer, destination, amount, PaymentIntent::Topup)
    }

    /// Buy an account from the wallet, or park the request if funds are short.
    pub fn handle_purchase_request(
        &self,
        customer: CustomerId,
        credential: &str,
        days: Days,
    ) -> ShopResult<PurchaseOutcome> {
        let store = self.ledger.lock()?;
        ensure_not_banned(&store, customer)?;
        let credential = Credential::parse(credential)?;
        validate_days(days, self.config.max_purchase_days)?;
        let required = self.config.price_for(days)?;

        let balance = store.balance(customer)?;
        if balance < required {
            store.set_pending_purchase(customer, &credential, days, self.clock.now())?;
            log::info!(
                "customer {customer} parked {credential} ({days} days): balance {balance}, required {required}"
            );
            return Ok(PurchaseOutcome::Parked { balance, required });
        }

        let balance_after =
            store.debit(customer, required, EntryReason::Purchase, None, self.clock.now())?;
        let account = self.fulfiller.provision_after_debit(
            &store,
            &PaidProvision {
                customer,
                credential: &credential,
                days,
                amount: required,
                order_id: None,
                kind: ProvisionKind::Create,
            },
        )?;
        Ok(PurchaseOutcome::Completed {
            account,
            balance_after,
        })
    }

    /// Issue a payment QR for exactly the price of one account.
    /// The account is provisioned when the payment settles.
    pub fn handle_purchase_payment_request(
        &self,
        customer: CustomerId,
        destination: Destination,
        credential: &str,
        days: Days,
    ) -> ShopResult<PaymentSession> {
        {
            let store = self.ledger.lock()?;
            ensure_not_banned(&store, customer)?;
        }
        let credential = Credential::parse(credential)?;
        validate_days(days, self.config.max_purchase_days)?;
        let required = self.config.price_for(days)?;
        self.settlement.open_session(
            customer,
            destination,
            required,
            PaymentIntent::DirectPurchase { credential, days },
        )
    }

    /// One free short account. Limited to once per customer only while the
    /// wallet is empty; the admin is never limited.
    pub fn handle_trial_request(&self, customer: CustomerId, credential: &str) -> ShopResult<AccountInfo> {
        let store = self.ledger.lock()?;
        ensure_not_banned(&store, customer)?;
        let credential = Credential::parse(credential)?;

        let limited = !self.config.is_admin(customer) && store.balance(customer)? == 0;
        if limited && store.has_used_trial(customer)? {
            return Err(ShopError::TrialUnavailable);
        }

        let account = self
            .fulfiller
            .provisioner()
            .create(&credential, self.config.trial_days)?;
        // The account exists from here on; a bookkeeping failure must not hide it.
        if limited {
            if let Err(e) = store.mark_trial_used(customer, self.clock.now()) {
                log::error!("trial {credential} issued to customer {customer} but not recorded as used: {e}");
            }
        }
        log::info!("trial {credential} issued to customer {customer}");
        Ok(account)
    }

    /// Extend an existing account, paid from the wallet.
    ///
    /// Short funds are an error here; renewals are never parked.
    pub fn handle_renew_request(
        &self,
        customer: CustomerId,
        credential: &str,
        days: Days,
    ) -> ShopResult<RenewOutcome> {
        let store = self.ledger.lock()?;
        ensure_not_banned(&store, customer)?;
        let credential = Credential::parse(credential)?;
        validate_days(days, self.config.max_renew_days)?;
        let required = self.config.price_for(days)?;

        let balance = store.balance(customer)?;
        if balance < required {
            return Err(ShopError::InsufficientFunds { balance, required });
        }

        let balance_after = store.debit(customer, required, EntryReason::Renew, None, self.clock.now())?;
        let account = self.fulfiller.provision_after_debit(
            &store,
            &PaidProvision {
                customer,
                credential: &credential,
                days,
                amount: required,
                order_id: None,
                kind: ProvisionKind::Renew,
            },
        )?;
        Ok(RenewOutcome {
            account,
            balance_after,
        })
    }

    /// Drop the customer's parked purchase and detach their active payment
    /// session, if any. Returns the detached order id.
    ///
    /// The gateway-side transaction is not cancelled; a late payment is
    /// still credited by `tick` but buys nothing.
    pub fn handle_cancel(&self, customer: CustomerId) -> ShopResult<Option<String>> {
        {
            let store = self.ledger.lock()?;
            if let Some(pending) = store.pending_purchase(customer)? {
                store.clear_pending_purchase(customer, self.clock.now())?;
                log::info!(
                    "customer {customer} cancelled parked purchase of {} ({} days)",
                    pending.credential,
                    pending.days
                );
            }
        }
        self.settlement.detach(customer)
    }

    pub fn tick(&self) -> ShopResult<TickReport> {
        self.settlement.tick()
    }

    pub fn get_wallet_snapshot(&self, customer: CustomerId) -> ShopResult<WalletSnapshot> {
        let wallet = {
            let store = self.ledger.lock()?;
            store
                .wallet(customer)?
                .unwrap_or_else(|| WalletRecord::empty(customer))
        };
        Ok(WalletSnapshot {
            customer_id: wallet.customer_id,
            balance: wallet.balance,
            trial_used: wallet.trial_used,
            banned: wallet.banned,
            created_count: wallet.created_count,
            pending: wallet.pending,
            open_session: self.settlement.active_session(customer)?,
        })
    }

    pub fn list_accounts(&self) -> ShopResult<Vec<AccountListing>> {
        self.fulfiller.provisioner().list()
    }

    /// Paid account creations today, this ISO week and this month.
    pub fn activity(&self) -> ShopResult<ActivityCounts> {
        let now = self.clock.now().with_timezone(&self.config.offset());
        let events = self.ledger.lock()?.metrics_since(window_start(now))?;
        Ok(compute_metrics(&events, now))
    }

    // ── Admin operations ──────────────────────────────────────────

    fn ensure_admin(&self, admin: CustomerId) -> ShopResult<()> {
        if !self.config.is_admin(admin) {
            return Err(ShopError::Forbidden("admin only".into()));
        }
        Ok(())
    }

    /// Manual credit. Does not complete a parked purchase.
    pub fn admin_credit(&self, admin: CustomerId, customer: CustomerId, amount: Amount) -> ShopResult<Amount> {
        self.ensure_admin(admin)?;
        let balance = self.ledger.lock()?.credit(
            customer,
            amount,
            EntryReason::AdminAdjustment,
            None,
            self.clock.now(),
        )?;
        log::info!("admin credited customer {customer} {}", format_amount(amount));
        Ok(balance)
    }

    /// Manual debit, clamped at zero.
    pub fn admin_debit(&self, admin: CustomerId, customer: CustomerId, amount: Amount) -> ShopResult<Amount> {
        self.ensure_admin(admin)?;
        let balance = self.ledger.lock()?.debit(
            customer,
            amount,
            EntryReason::AdminAdjustment,
            None,
            self.clock.now(),
        )?;
        log::info!("admin debited customer {customer} {}", format_amount(amount));
        Ok(balance)
    }

    /// Banning an unknown customer creates their record; unbanning one is an error.
    pub fn admin_set_banned(&self, admin: CustomerId, customer: CustomerId, banned: bool) -> ShopResult<()> {
        self.ensure_admin(admin)?;
        let store = self.ledger.lock()?;
        if !banned && store.wallet(customer)?.is_none() {
            return Err(ShopError::Validation(format!("customer {customer} not found")));
        }
        store.set_banned(customer, banned, self.clock.now())?;
        log::info!("customer {customer} banned={banned}");
        Ok(())
    }

    /// Provision without touching any wallet or counter.
    pub fn admin_create_free(&self, admin: CustomerId, credential: &str, days: Days) -> ShopResult<AccountInfo> {
        self.ensure_admin(admin)?;
        let credential = Credential::parse(credential)?;
        validate_days(days, self.config.max_renew_days)?;
        self.fulfiller.provisioner().create(&credential, days)
    }

    pub fn admin_activity(&self, admin: CustomerId) -> ShopResult<ActivityCounts> {
        self.ensure_admin(admin)?;
        self.activity()
    }

    pub fn admin_open_exceptions(&self, admin: CustomerId) -> ShopResult<Vec<SettlementExceptionRow>> {
        self.ensure_admin(admin)?;
        self.ledger.lock()?.open_settlement_exceptions()
    }

    pub fn admin_resolve_exception(&self, admin: CustomerId, exception_id: &str, note: &str) -> ShopResult<()> {
        self.ensure_admin(admin)?;
        self.ledger
            .lock()?
            .resolve_settlement_exception(exception_id, note, self.clock.now())?;
        log::info!("exception {exception_id} resolved: {note}");
        Ok(())
    }
}

fn ensure_not_banned(store: &LedgerStore, customer: CustomerId) -> ShopResult<()> {
    if store.is_banned(customer)? {
        return Err(ShopError::Forbidden("your account is banned".into()));
    }
    Ok(())
}

fn validate_days(days: Days, max: Days) -> ShopResult<()> {
    if !(1..=max).contains(&days) {
        return Err(ShopError::Validation(format!("duration must be 1-{max} days")));
    }
    Ok(())
}
