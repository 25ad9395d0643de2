//! Chat conversation flow on top of the shop.
//!
//! RULE: conversation state lives in an explicit `Conversations` value owned
//! by the caller and passed into every handler. Nothing here is global.
//! RULE: invalid input re-prompts and keeps the state; every terminal step
//! clears it.

use crate::{
    chat::{Action, Button, ChatTransport, Keyboard, OutboundMessage},
    error::ShopError,
    gateway::AccountStatus,
    session::PaymentSession,
    settlement::account_summary,
    shop::{PurchaseOutcome, Shop},
    types::{format_amount, Amount, Credential, CustomerId, Days, Destination},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

/// Which field the bot is waiting for, plus what was collected so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Awaiting {
    CreateCredential,
    CreateDays { credential: Credential },
    TrialCredential,
    RenewCredential,
    RenewDays { credential: Credential },
    TopupAmount,
    AdminAddBalance,
    AdminRemoveBalance,
    AdminBan,
    AdminUnban,
    AdminFreeCredential,
    AdminFreeDays { credential: Credential },
    AdminMessageTarget,
    AdminMessageCompose { target: CustomerId },
}

#[derive(Debug, Default)]
pub struct Conversations {
    awaiting: HashMap<CustomerId, Awaiting>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn awaiting(&self, customer: CustomerId) -> Option<&Awaiting> {
        self.awaiting.get(&customer)
    }

    pub fn clear(&mut self, customer: CustomerId) {
        self.awaiting.remove(&customer);
    }

    pub fn len(&self) -> usize {
        self.awaiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.awaiting.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    Text(String),
    Action(Action),
    /// A message the sender forwarded from another chat, with its origin.
    Forwarded { from: CustomerId, text: String },
}

/// One inbound chat event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub customer: CustomerId,
    pub destination: Destination,
    pub input: Input,
}

pub struct Dialog {
    shop: Arc<Shop>,
    transport: Arc<dyn ChatTransport>,
}

impl Dialog {
    pub fn new(shop: Arc<Shop>, transport: Arc<dyn ChatTransport>) -> Self {
        Self { shop, transport }
    }

    pub fn handle(&self, convs: &mut Conversations, event: ChatEvent) {
        let ChatEvent {
            customer,
            destination,
            input,
        } = event;
        match input {
            Input::Action(action) => self.on_action(convs, customer, destination, action),
            Input::Text(text) if text.trim() == "/start" => {
                convs.clear(customer);
                self.main_menu(customer, destination);
            }
            Input::Text(text) => match convs.awaiting.remove(&customer) {
                Some(state) => self.on_text(convs, customer, destination, state, text.trim()),
                None => self.main_menu(customer, destination),
            },
            Input::Forwarded { from, text } => match convs.awaiting.remove(&customer) {
                Some(Awaiting::AdminMessageTarget) => {
                    self.ask(convs, customer, destination, Awaiting::AdminMessageCompose { target: from })
                }
                Some(state) => self.on_text(convs, customer, destination, state, text.trim()),
                None => self.main_menu(customer, destination),
            },
        }
    }

    // ── Actions ───────────────────────────────────────────────────

    fn on_action(&self, convs: &mut Conversations, customer: CustomerId, dest: Destination, action: Action) {
        let is_admin = self.shop.config().is_admin(customer);
        match action {
            Action::Start => {
                convs.clear(customer);
                self.main_menu(customer, dest);
            }
            Action::Cancel => {
                convs.clear(customer);
                match self.shop.handle_cancel(customer) {
                    Ok(Some(order_id)) => self.say(
                        dest,
                        format!("❎ Cancelled. If you already paid for {order_id}, it will still be credited."),
                    ),
                    Ok(None) => self.say(dest, "❎ Cancelled."),
                    Err(e) => self.fail(dest, &e),
                }
                self.main_menu(customer, dest);
            }
            Action::Create => self.ask(convs, customer, dest, Awaiting::CreateCredential),
            Action::Trial => self.ask(convs, customer, dest, Awaiting::TrialCredential),
            Action::Renew => self.ask(convs, customer, dest, Awaiting::RenewCredential),
            Action::Topup => self.ask(convs, customer, dest, Awaiting::TopupAmount),
            Action::List => self.list_accounts(dest),
            _ if !is_admin => self.fail(dest, &ShopError::Forbidden("admin only".into())),
            Action::AdminAddBalance => self.ask(convs, customer, dest, Awaiting::AdminAddBalance),
            Action::AdminRemoveBalance => {
                self.ask(convs, customer, dest, Awaiting::AdminRemoveBalance)
            }
            Action::AdminBan => self.ask(convs, customer, dest, Awaiting::AdminBan),
            Action::AdminUnban => self.ask(convs, customer, dest, Awaiting::AdminUnban),
            Action::AdminCreateFree => self.ask(convs, customer, dest, Awaiting::AdminFreeCredential),
            Action::AdminActivity => match self.shop.admin_activity(customer) {
                Ok(c) => self.say(
                    dest,
                    format!("📈 Activity: today {} • week {} • month {}", c.today, c.week, c.month),
                ),
                Err(e) => self.fail(dest, &e),
            },
            Action::AdminExceptions => self.list_exceptions(customer, dest),
            Action::AdminMessage => self.ask(convs, customer, dest, Awaiting::AdminMessageTarget),
        }
    }

    fn ask(&self, convs: &mut Conversations, customer: CustomerId, dest: Destination, state: Awaiting) {
        self.send(OutboundMessage::text(dest, self.prompt(&state)).with_keyboard(Keyboard::cancel_only()));
        convs.awaiting.insert(customer, state);
    }

    fn prompt(&self, state: &Awaiting) -> String {
        let cfg = self.shop.config();
        match state {
            Awaiting::CreateCredential | Awaiting::AdminFreeCredential => {
                "👤 Enter a new password (3-20 letters, digits, '-' or '_'):".into()
            }
            Awaiting::CreateDays { .. } => format!(
                "⏳ Enter the duration in days (1-{}), {} per day:",
                cfg.max_purchase_days,
                format_amount(cfg.daily_price)
            ),
            Awaiting::TrialCredential => "🆓 Enter a password for your trial account:".into(),
            Awaiting::RenewCredential => "🔁 Enter the password of the account to renew:".into(),
            Awaiting::RenewDays { .. } | Awaiting::AdminFreeDays { .. } => {
                format!("⏳ Enter the duration in days (1-{}):", cfg.max_renew_days)
            }
            Awaiting::TopupAmount => format!(
                "💳 Enter the top-up amount (minimum {}):",
                format_amount(cfg.min_topup)
            ),
            Awaiting::AdminAddBalance => "🟢 Enter customer id and amount to add (e.g. 7251232303 50000):".into(),
            Awaiting::AdminRemoveBalance => {
                "🔴 Enter customer id and amount to remove (e.g. 7251232303 50000):".into()
            }
            Awaiting::AdminBan => "⛔ Enter the customer id to ban:".into(),
            Awaiting::AdminUnban => "✅ Enter the customer id to unban:".into(),
            Awaiting::AdminMessageTarget => {
                "📨 Forward a message from the customer, or enter their customer id:".into()
            }
            Awaiting::AdminMessageCompose { target } => {
                format!("✉️ Type the message to send to {target}:")
            }
        }
    }

    /// Re-ask for the same field after invalid input.
    fn reprompt(&self, convs: &mut Conversations, customer: CustomerId, dest: Destination, state: Awaiting, problem: &str) {
        self.say(dest, format!("❌ {problem}"));
        self.ask(convs, customer, dest, state);
    }

    // ── Free text ─────────────────────────────────────────────────

    fn on_text(&self, convs: &mut Conversations, customer: CustomerId, dest: Destination, state: Awaiting, text: &str) {
        let cfg = self.shop.config();
        match state {
            Awaiting::CreateCredential => match Credential::parse(text) {
                Ok(credential) => self.ask(convs, customer, dest, Awaiting::CreateDays { credential }),
                Err(e) => self.reprompt(convs, customer, dest, state, &err_text(&e)),
            },
            Awaiting::CreateDays { credential } => {
                let Some(days) = parse_days(text, cfg.max_purchase_days) else {
                    let problem = format!("Duration must be a number from 1 to {}.", cfg.max_purchase_days);
                    return self.reprompt(convs, customer, dest, Awaiting::CreateDays { credential }, &problem);
                };
                self.finish_purchase(customer, dest, &credential, days);
            }
            Awaiting::TrialCredential => match Credential::parse(text) {
                Ok(credential) => match self.shop.handle_trial_request(customer, credential.as_str()) {
                    Ok(account) => {
                        let text = format!(
                            "✅ Trial account created.\n{}",
                            account_summary(&account, &cfg.domain)
                        );
                        self.say(dest, text);
                    }
                    Err(e) => self.fail(dest, &e),
                },
                Err(e) => self.reprompt(convs, customer, dest, state, &err_text(&e)),
            },
            Awaiting::RenewCredential => match Credential::parse(text) {
                Ok(credential) => self.ask(convs, customer, dest, Awaiting::RenewDays { credential }),
                Err(e) => self.reprompt(convs, customer, dest, state, &err_text(&e)),
            },
            Awaiting::RenewDays { credential } => {
                let Some(days) = parse_days(text, cfg.max_renew_days) else {
                    let problem = format!("Duration must be a number from 1 to {}.", cfg.max_renew_days);
                    return self.reprompt(convs, customer, dest, Awaiting::RenewDays { credential }, &problem);
                };
                match self.shop.handle_renew_request(customer, credential.as_str(), days) {
                    Ok(out) => {
                        self.say(
                            dest,
                            format!(
                                "✅ {} renewed until {}.\nRemaining balance: {}",
                                out.account.credential,
                                out.account.expires_on.format("%Y-%m-%d"),
                                format_amount(out.balance_after)
                            ),
                        );
                        self.main_menu(customer, dest);
                    }
                    Err(e) => self.fail(dest, &e),
                }
            }
            Awaiting::TopupAmount => {
                let amount = text.parse::<Amount>().ok().filter(|a| *a >= cfg.min_topup);
                let Some(amount) = amount else {
                    let problem = format!("Invalid amount. Minimum top-up is {}.", format_amount(cfg.min_topup));
                    return self.reprompt(convs, customer, dest, state, &problem);
                };
                match self.shop.handle_topup_request(customer, dest, amount) {
                    Ok(session) => self.send_payment_request(&session, "💳 Top up"),
                    Err(e) => self.fail(dest, &e),
                }
            }
            Awaiting::AdminAddBalance | Awaiting::AdminRemoveBalance => {
                let Some((target, amount)) = parse_id_amount(text) else {
                    return self.reprompt(convs, customer, dest, state, "Expected: <customer id> <amount>");
                };
                let result = if state == Awaiting::AdminAddBalance {
                    self.shop.admin_credit(customer, target, amount)
                } else {
                    self.shop.admin_debit(customer, target, amount)
                };
                match result {
                    Ok(balance) => {
                        self.say(
                            dest,
                            format!("✅ Balance of {target} is now {}.", format_amount(balance)),
                        );
                        self.say(
                            target,
                            format!("💰 Your balance was adjusted by an admin. Balance: {}", format_amount(balance)),
                        );
                    }
                    Err(e) => self.fail(dest, &e),
                }
            }
            Awaiting::AdminBan | Awaiting::AdminUnban => {
                let Ok(target) = text.parse::<CustomerId>() else {
                    return self.reprompt(convs, customer, dest, state, "Expected a numeric customer id.");
                };
                let ban = state == Awaiting::AdminBan;
                match self.shop.admin_set_banned(customer, target, ban) {
                    Ok(()) if ban => self.say(dest, format!("⛔ {target} is banned.")),
                    Ok(()) => self.say(dest, format!("✅ {target} is unbanned.")),
                    Err(e) => self.fail(dest, &e),
                }
            }
            Awaiting::AdminFreeCredential => match Credential::parse(text) {
                Ok(credential) => self.ask(convs, customer, dest, Awaiting::AdminFreeDays { credential }),
                Err(e) => self.reprompt(convs, customer, dest, state, &err_text(&e)),
            },
            Awaiting::AdminFreeDays { credential } => {
                let Some(days) = parse_days(text, cfg.max_renew_days) else {
                    let problem = format!("Duration must be a number from 1 to {}.", cfg.max_renew_days);
                    return self.reprompt(convs, customer, dest, Awaiting::AdminFreeDays { credential }, &problem);
                };
                match self.shop.admin_create_free(customer, credential.as_str(), days) {
                    Ok(account) => self.say(
                        dest,
                        format!("✅ Free account created.\n{}", account_summary(&account, &cfg.domain)),
                    ),
                    Err(e) => self.fail(dest, &e),
                }
            }
            Awaiting::AdminMessageTarget => match text.parse::<CustomerId>() {
                Ok(target) => self.ask(convs, customer, dest, Awaiting::AdminMessageCompose { target }),
                Err(_) => self.reprompt(
                    convs,
                    customer,
                    dest,
                    state,
                    "Forward a message from the customer or enter a numeric customer id.",
                ),
            },
            Awaiting::AdminMessageCompose { target } => {
                if text.is_empty() {
                    let state = Awaiting::AdminMessageCompose { target };
                    return self.reprompt(convs, customer, dest, state, "The message is empty.");
                }
                self.say(target, format!("📨 Message from admin:\n{text}"));
                self.say(dest, format!("✅ Message sent to {target}."));
            }
        }
    }

    fn finish_purchase(&self, customer: CustomerId, dest: Destination, credential: &Credential, days: Days) {
        let cfg = self.shop.config();
        match self.shop.handle_purchase_request(customer, credential.as_str(), days) {
            Ok(PurchaseOutcome::Completed {
                account,
                balance_after,
            }) => {
                self.say(
                    dest,
                    format!(
                        "✅ Account created.\n{}\nRemaining balance: {}",
                        account_summary(&account, &cfg.domain),
                        format_amount(balance_after)
                    ),
                );
                self.main_menu(customer, dest);
            }
            Ok(PurchaseOutcome::Parked { balance, required }) => {
                let text = format!(
                    "⚠️ Your balance is {}. {} is needed for {days} days.\nTop up at least {} and the purchase of {credential} completes automatically.",
                    format_amount(balance),
                    format_amount(required),
                    format_amount(cfg.min_topup)
                );
                let keyboard = Keyboard::default().row(vec![
                    Button::new("💳 Top up", Action::Topup),
                    Button::new("❌ Cancel", Action::Cancel),
                ]);
                self.send(OutboundMessage::text(dest, text).with_keyboard(keyboard));
            }
            Err(e) => self.fail(dest, &e),
        }
    }

    fn send_payment_request(&self, session: &PaymentSession, title: &str) {
        let text = format!(
            "{title}\nAmount: {}\nScan the QR to pay: {}\nOrder: {}\nExpires: {}",
            format_amount(session.amount),
            session.payment_reference,
            session.order_id,
            session.expires_at.format("%Y-%m-%d %H:%M UTC")
        );
        self.send(OutboundMessage::text(session.destination, text).with_keyboard(Keyboard::cancel_only()));
    }

    // ── Views ─────────────────────────────────────────────────────

    pub fn main_menu(&self, customer: CustomerId, dest: Destination) {
        let cfg = self.shop.config();
        let snapshot = match self.shop.get_wallet_snapshot(customer) {
            Ok(s) => s,
            Err(e) => return self.fail(dest, &e),
        };
        let activity = match self.shop.activity() {
            Ok(a) => a,
            Err(e) => return self.fail(dest, &e),
        };
        let domain = if cfg.domain.is_empty() {
            "(not configured)"
        } else {
            cfg.domain.as_str()
        };
        let rule = "━━━━━━━━━━━━━━━━━━━━━";
        let text = format!(
            "{rule}\n ZIVPN UDP\n{rule}\nBalance: {}\nAccounts created by you: {}\nActivity: today {} • week {} • month {}\n{rule}\n • Domain: {domain}\n • Price: {} / day\n{rule}",
            format_amount(snapshot.balance),
            snapshot.created_count,
            activity.today,
            activity.week,
            activity.month,
            format_amount(cfg.daily_price)
        );

        let mut keyboard = Keyboard::default()
            .row(vec![
                Button::new("🛒 Buy account", Action::Create),
                Button::new("💳 Top up", Action::Topup),
            ])
            .row(vec![
                Button::new("🆓 Trial", Action::Trial),
                Button::new("🔁 Renew", Action::Renew),
            ])
            .row(vec![Button::new("📋 Accounts", Action::List)]);
        if cfg.is_admin(customer) {
            keyboard = keyboard
                .row(vec![
                    Button::new("🟢 Add balance", Action::AdminAddBalance),
                    Button::new("🔴 Remove balance", Action::AdminRemoveBalance),
                ])
                .row(vec![
                    Button::new("⛔ Ban", Action::AdminBan),
                    Button::new("✅ Unban", Action::AdminUnban),
                ])
                .row(vec![
                    Button::new("📈 Activity", Action::AdminActivity),
                    Button::new("🎁 Free account", Action::AdminCreateFree),
                    Button::new("🧾 Exceptions", Action::AdminExceptions),
                ])
                .row(vec![Button::new("📨 Message customer", Action::AdminMessage)]);
        }
        self.send(OutboundMessage::text(dest, text).with_keyboard(keyboard));
    }

    fn list_accounts(&self, dest: Destination) {
        match self.shop.list_accounts() {
            Ok(accounts) if accounts.is_empty() => self.say(dest, "📋 No accounts yet."),
            Ok(accounts) => {
                let mut text = String::from("📋 Accounts");
                for (i, a) in accounts.iter().enumerate() {
                    let status = match a.status {
                        AccountStatus::Active => "🟢 Active",
                        AccountStatus::Expired => "🔴 Expired",
                    };
                    text.push_str(&format!(
                        "\n{}. {} ({}) {}",
                        i + 1,
                        a.credential,
                        status,
                        a.expires_on.format("%Y-%m-%d")
                    ));
                }
                self.say(dest, text);
            }
            Err(e) => self.fail(dest, &e),
        }
    }

    fn list_exceptions(&self, admin: CustomerId, dest: Destination) {
        match self.shop.admin_open_exceptions(admin) {
            Ok(rows) if rows.is_empty() => self.say(dest, "🧾 No open exceptions."),
            Ok(rows) => {
                let mut text = format!("🧾 {} open exception(s)", rows.len());
                for row in rows {
                    text.push_str(&format!(
                        "\n• {} customer {} {} ({} days, {}): {}",
                        row.exception_id,
                        row.customer_id,
                        row.credential,
                        row.days,
                        format_amount(row.amount),
                        row.reason
                    ));
                }
                self.say(dest, text);
            }
            Err(e) => self.fail(dest, &e),
        }
    }

    // ── Output ────────────────────────────────────────────────────

    fn send(&self, message: OutboundMessage) {
        self.transport.send(message);
    }

    fn say(&self, dest: Destination, text: impl Into<String>) {
        self.send(OutboundMessage::text(dest, text));
    }

    fn fail(&self, dest: Destination, err: &ShopError) {
        self.say(dest, err.user_message());
    }
}

fn err_text(err: &ShopError) -> String {
    match err {
        ShopError::Validation(msg) => msg.clone(),
        other => other.to_string(),
    }
}

fn parse_days(text: &str, max: Days) -> Option<Days> {
    text.parse::<Days>().ok().filter(|d| (1..=max).contains(d))
}

fn parse_id_amount(text: &str) -> Option<(CustomerId, Amount)> {
    let mut parts = text.split_whitespace();
    let id = parts.next()?.parse().ok()?;
    let amount = parts.next()?.parse::<Amount>().ok().filter(|a| *a > 0)?;
    if parts.next().is_some() {
        return None;
    }
    Some((id, amount))
}
