//! Integration tests for the chat conversation flow.

mod common;

use common::{build, Harness, ADMIN};
use std::sync::Arc;
use zivpn_core::{
    chat::{Action, ChatTransport},
    dialog::{Awaiting, ChatEvent, Conversations, Dialog, Input},
};

const CUSTOMER: i64 = 1_100;

fn dialog(h: &Harness) -> Dialog {
    let transport: Arc<dyn ChatTransport> = h.transport.clone();
    Dialog::new(Arc::clone(&h.shop), transport)
}

fn text(customer: i64, t: &str) -> ChatEvent {
    ChatEvent {
        customer,
        destination: customer,
        input: Input::Text(t.to_string()),
    }
}

fn action(customer: i64, a: Action) -> ChatEvent {
    ChatEvent {
        customer,
        destination: customer,
        input: Input::Action(a),
    }
}

#[test]
fn start_shows_menu_with_balance_and_price() {
    let h = build();
    h.shop.admin_credit(ADMIN, CUSTOMER, 7_000).unwrap();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, text(CUSTOMER, "/start"));
    let menu = h.transport.last_for(CUSTOMER).expect("menu sent");
    assert!(menu.text.contains("Balance: Rp 7000"), "got: {}", menu.text);
    assert!(menu.text.contains("Rp 1000 / day"));
    let keyboard = menu.keyboard.expect("menu has a keyboard");
    assert!(keyboard.contains(Action::Create));
    assert!(!keyboard.contains(Action::AdminBan), "customers do not see admin actions");

    d.handle(&mut convs, action(ADMIN, Action::Start));
    let admin_menu = h.transport.last_for(ADMIN).unwrap();
    assert!(admin_menu.keyboard.unwrap().contains(Action::AdminBan));
}

#[test]
fn create_flow_reprompts_then_parks_when_short() {
    let h = build();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, action(CUSTOMER, Action::Create));
    assert_eq!(convs.awaiting(CUSTOMER), Some(&Awaiting::CreateCredential));

    d.handle(&mut convs, text(CUSTOMER, "no spaces allowed"));
    assert_eq!(
        convs.awaiting(CUSTOMER),
        Some(&Awaiting::CreateCredential),
        "invalid input keeps the state"
    );

    d.handle(&mut convs, text(CUSTOMER, "mona"));
    assert!(matches!(convs.awaiting(CUSTOMER), Some(Awaiting::CreateDays { .. })));

    d.handle(&mut convs, text(CUSTOMER, "0"));
    assert!(matches!(convs.awaiting(CUSTOMER), Some(Awaiting::CreateDays { .. })));

    d.handle(&mut convs, text(CUSTOMER, "3"));
    assert!(convs.awaiting(CUSTOMER).is_none(), "terminal step clears the state");
    let reply = h.transport.last_for(CUSTOMER).unwrap();
    assert!(reply.text.contains("Rp 3000 is needed"), "got: {}", reply.text);
    assert!(reply.keyboard.unwrap().contains(Action::Topup));

    let pending = h.shop.get_wallet_snapshot(CUSTOMER).unwrap().pending;
    assert_eq!(pending.map(|p| p.days), Some(3));
}

#[test]
fn topup_flow_issues_payment_and_cancel_detaches_it() {
    let h = build();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, action(CUSTOMER, Action::Topup));
    d.handle(&mut convs, text(CUSTOMER, "100"));
    assert_eq!(convs.awaiting(CUSTOMER), Some(&Awaiting::TopupAmount));

    d.handle(&mut convs, text(CUSTOMER, "5000"));
    assert!(convs.awaiting(CUSTOMER).is_none());
    let qr = h.transport.last_for(CUSTOMER).unwrap();
    assert!(qr.text.contains("QRIS-"), "payment reference shown, got: {}", qr.text);
    let session = h
        .shop
        .get_wallet_snapshot(CUSTOMER)
        .unwrap()
        .open_session
        .expect("session opened");

    d.handle(&mut convs, action(CUSTOMER, Action::Cancel));
    assert!(h.shop.get_wallet_snapshot(CUSTOMER).unwrap().open_session.is_none());
    let cancelled = h
        .transport
        .messages_for(CUSTOMER)
        .into_iter()
        .any(|m| m.text.contains("Cancelled") && m.text.contains(&session.order_id));
    assert!(cancelled, "customer told the payment still counts");

    h.payments.confirm(&session.order_id);
    h.shop.tick().unwrap();
    assert_eq!(h.balance(CUSTOMER), 5_000);
}

#[test]
fn non_admin_admin_action_is_refused() {
    let h = build();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, action(CUSTOMER, Action::AdminAddBalance));
    assert!(convs.awaiting(CUSTOMER).is_none());
    let reply = h.transport.last_for(CUSTOMER).unwrap();
    assert!(reply.text.starts_with('⛔'), "got: {}", reply.text);
}

#[test]
fn admin_adds_balance_through_chat() {
    let h = build();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, action(ADMIN, Action::AdminAddBalance));
    d.handle(&mut convs, text(ADMIN, "not-a-pair"));
    assert_eq!(convs.awaiting(ADMIN), Some(&Awaiting::AdminAddBalance));

    d.handle(&mut convs, text(ADMIN, &format!("{CUSTOMER} 25000")));
    assert!(convs.awaiting(ADMIN).is_none());
    assert_eq!(h.balance(CUSTOMER), 25_000);
    let notice = h.transport.last_for(CUSTOMER).expect("customer notified");
    assert!(notice.text.contains("Rp 25000"));
}

#[test]
fn trial_flow_creates_account() {
    let h = build();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, action(CUSTOMER, Action::Trial));
    d.handle(&mut convs, text(CUSTOMER, "trial_me"));
    let reply = h.transport.last_for(CUSTOMER).unwrap();
    assert!(reply.text.contains("trial_me"), "got: {}", reply.text);
    assert!(reply.text.contains("vpn.test"));
    assert!(convs.is_empty());
}

#[test]
fn stray_text_without_state_shows_menu() {
    let h = build();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, text(CUSTOMER, "hello?"));
    let reply = h.transport.last_for(CUSTOMER).unwrap();
    assert!(reply.text.contains("Balance:"));
}

#[test]
fn cancel_drops_parked_purchase_so_later_topup_buys_nothing() {
    let h = build();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, action(CUSTOMER, Action::Create));
    d.handle(&mut convs, text(CUSTOMER, "dave"));
    d.handle(&mut convs, text(CUSTOMER, "3"));
    assert!(h.shop.get_wallet_snapshot(CUSTOMER).unwrap().pending.is_some());

    d.handle(&mut convs, action(CUSTOMER, Action::Cancel));
    assert!(h.shop.get_wallet_snapshot(CUSTOMER).unwrap().pending.is_none());

    h.topup_and_settle(CUSTOMER, 5_000);
    assert_eq!(h.balance(CUSTOMER), 5_000, "nothing debited for the cancelled purchase");
    assert_eq!(h.provisioner.create_calls(), 0);
    assert!(h.provisioner.expiry_of("dave").is_none());
}

#[test]
fn admin_messages_customer_from_a_forwarded_message() {
    let h = build();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, action(ADMIN, Action::AdminMessage));
    assert_eq!(convs.awaiting(ADMIN), Some(&Awaiting::AdminMessageTarget));

    d.handle(
        &mut convs,
        ChatEvent {
            customer: ADMIN,
            destination: ADMIN,
            input: Input::Forwarded {
                from: CUSTOMER,
                text: "my account stopped working".into(),
            },
        },
    );
    assert_eq!(
        convs.awaiting(ADMIN),
        Some(&Awaiting::AdminMessageCompose { target: CUSTOMER })
    );

    d.handle(&mut convs, text(ADMIN, "Renewed it for you, try again."));
    assert!(convs.awaiting(ADMIN).is_none());
    let delivered = h.transport.last_for(CUSTOMER).expect("customer got the message");
    assert!(delivered.text.contains("Renewed it for you"), "got: {}", delivered.text);
    let ack = h.transport.last_for(ADMIN).unwrap();
    assert!(ack.text.contains(&format!("sent to {CUSTOMER}")), "got: {}", ack.text);
}

#[test]
fn admin_message_target_accepts_a_typed_id_and_rejects_junk() {
    let h = build();
    let d = dialog(&h);
    let mut convs = Conversations::new();

    d.handle(&mut convs, action(ADMIN, Action::AdminMessage));
    d.handle(&mut convs, text(ADMIN, "someone"));
    assert_eq!(convs.awaiting(ADMIN), Some(&Awaiting::AdminMessageTarget));

    d.handle(&mut convs, text(ADMIN, &CUSTOMER.to_string()));
    assert_eq!(
        convs.awaiting(ADMIN),
        Some(&Awaiting::AdminMessageCompose { target: CUSTOMER })
    );

    d.handle(&mut convs, action(CUSTOMER, Action::AdminMessage));
    assert!(convs.awaiting(CUSTOMER).is_none(), "customers cannot message others");
}
