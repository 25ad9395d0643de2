//! zivpn-bot: headless runner for the ZIVPN UDP shop bot.
//!
//! Chat events arrive as JSON lines on stdin; outbound chat messages and
//! command replies leave as JSON lines on stdout. Payments and provisioning
//! go to the in-process sandbox gateways.
//!
//! Usage:
//!   zivpn-bot --config data/bot-config.json
//!   zivpn-bot --db :memory: --seed 7
//!
//! Input lines:
//!   {"type":"text","customer":42,"destination":42,"text":"/start"}
//!   {"type":"action","customer":42,"destination":42,"action":"topup"}
//!   {"type":"forward","customer":1,"from":42,"text":"my account stopped working"}
//!   {"type":"confirm_payment","order_id":"TOPUP-42-1714550400000"}
//!   {"type":"tick"}
//!   {"type":"snapshot","customer":42}
//!   {"type":"quit"}

use anyhow::Result;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use zivpn_core::{
    chat::{Action, ChatTransport, OutboundMessage},
    clock::{Clock, SystemClock},
    config::ShopConfig,
    dialog::{ChatEvent, Conversations, Dialog, Input},
    gateway::sandbox::{LocalProvisioner, SandboxPaymentGateway},
    scheduler::spawn_reconciler,
    shop::{Collaborators, Shop},
    types::{CustomerId, Destination},
};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Text {
        customer: CustomerId,
        destination: Option<Destination>,
        text: String,
    },
    Action {
        customer: CustomerId,
        destination: Option<Destination>,
        action: Action,
    },
    Forward {
        customer: CustomerId,
        destination: Option<Destination>,
        from: CustomerId,
        text: String,
    },
    ConfirmPayment {
        order_id: String,
    },
    Tick,
    Snapshot {
        customer: CustomerId,
    },
    Quit,
}

/// Serialised writer shared by the main loop and the reconciler thread.
struct JsonLines {
    out: Mutex<io::Stdout>,
}

impl JsonLines {
    fn emit(&self, value: &serde_json::Value) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{value}").and_then(|_| out.flush()) {
            log::error!("stdout write failed: {e}");
        }
    }
}

struct StdoutTransport {
    lines: Arc<JsonLines>,
}

impl ChatTransport for StdoutTransport {
    fn send(&self, message: OutboundMessage) {
        self.lines.emit(&serde_json::json!({ "message": message }));
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let config_path = parse_str(&args, "--config").unwrap_or("data/bot-config.json");
    let seed = parse_arg(&args, "--seed", 42u64);

    let mut config = if std::path::Path::new(config_path).exists() {
        ShopConfig::load(config_path)?
    } else {
        log::warn!("{config_path} not found, using defaults");
        ShopConfig::default()
    };
    if let Some(db) = parse_str(&args, "--db") {
        config.db_path = db.to_string();
    }
    log::info!(
        "zivpn-bot: db={} admin={} price={}/day seed={seed}",
        config.db_path,
        config.admin_id,
        config.daily_price
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let payments = Arc::new(SandboxPaymentGateway::new(seed, Arc::clone(&clock)));
    let provisioner = Arc::new(LocalProvisioner::new(Arc::clone(&clock), config.offset()));
    let lines = Arc::new(JsonLines {
        out: Mutex::new(io::stdout()),
    });
    let transport: Arc<dyn ChatTransport> = Arc::new(StdoutTransport {
        lines: Arc::clone(&lines),
    });

    let interval = config.poll_interval();
    let shop = Arc::new(Shop::open(
        config,
        Collaborators {
            payments: payments.clone(),
            provisioner,
            transport: Arc::clone(&transport),
            clock,
        },
    )?);
    let reconciler = spawn_reconciler(Arc::clone(&shop), interval)?;

    let dialog = Dialog::new(Arc::clone(&shop), transport);
    let mut convs = Conversations::new();
    run_ipc_loop(&shop, &dialog, &mut convs, &payments, &lines)?;

    reconciler.stop();
    Ok(())
}

fn run_ipc_loop(
    shop: &Shop,
    dialog: &Dialog,
    convs: &mut Conversations,
    payments: &SandboxPaymentGateway,
    lines: &JsonLines,
) -> Result<()> {
    let stdin = io::stdin();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                lines.emit(&serde_json::json!({ "error": e.to_string() }));
                continue;
            }
        };

        match cmd {
            IpcCommand::Quit => break,
            IpcCommand::Text {
                customer,
                destination,
                text,
            } => dialog.handle(
                convs,
                ChatEvent {
                    customer,
                    destination: destination.unwrap_or(customer),
                    input: Input::Text(text),
                },
            ),
            IpcCommand::Action {
                customer,
                destination,
                action,
            } => dialog.handle(
                convs,
                ChatEvent {
                    customer,
                    destination: destination.unwrap_or(customer),
                    input: Input::Action(action),
                },
            ),
            IpcCommand::Forward {
                customer,
                destination,
                from,
                text,
            } => dialog.handle(
                convs,
                ChatEvent {
                    customer,
                    destination: destination.unwrap_or(customer),
                    input: Input::Forwarded { from, text },
                },
            ),
            IpcCommand::ConfirmPayment { order_id } => {
                let confirmed = payments.confirm(&order_id);
                lines.emit(&serde_json::json!({ "order_id": order_id, "confirmed": confirmed }));
            }
            IpcCommand::Tick => match shop.tick() {
                Ok(report) => lines.emit(&serde_json::json!({ "tick": report })),
                Err(e) => lines.emit(&serde_json::json!({ "error": e.to_string() })),
            },
            IpcCommand::Snapshot { customer } => match shop.get_wallet_snapshot(customer) {
                Ok(snapshot) => lines.emit(&serde_json::json!({ "snapshot": snapshot })),
                Err(e) => lines.emit(&serde_json::json!({ "error": e.to_string() })),
            },
        }
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn parse_str<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
