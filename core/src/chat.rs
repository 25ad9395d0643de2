//! Outbound chat surface: messages, keyboards, and the transport contract.

use crate::types::Destination;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// A discrete menu selection a customer can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Create,
    Trial,
    Renew,
    List,
    Topup,
    Cancel,
    AdminAddBalance,
    AdminRemoveBalance,
    AdminBan,
    AdminUnban,
    AdminActivity,
    AdminCreateFree,
    AdminExceptions,
    AdminMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub action: Action,
}

impl Button {
    pub fn new(label: &str, action: Action) -> Self {
        Self {
            label: label.to_string(),
            action,
        }
    }
}

/// Rows of buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn row(mut self, buttons: Vec<Button>) -> Self {
        self.rows.push(buttons);
        self
    }

    pub fn cancel_only() -> Self {
        Self::default().row(vec![Button::new("❌ Cancel", Action::Cancel)])
    }

    pub fn contains(&self, action: Action) -> bool {
        self.rows.iter().flatten().any(|b| b.action == action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub destination: Destination,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Keyboard>,
}

impl OutboundMessage {
    pub fn text(destination: Destination, text: impl Into<String>) -> Self {
        Self {
            destination,
            text: text.into(),
            keyboard: None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }
}

/// Delivery is fire-and-forget. Failures are the transport's to log.
pub trait ChatTransport: Send + Sync {
    fn send(&self, message: OutboundMessage);
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn messages_for(&self, destination: Destination) -> Vec<OutboundMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.destination == destination)
            .collect()
    }

    pub fn last_for(&self, destination: Destination) -> Option<OutboundMessage> {
        self.messages_for(destination).pop()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl ChatTransport for RecordingTransport {
    fn send(&self, message: OutboundMessage) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}
