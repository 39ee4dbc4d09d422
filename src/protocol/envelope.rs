use crate::core::{KronError, Record, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every action tag that travels on the wire, inbound or outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Action {
    Set,
    Schedule,
    Batch,
    AddBatch,
    Get,
    Delete,
    Reset,
    Keys,
    Increment,
    Decrement,
    /// Reply to SET, SCHEDULE, BATCH and ADD-BATCH
    Response,
    /// Recurring record fired
    Cron,
    /// Ack-hold record passed its deadline
    Expired,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Set => "SET",
            Action::Schedule => "SCHEDULE",
            Action::Batch => "BATCH",
            Action::AddBatch => "ADD-BATCH",
            Action::Get => "GET",
            Action::Delete => "DELETE",
            Action::Reset => "RESET",
            Action::Keys => "KEYS",
            Action::Increment => "INCREMENT",
            Action::Decrement => "DECREMENT",
            Action::Response => "RESPONSE",
            Action::Cron => "CRON",
            Action::Expired => "EXPIRED",
        }
    }

    /// Tag carried by the reply to a command with this tag.
    pub fn reply_action(&self) -> Action {
        match self {
            Action::Set | Action::Schedule | Action::Batch | Action::AddBatch => Action::Response,
            Action::Get => Action::Get,
            Action::Delete => Action::Delete,
            Action::Reset => Action::Reset,
            Action::Keys => Action::Keys,
            Action::Increment => Action::Increment,
            Action::Decrement => Action::Decrement,
            Action::Response | Action::Cron | Action::Expired => Action::Response,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message shape shared by commands, replies and push notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, alias = "expire", skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Relative deadline in milliseconds, used when `dueAt` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Client correlation id, echoed back untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ack_hold: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Key regex, GET only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Envelope {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            key: None,
            due_at: None,
            ttl: None,
            data: None,
            error: None,
            id: None,
            ack_hold: false,
            schedule: None,
            pattern: None,
        }
    }

    /// Reply skeleton for `request`: reply tag, echoed key and correlation id.
    pub fn reply_to(request: &Envelope) -> Self {
        let mut reply = Self::new(request.action.reply_action());
        reply.key = request.key.clone().filter(|k| !k.is_empty());
        reply.id = request.id.clone();
        reply
    }

    /// Push notification describing `record`.
    pub fn event(action: Action, record: &Record, data: impl Into<String>) -> Self {
        let mut event = Self::new(action);
        event.key = Some(record.key.clone());
        event.due_at = Some(record.due_at);
        event.data = Some(data.into());
        event.ack_hold = record.ack_hold;
        event.schedule = record.schedule.clone();
        event
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or("")
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| KronError::Protocol(format!("malformed message: {e}")))
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| KronError::Protocol(format!("malformed message: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
