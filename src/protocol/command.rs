use super::envelope::{Action, Envelope};
use crate::core::{KronError, RecordKind, Result};
use crate::store::NewRecord;
use chrono::{DateTime, Duration, Utc};

/// Inbound operations. Built from an [`Envelope`] with every required field
/// checked, so handlers never see a half-formed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set(NewRecord),
    AddBatch { key: String, payload: String },
    Get { key: String },
    Find { pattern: String },
    Delete { key: String },
    Reset,
    Keys,
    Increment { key: String, delta: i64 },
    Decrement { key: String, delta: i64 },
}

impl Command {
    /// Deadlines given as `ttl` resolve against `now`.
    pub fn from_envelope(envelope: &Envelope, now: DateTime<Utc>) -> Result<Self> {
        let command = match envelope.action {
            Action::Set | Action::Schedule | Action::Batch => {
                Command::Set(new_record(envelope, now)?)
            }
            Action::AddBatch => Command::AddBatch {
                key: required_key(envelope)?,
                payload: envelope.data.clone().unwrap_or_default(),
            },
            Action::Get => match envelope.pattern.as_deref().filter(|p| !p.is_empty()) {
                Some(pattern) => Command::Find {
                    pattern: pattern.to_string(),
                },
                None => Command::Get {
                    key: required_key(envelope)?,
                },
            },
            Action::Delete => Command::Delete {
                key: required_key(envelope)?,
            },
            Action::Reset => Command::Reset,
            Action::Keys => Command::Keys,
            Action::Increment => Command::Increment {
                key: required_key(envelope)?,
                delta: delta(envelope)?,
            },
            Action::Decrement => Command::Decrement {
                key: required_key(envelope)?,
                delta: delta(envelope)?,
            },
            Action::Response | Action::Cron | Action::Expired => {
                return Err(KronError::Validation(format!(
                    "{} is a server message, not a command",
                    envelope.action
                )));
            }
        };
        Ok(command)
    }
}

fn required_key(envelope: &Envelope) -> Result<String> {
    match envelope.key.as_deref() {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => Err(KronError::empty_key()),
    }
}

fn delta(envelope: &Envelope) -> Result<i64> {
    let raw = envelope.data.as_deref().unwrap_or("").trim();
    raw.parse()
        .map_err(|_| KronError::NumericParse(format!("delta '{raw}'")))
}

fn kind_for(envelope: &Envelope) -> RecordKind {
    let has_schedule = envelope
        .schedule
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty());
    match envelope.action {
        Action::Schedule => RecordKind::Schedule,
        Action::Batch => RecordKind::Batch,
        _ if has_schedule => RecordKind::Cron,
        _ => RecordKind::Plain,
    }
}

fn new_record(envelope: &Envelope, now: DateTime<Utc>) -> Result<NewRecord> {
    let due_at = match (envelope.due_at, envelope.ttl) {
        (Some(due_at), _) => Some(due_at),
        (None, Some(ttl)) => {
            let ttl = i64::try_from(ttl)
                .ok()
                .and_then(Duration::try_milliseconds)
                .and_then(|ttl| now.checked_add_signed(ttl))
                .ok_or_else(|| KronError::Validation(format!("ttl {ttl}ms is out of range")))?;
            Some(ttl)
        }
        (None, None) => None,
    };

    Ok(NewRecord {
        key: envelope.key.clone().unwrap_or_default(),
        payload: envelope.data.clone().unwrap_or_default(),
        due_at,
        ack_hold: envelope.ack_hold,
        schedule: envelope.schedule.clone(),
        kind: kind_for(envelope),
    })
}
