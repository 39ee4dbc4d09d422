use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 9999-12-31T23:59:59Z, the deadline of records that never become due.
pub fn far_future() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How the scheduler treats a record once it becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    #[default]
    Plain,
    /// One-shot schedule registered with `SCHEDULE`.
    Schedule,
    /// Batch key whose schedule flushes accumulated items.
    Batch,
    /// `SET` carrying a recurring schedule.
    Cron,
}

/// The unit of stored state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub due_at: DateTime<Utc>,
    pub payload: String,
    pub expired: bool,
    pub ack_hold: bool,
    pub schedule: Option<String>,
    pub kind: RecordKind,
}

impl Record {
    pub fn new(key: impl Into<String>, payload: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            due_at,
            payload: payload.into(),
            expired: false,
            ack_hold: false,
            schedule: None,
            kind: RecordKind::Plain,
        }
    }

    pub fn with_ack_hold(mut self, ack_hold: bool) -> Self {
        self.ack_hold = ack_hold;
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = kind;
        self
    }

    /// Due records have a passed deadline and are not yet marked expired.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.expired && self.due_at <= now
    }

    /// Schedule string, if one is present and non-blank.
    pub fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// One value appended under a batch key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub sequence: u64,
    pub batch_key: String,
    pub payload: String,
    pub flushed: bool,
    pub flush_group: Option<DateTime<Utc>>,
}
