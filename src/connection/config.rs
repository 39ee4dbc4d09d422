use crate::core::{KronError, Result};
use crate::events::OverflowPolicy;
use crate::storage::DurabilityMode;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;

/// Server configuration
///
/// Built from defaults, then `KRONCACHE_*` environment variables, then
/// command-line flags.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,

    pub port: u16,

    /// How often the lifecycle scheduler looks for due records
    pub tick_interval: Duration,

    /// Events buffered per connection before the overflow policy applies
    pub subscriber_capacity: usize,

    pub overflow_policy: OverflowPolicy,

    /// WAL and snapshot directory; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,

    pub durability: DurabilityMode,

    /// WAL entries between automatic snapshots
    pub checkpoint_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            tick_interval: Duration::from_secs(1),
            subscriber_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            data_dir: None,
            durability: DurabilityMode::Async,
            checkpoint_threshold: 1000,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `KRONCACHE_PORT`, `KRONCACHE_HOST`,
    /// `KRONCACHE_DATA_DIR` and `KRONCACHE_TICK_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("KRONCACHE_PORT") {
            config.port = raw
                .trim()
                .parse()
                .map_err(|_| KronError::Validation(format!("invalid KRONCACHE_PORT='{raw}'")))?;
        }
        if let Some(host) = lookup("KRONCACHE_HOST").filter(|h| !h.trim().is_empty()) {
            config.host = host;
        }
        if let Some(dir) = lookup("KRONCACHE_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = lookup("KRONCACHE_TICK_MS") {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|_| KronError::Validation(format!("invalid KRONCACHE_TICK_MS='{raw}'")))?;
            config.tick_interval = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(KronError::Validation("host cannot be empty".to_string()));
        }

        if self.tick_interval.is_zero() {
            return Err(KronError::Validation("tick interval must be > 0".to_string()));
        }

        if self.subscriber_capacity == 0 {
            return Err(KronError::Validation("subscriber capacity must be > 0".to_string()));
        }

        if self.data_dir.is_some() && self.checkpoint_threshold == 0 {
            return Err(KronError::Validation("checkpoint threshold must be > 0".to_string()));
        }

        Ok(())
    }
}
