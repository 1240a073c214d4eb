use serde::Deserialize;

use ferry_types::models::ChannelKind;

use crate::error::{BridgeError, Result};

/// Per-context message limits. Zero disables; for missed backfill a negative
/// value fetches everything that was missed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackfillLimits {
    pub channel: i32,
    pub dm: i32,
    pub thread: i32,
}

impl BackfillLimits {
    pub fn for_kind(&self, kind: ChannelKind) -> i32 {
        match kind {
            ChannelKind::Channel => self.channel,
            ChannelKind::Direct => self.dm,
        }
    }

    pub fn for_thread(&self) -> i32 {
        self.thread
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub initial_backfill: BackfillLimits,
    pub missed_backfill: BackfillLimits,
    /// Capacity of each portal inbox. Producers wait when it is full.
    pub inbox_capacity: usize,
    /// Server name used when rendering pre-assigned event IDs.
    pub server_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_backfill: BackfillLimits::default(),
            missed_backfill: BackfillLimits::default(),
            inbox_capacity: 128,
            server_name: "ferry.local".into(),
        }
    }
}

impl BridgeConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from a variable lookup. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let limit = |name: &str, slot: &mut i32| -> Result<()> {
            if let Some(raw) = lookup(name) {
                *slot = parse_var(name, &raw)?;
            }
            Ok(())
        };

        limit("FERRY_INITIAL_BACKFILL_CHANNEL", &mut config.initial_backfill.channel)?;
        limit("FERRY_INITIAL_BACKFILL_DM", &mut config.initial_backfill.dm)?;
        limit("FERRY_INITIAL_BACKFILL_THREAD", &mut config.initial_backfill.thread)?;
        limit("FERRY_MISSED_BACKFILL_CHANNEL", &mut config.missed_backfill.channel)?;
        limit("FERRY_MISSED_BACKFILL_DM", &mut config.missed_backfill.dm)?;
        limit("FERRY_MISSED_BACKFILL_THREAD", &mut config.missed_backfill.thread)?;

        if let Some(raw) = lookup("FERRY_INBOX_CAPACITY") {
            config.inbox_capacity = parse_var("FERRY_INBOX_CAPACITY", &raw)?;
        }
        if let Some(name) = lookup("FERRY_SERVER_NAME") {
            config.server_name = name;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inbox_capacity == 0 {
            return Err(BridgeError::Config {
                key: "inbox_capacity".into(),
                value: "0".into(),
            });
        }
        if self.server_name.is_empty() {
            return Err(BridgeError::Config {
                key: "server_name".into(),
                value: String::new(),
            });
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| BridgeError::Config {
        key: name.to_string(),
        value: raw.to_string(),
    })
}
