use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core_types::{AccountId, Role};
use crate::ledger::LimitPolicy;
use crate::transfer::ConsumerConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub consumer: ConsumerSection,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub policy: LimitPolicy,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Accounts opened at start-up by the demo runner
    #[serde(default)]
    pub accounts: Vec<SeedAccount>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueConfig {
    pub partitions: usize,
    /// Intent journal; the queue is volatile when unset
    #[serde(default)]
    pub journal_path: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            journal_path: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConsumerSection {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
            call_timeout_ms: 2_000,
        }
    }
}

impl ConsumerSection {
    pub fn to_consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_attempts: self.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ValidatorConfig {
    pub call_timeout_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 2_000,
        }
    }
}

impl ValidatorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub stagger_interval_secs: u64,
    /// Schedule journal; schedules are volatile when unset
    #[serde(default)]
    pub journal_path: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stagger_interval_secs: 20,
            journal_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn stagger_interval(&self) -> Duration {
        Duration::from_secs(self.stagger_interval_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SeedAccount {
    pub id: AccountId,
    pub account_number: String,
    pub balance: Decimal,
    pub role: Role,
}

impl AppConfig {
    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> Result<Self> {
        Self::from_file(format!("config/{}.yaml", env))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
