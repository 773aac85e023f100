//! Engine and process configuration

use std::path::Path;
use std::time::Duration;

use sbc_infra_common::LoggingConfig;
use sbc_media_core::RelayConfig;
use sbc_media_core::config::duration_secs;
use serde::{Deserialize, Serialize};

use crate::transaction::TransactionTimers;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wait for a first response from one failover candidate
    #[serde(with = "duration_secs")]
    pub attempt_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub final_response_timeout: Duration,
    /// Retries after the first attempt
    pub max_failover: usize,
    /// Idle time after which a dialog record leaves the cache
    #[serde(with = "duration_secs")]
    pub dialog_lifetime: Duration,
    /// How long a 2xx is kept for routing its ACK
    #[serde(with = "duration_secs")]
    pub retransmit_lifetime: Duration,
    pub user_agent: Option<String>,
    /// Stored dialogs younger than this are reloaded at startup
    #[serde(with = "duration_secs")]
    pub store_restore_window: Duration,
    /// Period of the dialog and retransmission cache sweep
    #[serde(with = "duration_secs")]
    pub housekeeping_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(8),
            final_response_timeout: Duration::from_secs(180),
            max_failover: 3,
            dialog_lifetime: Duration::from_secs(3600),
            retransmit_lifetime: Duration::from_secs(32),
            user_agent: None,
            store_restore_window: Duration::from_secs(60),
            housekeeping_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn timers(&self) -> TransactionTimers {
        TransactionTimers {
            attempt_timeout: self.attempt_timeout,
            final_response_timeout: self.final_response_timeout,
            max_failover: self.max_failover,
        }
    }
}

/// Whole configuration file of the border controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SbcConfig {
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub engine: EngineConfig,
}

impl SbcConfig {
    pub fn load(path: impl AsRef<Path>) -> sbc_infra_common::Result<Self> {
        sbc_infra_common::load_toml_file(path)
    }

    pub fn parse(text: &str) -> sbc_infra_common::Result<Self> {
        sbc_infra_common::parse_toml(text)
    }
}
