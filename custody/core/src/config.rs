// Copyright (c) 2024 The Botho Foundation

//! Custody service configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{chains::ChainId, error::CustodyError};

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyConfig {
    /// Settings shared by every worker
    pub service: ServiceSettings,

    /// Solana connection, if this deployment settles on Solana
    #[serde(default)]
    pub sol: Option<ChainSettings>,

    /// TON connection, if this deployment settles on TON
    #[serde(default)]
    pub ton: Option<ChainSettings>,
}

/// Settings shared by every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Path to the SQLite database shared by all workers
    pub db_path: String,

    /// Name of the sequenced log list events are appended to
    #[serde(default = "default_log_name")]
    pub log_name: String,

    /// Prefix for per-chain queue names
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// JSON-RPC endpoint serving token metadata
    pub token_rpc_url: String,

    /// Consecutive failed cycles before a worker logs at error level
    #[serde(default = "default_alert_after_failures")]
    pub alert_after_failures: u32,

    /// Delay policy between worker restarts
    #[serde(default)]
    pub backoff: RestartBackoff,

    /// How long a popped queue item stays claimed before redelivery
    #[serde(default = "default_visibility_timeout_ms")]
    pub queue_visibility_timeout_ms: u64,
}

fn default_log_name() -> String {
    "custody-events".to_string()
}

fn default_queue_prefix() -> String {
    "custody-service".to_string()
}

fn default_alert_after_failures() -> u32 {
    10
}

fn default_visibility_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

/// Connection and pacing for one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Chain gateway JSON-RPC URL
    pub gateway_url: String,

    /// Main vault contract or program address
    pub vault_address: String,

    /// File holding the bearer credential presented to the gateway
    pub credentials_file: String,

    /// Head polling interval
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Withdrawal polling interval
    #[serde(default = "default_withdraw_interval_ms")]
    pub withdraw_interval_ms: u64,

    /// How often unswept deposits are retried
    #[serde(default = "default_unswept_interval_ms")]
    pub unswept_interval_ms: u64,

    #[serde(default)]
    pub withdrawal_batching: WithdrawalBatching,

    #[serde(default)]
    pub scan_mode: ScanMode,

    /// Max transfers fetched per logical-time poll
    #[serde(default = "default_detect_limit")]
    pub detect_limit: usize,
}

fn default_scan_interval_ms() -> u64 {
    1_000
}

fn default_withdraw_interval_ms() -> u64 {
    5_000
}

fn default_unswept_interval_ms() -> u64 {
    60_000
}

fn default_detect_limit() -> usize {
    100
}

impl ChainSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn withdraw_interval(&self) -> Duration {
        Duration::from_millis(self.withdraw_interval_ms)
    }

    pub fn unswept_interval(&self) -> Duration {
        Duration::from_millis(self.unswept_interval_ms)
    }
}

/// How approved withdrawals are submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalBatching {
    /// One transaction per token group per poll cycle
    #[default]
    Batched,
    /// One transaction per withdrawal
    PerRecord,
}

/// How deposits are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Walk block heights through the durable queue
    #[default]
    Blocks,
    /// Poll vault transfers by logical time
    LogicalTime,
}

/// Delay before restarting a worker that exited unexpectedly.
///
/// Restarts are never capped; the policy only spaces them out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RestartBackoff {
    /// Restart at once
    #[default]
    Immediate,
    /// Wait the same delay before every restart
    Fixed { delay_ms: u64 },
    /// Double the delay per consecutive restart, up to `max_ms`
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl RestartBackoff {
    /// Delay before restart number `restarts` (1 for the first restart).
    pub fn delay(&self, restarts: u32) -> Duration {
        match *self {
            RestartBackoff::Immediate => Duration::ZERO,
            RestartBackoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            RestartBackoff::Exponential { initial_ms, max_ms } => {
                let shift = restarts.saturating_sub(1).min(32);
                let delay = initial_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(max_ms))
            }
        }
    }
}

impl CustodyConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, CustodyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CustodyError::Config(format!("Failed to read config: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, CustodyError> {
        toml::from_str(content)
            .map_err(|e| CustodyError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn chain(&self, chain: ChainId) -> Option<&ChainSettings> {
        match chain {
            ChainId::Solana => self.sol.as_ref(),
            ChainId::Ton => self.ton.as_ref(),
        }
    }

    /// Chains with a configured connection.
    pub fn configured_chains(&self) -> Vec<ChainId> {
        ChainId::all()
            .into_iter()
            .filter(|c| self.chain(*c).is_some())
            .collect()
    }

    /// Check the settings a worker of this chain cannot run without.
    pub fn validate_chain(&self, chain: ChainId) -> Result<&ChainSettings, CustodyError> {
        self.validate_service()?;
        let settings = self
            .chain(chain)
            .ok_or_else(|| CustodyError::Config(format!("No configuration for chain {}", chain)))?;

        for (field, value) in [
            ("gateway_url", &settings.gateway_url),
            ("vault_address", &settings.vault_address),
            ("credentials_file", &settings.credentials_file),
        ] {
            if value.trim().is_empty() {
                return Err(CustodyError::Config(format!(
                    "{}.{} must be set",
                    chain.as_str().to_lowercase(),
                    field
                )));
            }
        }
        if settings.scan_interval_ms == 0 || settings.withdraw_interval_ms == 0 {
            return Err(CustodyError::Config(format!(
                "{} polling intervals must be positive",
                chain
            )));
        }
        Ok(settings)
    }

    pub fn validate_service(&self) -> Result<(), CustodyError> {
        if self.service.db_path.trim().is_empty() {
            return Err(CustodyError::Config("service.db_path must be set".into()));
        }
        if self.service.log_name.trim().is_empty() {
            return Err(CustodyError::Config("service.log_name must be set".into()));
        }
        Ok(())
    }
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            service: ServiceSettings {
                db_path: "custody.db".to_string(),
                log_name: default_log_name(),
                queue_prefix: default_queue_prefix(),
                token_rpc_url: "http://localhost:3000/rpc".to_string(),
                alert_after_failures: default_alert_after_failures(),
                backoff: RestartBackoff::default(),
                queue_visibility_timeout_ms: default_visibility_timeout_ms(),
            },
            sol: None,
            ton: None,
        }
    }
}
