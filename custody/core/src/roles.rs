// Copyright (c) 2024 The Botho Foundation

//! Worker roles and the environment a worker process is started with.

use serde::{Deserialize, Serialize};

use crate::{chains::ChainId, config::ScanMode, error::CustodyError};

/// Exit status of a worker that stopped because it received SIGTERM
/// (128 + 15).
pub const GRACEFUL_EXIT_CODE: i32 = 143;

/// The job a worker process performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerRole {
    /// Polls the chain head and enqueues new units
    BlockFetcher,
    /// Consumes units, records and sweeps deposits
    BlockProcessor,
    /// Polls the vault by logical time for deposits
    DepositDetector,
    /// Executes approved withdrawals
    WithdrawExecutor,
    /// Projects the sequenced log into the store
    LogObserver,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::BlockFetcher => "block-fetcher",
            WorkerRole::BlockProcessor => "block-processor",
            WorkerRole::DepositDetector => "deposit-detector",
            WorkerRole::WithdrawExecutor => "withdraw-executor",
            WorkerRole::LogObserver => "log-observer",
        }
    }

    /// Whether the role works on a single chain.
    pub fn is_chain_bound(&self) -> bool {
        !matches!(self, WorkerRole::LogObserver)
    }

    /// Roles needed to settle one chain scanned in `mode`.
    pub fn for_scan_mode(mode: ScanMode) -> Vec<WorkerRole> {
        match mode {
            ScanMode::Blocks => vec![
                WorkerRole::BlockFetcher,
                WorkerRole::BlockProcessor,
                WorkerRole::WithdrawExecutor,
            ],
            ScanMode::LogicalTime => {
                vec![WorkerRole::DepositDetector, WorkerRole::WithdrawExecutor]
            }
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block-fetcher" => Ok(WorkerRole::BlockFetcher),
            "block-processor" => Ok(WorkerRole::BlockProcessor),
            "deposit-detector" => Ok(WorkerRole::DepositDetector),
            "withdraw-executor" => Ok(WorkerRole::WithdrawExecutor),
            "log-observer" => Ok(WorkerRole::LogObserver),
            _ => Err(format!("Unknown worker role: {}", s)),
        }
    }
}

/// Where a worker is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Fetching,
    Processing,
    Persisting,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerPhase::Idle => write!(f, "idle"),
            WorkerPhase::Fetching => write!(f, "fetching"),
            WorkerPhase::Processing => write!(f, "processing"),
            WorkerPhase::Persisting => write!(f, "persisting"),
        }
    }
}

/// Identity handed to a worker process by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub id: u32,
    pub role: WorkerRole,
    pub chain: Option<ChainId>,
}

impl WorkerEnv {
    pub const ID_VAR: &'static str = "CUSTODY_WORKER_ID";
    pub const ROLE_VAR: &'static str = "CUSTODY_WORKER_ROLE";
    pub const CHAIN_VAR: &'static str = "CUSTODY_WORKER_CHAIN";

    /// Read the worker identity from the process environment.
    pub fn from_env() -> Result<Self, CustodyError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CustodyError> {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| CustodyError::Config(format!("{} is not set", name)))
        };

        let id = required(Self::ID_VAR)?
            .parse::<u32>()
            .map_err(|e| CustodyError::Config(format!("{}: {}", Self::ID_VAR, e)))?;
        let role = required(Self::ROLE_VAR)?
            .parse::<WorkerRole>()
            .map_err(CustodyError::Config)?;
        let chain = match lookup(Self::CHAIN_VAR).filter(|v| !v.is_empty()) {
            Some(chain) => Some(chain.parse::<ChainId>().map_err(CustodyError::Config)?),
            None => None,
        };

        if role.is_chain_bound() && chain.is_none() {
            return Err(CustodyError::Config(format!(
                "{} requires {}",
                role,
                Self::CHAIN_VAR
            )));
        }

        Ok(Self { id, role, chain })
    }

    /// Variables to set on the spawned process.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (Self::ID_VAR, self.id.to_string()),
            (Self::ROLE_VAR, self.role.to_string()),
        ];
        if let Some(chain) = self.chain {
            vars.push((Self::CHAIN_VAR, chain.to_string()));
        }
        vars
    }
}

impl std::fmt::Display for WorkerEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.chain {
            Some(chain) => write!(f, "{}#{}@{}", self.role, self.id, chain),
            None => write!(f, "{}#{}", self.role, self.id),
        }
    }
}
