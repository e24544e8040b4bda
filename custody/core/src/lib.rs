// Copyright (c) 2024 The Botho Foundation

//! Core types for the custody settlement layer.
//!
//! This crate provides the domain types shared by every custody worker,
//! including:
//!
//! - Chain identifiers and address validation
//! - Deposit addresses, observed transfers and deposit records
//! - Withdrawal records and their forward-only status machine
//! - The tagged events appended to the sequenced log
//! - Scan cursors, worker roles and configuration structures

pub mod address;
pub mod chains;
pub mod config;
pub mod cursor;
pub mod deposit;
pub mod error;
pub mod events;
pub mod roles;
pub mod token;
pub mod withdrawal;

pub use address::{AddressBook, DepositAddress, Owner};
pub use chains::{ChainAddress, ChainId};
pub use config::{
    ChainSettings, CustodyConfig, RestartBackoff, ScanMode, ServiceSettings, WithdrawalBatching,
};
pub use cursor::{AssetClass, Cursor, CursorKey, UnitRange};
pub use deposit::{DepositRecord, DepositedToken, Transfer};
pub use error::{CustodyError, Result};
pub use events::{LogEvent, WithdrawApproval, WithdrawTransfer};
pub use roles::{WorkerEnv, WorkerPhase, WorkerRole};
pub use token::TokenInfo;
pub use withdrawal::{AvsSignature, WithdrawalRecord, WithdrawalStatus};
