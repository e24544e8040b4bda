// Copyright (c) 2024 The Botho Foundation

//! Observed transfers and the deposit records built from them.

use serde::{Deserialize, Serialize};

use crate::{address::DepositAddress, chains::ChainId, token::TokenInfo};

/// A transfer into a watched address, as reported by a chain adapter.
///
/// Lives only for one processing cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub tx_hash: String,

    /// Receiving address
    pub address: String,

    /// Balance change in base units, as a decimal integer string
    pub change: String,

    /// Token mint or contract; absent for native transfers
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "mint")]
    pub contract: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,

    /// Logical time for chains that order by account sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<u64>,
}

impl Transfer {
    /// Whether `change` is a strictly positive base-unit amount.
    pub fn is_incoming(&self) -> bool {
        is_positive_amount(&self.change)
    }
}

/// Returns true for a decimal integer string greater than zero.
pub fn is_positive_amount(amount: &str) -> bool {
    !amount.is_empty()
        && amount.bytes().all(|b| b.is_ascii_digit())
        && amount.bytes().any(|b| b != b'0')
}

/// Token and amount credited by a deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositedToken {
    pub token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,

    /// Base units as a decimal integer string
    pub amount: String,

    pub decimals: u8,
}

/// A deposit credited to a user.
///
/// `tx_hash` is the idempotency key: one record per source transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRecord {
    pub chain: ChainId,

    pub tx_hash: String,

    /// Block or slot the transfer was observed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<u64>,

    pub agent: String,
    pub account: u32,
    pub user: u64,

    /// Deposit address the funds arrived at
    pub address: String,

    pub deposit: DepositedToken,

    /// Chain specific details (memo, logical time)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,

    pub confirmed: bool,

    /// Funds have been moved into the main vault
    pub transferred: bool,

    /// Sweep transaction id once transferred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_tx: Option<String>,
}

impl DepositRecord {
    /// Build a confirmed, not yet swept record for a matched transfer.
    pub fn from_transfer(
        chain: ChainId,
        owner: &DepositAddress,
        transfer: &Transfer,
        token: &TokenInfo,
        block: Option<u64>,
    ) -> Self {
        let mut extra = serde_json::Map::new();
        if let Some(memo) = &transfer.memo {
            extra.insert("memo".into(), memo.clone().into());
        }
        if let Some(lt) = transfer.lt {
            extra.insert("lt".into(), lt.into());
        }

        Self {
            chain,
            tx_hash: transfer.tx_hash.clone(),
            block,
            agent: owner.agent.clone(),
            account: owner.account,
            user: owner.user,
            address: owner.address.clone(),
            deposit: DepositedToken {
                token: token.symbol.clone(),
                contract: token.contract.clone(),
                amount: transfer.change.clone(),
                decimals: token.decimals,
            },
            extra: (!extra.is_empty()).then_some(serde_json::Value::Object(extra)),
            confirmed: true,
            transferred: false,
            transfer_tx: None,
        }
    }

    pub fn is_native(&self) -> bool {
        self.deposit.contract.is_none()
    }

    /// Logical time recorded for the deposit, if the chain has one.
    pub fn logical_time(&self) -> Option<u64> {
        self.extra.as_ref()?.get("lt")?.as_u64()
    }

    pub fn mark_transferred(&mut self, sweep_tx: impl Into<String>) {
        self.transferred = true;
        self.transfer_tx = Some(sweep_tx.into());
    }
}
