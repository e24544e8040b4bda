// Copyright (c) 2024 The Botho Foundation

//! Events appended to the sequenced log.
//!
//! A batch on the wire is a JSON array of `{"type": ..., "data": ...}`
//! objects, one per event.

use serde::{Deserialize, Serialize};

use crate::{
    address::DepositAddress, deposit::DepositRecord, error::CustodyError,
    withdrawal::WithdrawalRecord,
};

/// A state change published to every downstream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LogEvent {
    /// A deposit address was registered
    CreateDepositAddress(DepositAddress),

    /// Deposits recorded in one processing cycle
    Deposit(Vec<DepositRecord>),

    /// A withdrawal was requested
    AddWithdraw(WithdrawalRecord),

    /// The AVS signed a withdrawal
    ApproveWithdraw(WithdrawApproval),

    /// Withdrawals settled by one transaction
    TransferWithdraw(WithdrawTransfer),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawApproval {
    pub id: String,
    pub avs_verifying_key: String,
    pub avs_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawTransfer {
    pub withdraws: Vec<String>,
    pub tx_hash: String,
}

impl LogEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LogEvent::CreateDepositAddress(_) => "CreateDepositAddress",
            LogEvent::Deposit(_) => "Deposit",
            LogEvent::AddWithdraw(_) => "AddWithdraw",
            LogEvent::ApproveWithdraw(_) => "ApproveWithdraw",
            LogEvent::TransferWithdraw(_) => "TransferWithdraw",
        }
    }
}

/// Serialize a batch to the exact bytes appended to the log.
pub fn encode_batch(events: &[LogEvent]) -> Result<String, CustodyError> {
    Ok(serde_json::to_string(events)?)
}

/// Decode a batch event by event.
///
/// Fails only when the batch is not a JSON array; an event that does not
/// decode is returned as an `Err` carrying its type and the decode error so
/// consumers can skip it.
pub fn decode_batch(raw: &str) -> Result<Vec<Result<LogEvent, String>>, CustodyError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(raw)?;
    Ok(values
        .into_iter()
        .map(|value| {
            let kind = value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("<untyped>")
                .to_string();
            serde_json::from_value::<LogEvent>(value).map_err(|e| format!("{}: {}", kind, e))
        })
        .collect())
}
