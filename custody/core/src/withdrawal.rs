// Copyright (c) 2024 The Botho Foundation

//! Withdrawal records and their state machine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{chains::ChainId, error::CustodyError, token::TokenInfo};

/// The status of a withdrawal.
///
/// Transitions only move forward:
/// `initialized -> approved -> in-progress -> transferred`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WithdrawalStatus {
    /// Requested, waiting for the threshold signature
    Initialized,

    /// Signed by the AVS, ready to execute
    Approved,

    /// Submission under way
    InProgress,

    /// Funds released on the target chain
    Transferred,
}

impl WithdrawalStatus {
    fn rank(&self) -> u8 {
        match self {
            WithdrawalStatus::Initialized => 0,
            WithdrawalStatus::Approved => 1,
            WithdrawalStatus::InProgress => 2,
            WithdrawalStatus::Transferred => 3,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawalStatus::Transferred)
    }

    /// Get the next status in the flow.
    pub fn next(&self) -> Option<WithdrawalStatus> {
        match self {
            WithdrawalStatus::Initialized => Some(WithdrawalStatus::Approved),
            WithdrawalStatus::Approved => Some(WithdrawalStatus::InProgress),
            WithdrawalStatus::InProgress => Some(WithdrawalStatus::Transferred),
            WithdrawalStatus::Transferred => None,
        }
    }

    /// Whether moving to `target` keeps the status moving forward.
    pub fn can_advance_to(&self, target: WithdrawalStatus) -> bool {
        target.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Initialized => "initialized",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::InProgress => "in-progress",
            WithdrawalStatus::Transferred => "transferred",
        }
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(WithdrawalStatus::Initialized),
            "approved" => Ok(WithdrawalStatus::Approved),
            "in-progress" => Ok(WithdrawalStatus::InProgress),
            "transferred" => Ok(WithdrawalStatus::Transferred),
            _ => Err(format!("Unknown withdrawal status: {}", s)),
        }
    }
}

/// Threshold signature authorizing a withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvsSignature {
    /// Hex-encoded aggregate verifying key
    pub verifying_key: String,

    /// Hex-encoded signature over the authorization message
    pub signature: String,

    /// Operators that did not take part in signing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_signers: Vec<String>,
}

impl AvsSignature {
    pub fn new(verifying_key: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            verifying_key: verifying_key.into(),
            signature: signature.into(),
            non_signers: Vec::new(),
        }
    }

    /// Check that key and signature are non-empty hex blobs.
    pub fn validate(&self) -> Result<(), CustodyError> {
        for (field, value) in [
            ("verifyingKey", &self.verifying_key),
            ("signature", &self.signature),
        ] {
            let raw = value.strip_prefix("0x").unwrap_or(value);
            if raw.is_empty() {
                return Err(CustodyError::Integrity(format!("{} is empty", field)));
            }
            hex::decode(raw)
                .map_err(|e| CustodyError::Integrity(format!("{} is not hex: {}", field, e)))?;
        }
        Ok(())
    }
}

/// A request to release funds on a target chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRecord {
    /// Globally unique id, the idempotency key for settlement
    pub id: String,

    pub agent: String,

    /// User signatures collected for the request
    #[serde(default)]
    pub signatures: Vec<String>,

    pub token: TokenInfo,

    pub target_chain: ChainId,

    /// Base units
    pub amount: u64,

    pub to_address: String,

    pub status: WithdrawalStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avs_signature: Option<AvsSignature>,

    /// Settlement transaction; its presence marks completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_tx: Option<String>,
}

impl WithdrawalRecord {
    /// Approved, unsettled and bound for `chain`.
    pub fn is_executable(&self, chain: ChainId) -> bool {
        self.status == WithdrawalStatus::Approved
            && self.transfer_tx.is_none()
            && self.target_chain == chain
    }

    pub fn is_native(&self) -> bool {
        self.token.is_native()
    }

    /// Canonical message the AVS signs:
    /// `id|targetChain|symbol|contract|amount|toAddress`.
    pub fn authorization_message(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.id,
            self.target_chain,
            self.token.symbol,
            self.token.contract.as_deref().unwrap_or(""),
            self.amount,
            self.to_address
        )
    }

    /// SHA-256 of the authorization message.
    pub fn authorization_digest(&self) -> [u8; 32] {
        Sha256::digest(self.authorization_message().as_bytes()).into()
    }

    /// Attach the threshold signature and advance to `approved`.
    pub fn approve(&mut self, signature: AvsSignature) -> Result<(), CustodyError> {
        self.advance(WithdrawalStatus::Approved)?;
        self.avs_signature = Some(signature);
        Ok(())
    }

    /// Record the settlement transaction and advance to `transferred`.
    pub fn mark_transferred(&mut self, tx: impl Into<String>) -> Result<(), CustodyError> {
        if self.transfer_tx.is_some() {
            return Err(CustodyError::Integrity(format!(
                "withdrawal {} already settled",
                self.id
            )));
        }
        self.advance(WithdrawalStatus::Transferred)?;
        self.transfer_tx = Some(tx.into());
        Ok(())
    }

    fn advance(&mut self, target: WithdrawalStatus) -> Result<(), CustodyError> {
        if !self.status.can_advance_to(target) {
            return Err(CustodyError::Integrity(format!(
                "withdrawal {} cannot move from {} to {}",
                self.id, self.status, target
            )));
        }
        self.status = target;
        Ok(())
    }
}
