// Copyright (c) 2024 The Botho Foundation

//! The per-chain adapter seam.
//!
//! Everything chain specific (reading blocks, building and signing sweep and
//! withdrawal transactions) sits behind [`ChainAdapter`]. Workers only see
//! positions, normalized transfers and transaction ids.

use std::collections::HashSet;

use async_trait::async_trait;
use custody_core::{
    deposit::is_positive_amount, AssetClass, AvsSignature, ChainId, CustodyError, DepositRecord,
    TokenInfo, Transfer, WithdrawalBatching, WithdrawalRecord,
};
use serde::{Deserialize, Serialize};

/// One unit of chain history (a block or slot) as fetched from the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUnit {
    pub position: u64,
    pub payload: serde_json::Value,
}

/// A withdrawal paired with the authorization the target chain verifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedWithdrawal {
    pub record: WithdrawalRecord,
    pub signature: AvsSignature,
    /// SHA-256 of the record's authorization message
    pub digest: [u8; 32],
}

impl AuthorizedWithdrawal {
    /// Pair a record with its AVS signature.
    ///
    /// Fails when the signature is missing or not hex.
    pub fn authorize(record: WithdrawalRecord) -> Result<Self, CustodyError> {
        let signature = record.avs_signature.clone().ok_or_else(|| {
            CustodyError::Integrity(format!("withdrawal {} has no AVS signature", record.id))
        })?;
        signature.validate()?;
        let digest = record.authorization_digest();

        Ok(Self {
            record,
            signature,
            digest,
        })
    }
}

/// Chain specific operations used by the workers.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> ChainId;

    /// The chain's native asset.
    fn native_token(&self) -> TokenInfo;

    /// Whether several withdrawals can share one transaction.
    fn withdrawal_batching(&self) -> WithdrawalBatching;

    /// Current finalized head position.
    async fn get_head(&self) -> Result<u64, CustodyError>;

    /// Units with positions in `from..=to`.
    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<RawUnit>, CustodyError>;

    /// Incoming transfers in `unit` to watched addresses, restricted to the
    /// native asset and `allowed_tokens`.
    fn extract_transfers(
        &self,
        unit: &RawUnit,
        watch: &HashSet<String>,
        allowed_tokens: &[TokenInfo],
    ) -> Result<Vec<Transfer>, CustodyError>;

    /// Address of the main vault.
    async fn derive_vault_address(&self) -> Result<String, CustodyError>;

    /// Move the given deposits into the main vault in one transaction.
    async fn submit_sweep(&self, deposits: &[DepositRecord]) -> Result<String, CustodyError>;

    /// Release the given withdrawals in one transaction.
    async fn submit_withdrawals(
        &self,
        withdrawals: &[AuthorizedWithdrawal],
    ) -> Result<String, CustodyError>;

    /// Transfers into the vault of `class` with logical time above
    /// `after_lt`, oldest first.
    async fn fetch_vault_transfers(
        &self,
        class: AssetClass,
        after_lt: u64,
        limit: usize,
    ) -> Result<Vec<Transfer>, CustodyError>;
}

/// Payload of a unit in the gateway's normalized form.
#[derive(Debug, Default, Deserialize)]
struct NormalizedUnit {
    #[serde(default)]
    transfers: Vec<Transfer>,
}

/// Extract transfers from a unit in normalized form
/// (`{"transfers": [Transfer, ...]}`).
pub fn extract_normalized_transfers(
    unit: &RawUnit,
    watch: &HashSet<String>,
    allowed_tokens: &[TokenInfo],
) -> Result<Vec<Transfer>, CustodyError> {
    let normalized: NormalizedUnit = serde_json::from_value(unit.payload.clone()).map_err(|e| {
        CustodyError::Integrity(format!("unit {} is malformed: {}", unit.position, e))
    })?;

    Ok(normalized
        .transfers
        .into_iter()
        .filter(|t| watch.contains(&t.address))
        .filter(|t| is_positive_amount(&t.change))
        .filter(|t| match &t.contract {
            None => true,
            Some(contract) => allowed_tokens
                .iter()
                .any(|token| token.contract.as_deref() == Some(contract.as_str())),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::WithdrawalStatus;
    use serde_json::json;

    fn unit() -> RawUnit {
        RawUnit {
            position: 55,
            payload: json!({"transfers": [
                {"txHash": "T1", "address": "ADDR1", "change": "1000000000"},
                {"txHash": "T2", "address": "ADDR2", "change": "5"},
                {"txHash": "T3", "address": "ADDR1", "change": "-40"},
                {"txHash": "T4", "address": "ADDR1", "change": "7", "mint": "USDC-MINT"},
                {"txHash": "T5", "address": "ADDR1", "change": "9", "mint": "SCAM-MINT"}
            ]}),
        }
    }

    #[test]
    fn test_extract_filters_watch_amount_and_token() {
        let watch: HashSet<String> = ["ADDR1".to_string()].into_iter().collect();
        let allowed = vec![TokenInfo::contract("USDC", "USDC-MINT", 6)];

        let transfers = extract_normalized_transfers(&unit(), &watch, &allowed).unwrap();
        let hashes: Vec<_> = transfers.iter().map(|t| t.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["T1", "T4"]);
    }

    #[test]
    fn test_empty_unit_has_no_transfers() {
        let empty = RawUnit {
            position: 1,
            payload: json!({}),
        };
        let watch: HashSet<String> = ["ADDR1".to_string()].into_iter().collect();
        assert!(extract_normalized_transfers(&empty, &watch, &[])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_authorize_requires_valid_signature() {
        let mut record = WithdrawalRecord {
            id: "W1".to_string(),
            agent: "a1".to_string(),
            signatures: vec![],
            token: TokenInfo::native("TON", 9),
            target_chain: ChainId::Ton,
            amount: 500,
            to_address: "EQ-dest".to_string(),
            status: WithdrawalStatus::Approved,
            avs_signature: None,
            transfer_tx: None,
        };
        assert!(AuthorizedWithdrawal::authorize(record.clone()).is_err());

        record.avs_signature = Some(AvsSignature::new("ab", "zz"));
        assert!(AuthorizedWithdrawal::authorize(record.clone()).is_err());

        record.avs_signature = Some(AvsSignature::new("ab", "cd"));
        let authorized = AuthorizedWithdrawal::authorize(record.clone()).unwrap();
        assert_eq!(authorized.digest, record.authorization_digest());
    }
}
