// Copyright (c) 2024 The Botho Foundation

//! Chain adapter backed by a chain gateway speaking JSON-RPC.
//!
//! The gateway owns the node connection and the signing keys; it returns
//! units in normalized form and builds sweep and withdrawal transactions.

use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use custody_core::{
    AssetClass, ChainId, ChainSettings, CustodyError, DepositRecord, TokenInfo, Transfer,
    WithdrawalBatching,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    adapter::{extract_normalized_transfers, AuthorizedWithdrawal, ChainAdapter, RawUnit},
    rpc::RpcClient,
};

const RPC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResult {
    tx_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SweepInput<'a> {
    tx_hash: &'a str,
    address: &'a str,
    amount: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    contract: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WithdrawalInput<'a> {
    id: &'a str,
    token: &'a TokenInfo,
    amount: u64,
    to_address: &'a str,
    verifying_key: &'a str,
    signature: &'a str,
    digest: String,
}

/// Adapter for one chain served by a gateway.
pub struct GatewayAdapter {
    chain: ChainId,
    rpc: RpcClient,
    vault_address: String,
    batching: WithdrawalBatching,
}

impl GatewayAdapter {
    /// Build the adapter from chain settings.
    ///
    /// The credentials file must exist and be non-empty.
    pub fn from_settings(chain: ChainId, settings: &ChainSettings) -> Result<Self, CustodyError> {
        let credential = std::fs::read_to_string(&settings.credentials_file).map_err(|e| {
            CustodyError::Config(format!(
                "Failed to read credentials {}: {}",
                settings.credentials_file, e
            ))
        })?;
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(CustodyError::Config(format!(
                "Credentials file {} is empty",
                settings.credentials_file
            )));
        }

        let rpc = RpcClient::new(&settings.gateway_url, RPC_TIMEOUT)?.with_bearer(credential);
        info!(%chain, gateway = %settings.gateway_url, "Chain gateway configured");

        Ok(Self {
            chain,
            rpc,
            vault_address: settings.vault_address.clone(),
            batching: settings.withdrawal_batching,
        })
    }

    fn submission_error(&self, e: CustodyError) -> CustodyError {
        CustodyError::Submission(format!("{}: {}", self.chain, e))
    }
}

#[async_trait]
impl ChainAdapter for GatewayAdapter {
    fn chain(&self) -> ChainId {
        self.chain
    }

    fn native_token(&self) -> TokenInfo {
        match self.chain {
            ChainId::Solana => TokenInfo::native("SOL", 9),
            ChainId::Ton => TokenInfo::native("TON", 9),
        }
    }

    fn withdrawal_batching(&self) -> WithdrawalBatching {
        self.batching
    }

    async fn get_head(&self) -> Result<u64, CustodyError> {
        self.rpc.call("getHead", json!({})).await
    }

    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<RawUnit>, CustodyError> {
        self.rpc
            .call("getUnits", json!({ "from": from, "to": to }))
            .await
    }

    fn extract_transfers(
        &self,
        unit: &RawUnit,
        watch: &HashSet<String>,
        allowed_tokens: &[TokenInfo],
    ) -> Result<Vec<Transfer>, CustodyError> {
        extract_normalized_transfers(unit, watch, allowed_tokens)
    }

    async fn derive_vault_address(&self) -> Result<String, CustodyError> {
        self.rpc
            .call("getVaultAddress", json!({ "vault": self.vault_address }))
            .await
    }

    async fn submit_sweep(&self, deposits: &[DepositRecord]) -> Result<String, CustodyError> {
        let inputs: Vec<SweepInput<'_>> = deposits
            .iter()
            .map(|d| SweepInput {
                tx_hash: &d.tx_hash,
                address: &d.address,
                amount: &d.deposit.amount,
                contract: d.deposit.contract.as_deref(),
            })
            .collect();

        let result: SubmitResult = self
            .rpc
            .call(
                "submitSweep",
                json!({ "vault": self.vault_address, "deposits": inputs }),
            )
            .await
            .map_err(|e| self.submission_error(e))?;
        Ok(result.tx_id)
    }

    async fn submit_withdrawals(
        &self,
        withdrawals: &[AuthorizedWithdrawal],
    ) -> Result<String, CustodyError> {
        let inputs: Vec<WithdrawalInput<'_>> = withdrawals
            .iter()
            .map(|w| WithdrawalInput {
                id: &w.record.id,
                token: &w.record.token,
                amount: w.record.amount,
                to_address: &w.record.to_address,
                verifying_key: &w.signature.verifying_key,
                signature: &w.signature.signature,
                digest: hex::encode(w.digest),
            })
            .collect();

        let result: SubmitResult = self
            .rpc
            .call(
                "submitWithdrawals",
                json!({ "vault": self.vault_address, "withdrawals": inputs }),
            )
            .await
            .map_err(|e| self.submission_error(e))?;
        Ok(result.tx_id)
    }

    async fn fetch_vault_transfers(
        &self,
        class: AssetClass,
        after_lt: u64,
        limit: usize,
    ) -> Result<Vec<Transfer>, CustodyError> {
        self.rpc
            .call(
                "getVaultTransfers",
                json!({
                    "vault": self.vault_address,
                    "assetClass": class.as_str(),
                    "afterLt": after_lt,
                    "limit": limit
                }),
            )
            .await
    }
}
