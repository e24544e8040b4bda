// Copyright (c) 2024 The Botho Foundation

//! Token metadata lookup.

use std::time::Duration;

use async_trait::async_trait;
use custody_core::{ChainId, CustodyError, TokenInfo};

use crate::rpc::RpcClient;

/// Source of the tokens accepted on each chain.
#[async_trait]
pub trait TokenRegistry: Send + Sync {
    async fn available_tokens(&self, chain: ChainId) -> Result<Vec<TokenInfo>, CustodyError>;
}

/// Registry served over JSON-RPC (`getAvailableTokens`).
pub struct RpcTokenRegistry {
    rpc: RpcClient,
}

impl RpcTokenRegistry {
    pub fn new(url: &str) -> Result<Self, CustodyError> {
        Ok(Self {
            rpc: RpcClient::new(url, Duration::from_secs(30))?,
        })
    }
}

#[async_trait]
impl TokenRegistry for RpcTokenRegistry {
    async fn available_tokens(&self, chain: ChainId) -> Result<Vec<TokenInfo>, CustodyError> {
        self.rpc
            .call(
                "getAvailableTokens",
                serde_json::json!({ "chain": chain.as_str() }),
            )
            .await
    }
}
