// Copyright (c) 2024 The Botho Foundation

//! Minimal JSON-RPC 2.0 client over HTTP.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use custody_core::CustodyError;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use tracing::trace;

/// Error object of a JSON-RPC response.
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// JSON-RPC client for one endpoint.
pub struct RpcClient {
    client: Client,
    url: String,
    bearer: Option<String>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CustodyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CustodyError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            bearer: None,
            next_id: AtomicU64::new(1),
        })
    }

    /// Present `token` as a bearer credential on every call.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and decode its result.
    ///
    /// Transport failures and error objects are both transient.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, CustodyError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(method, id, url = %self.url, "RPC call");

        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        }));
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CustodyError::Transient(format!("{} request failed: {}", method, e)))?
            .error_for_status()
            .map_err(|e| CustodyError::Transient(format!("{} returned {}", method, e)))?;

        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| CustodyError::Transient(format!("{} invalid response: {}", method, e)))?;

        if let Some(error) = body.error {
            return Err(CustodyError::Transient(format!(
                "{} failed: {} (code {})",
                method, error.message, error.code
            )));
        }
        body.result
            .ok_or_else(|| CustodyError::Transient(format!("No result in {} response", method)))
    }
}
