// Copyright (c) 2024 The Botho Foundation

//! Token metadata.

use serde::{Deserialize, Serialize};

/// Metadata for an asset accepted by the custody layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub symbol: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Token contract or mint; absent for the chain's native asset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,

    pub decimals: u8,
}

impl TokenInfo {
    pub fn native(symbol: impl Into<String>, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            name: None,
            contract: None,
            decimals,
        }
    }

    pub fn contract(symbol: impl Into<String>, contract: impl Into<String>, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            name: None,
            contract: Some(contract.into()),
            decimals,
        }
    }

    pub fn is_native(&self) -> bool {
        self.contract.is_none()
    }
}

/// Pick the token a transfer moved: the native asset when no contract is
/// given, otherwise the allowed token with a matching contract.
pub fn resolve_token(
    native: &TokenInfo,
    allowed: &[TokenInfo],
    contract: Option<&str>,
) -> Option<TokenInfo> {
    match contract {
        None => Some(native.clone()),
        Some(contract) => allowed
            .iter()
            .find(|t| t.contract.as_deref() == Some(contract))
            .cloned(),
    }
}
