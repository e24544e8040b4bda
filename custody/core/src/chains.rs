// Copyright (c) 2024 The Botho Foundation

//! Chain identifiers and address validation.

use serde::{Deserialize, Serialize};

/// Chains the custody layer settles on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChainId {
    /// Solana mainnet or devnet
    #[serde(rename = "SOL")]
    Solana,
    /// The Open Network
    #[serde(rename = "TON")]
    Ton,
}

impl ChainId {
    /// Wire identifier used in documents and log events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Solana => "SOL",
            ChainId::Ton => "TON",
        }
    }

    pub fn all() -> [ChainId; 2] {
        [ChainId::Solana, ChainId::Ton]
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sol" | "solana" => Ok(ChainId::Solana),
            "ton" => Ok(ChainId::Ton),
            _ => Err(format!("Unknown chain: {}", s)),
        }
    }
}

/// A chain-specific address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAddress {
    pub chain: ChainId,
    pub address: String,
}

impl ChainAddress {
    pub fn new(chain: ChainId, address: impl Into<String>) -> Self {
        Self {
            chain,
            address: address.into(),
        }
    }

    /// Validate the address format for the chain.
    pub fn validate(&self) -> Result<(), String> {
        if self.address.is_empty() {
            return Err(format!("{} address cannot be empty", self.chain));
        }
        match self.chain {
            ChainId::Solana => {
                // Base58-encoded 32-byte public keys
                if self.address.len() < 32 || self.address.len() > 44 {
                    return Err(format!(
                        "Solana address must be 32-44 characters, got {}",
                        self.address.len()
                    ));
                }
                if !self.address.chars().all(is_base58_char) {
                    return Err("Solana address must be valid base58".to_string());
                }
                Ok(())
            }
            ChainId::Ton => {
                // Raw form is "<workchain>:<64 hex chars>", user-friendly form is
                // 48 characters of url-safe base64.
                if let Some((workchain, hash)) = self.address.split_once(':') {
                    if workchain.parse::<i32>().is_err() {
                        return Err(format!("Invalid TON workchain: {}", workchain));
                    }
                    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err("TON raw address must carry 64 hex characters".to_string());
                    }
                    return Ok(());
                }
                if self.address.len() != 48 {
                    return Err(format!(
                        "TON address must be 48 characters, got {}",
                        self.address.len()
                    ));
                }
                if !self
                    .address
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '/'))
                {
                    return Err("TON address must be valid base64".to_string());
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain, self.address)
    }
}

fn is_base58_char(c: char) -> bool {
    c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
}
