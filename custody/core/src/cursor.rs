// Copyright (c) 2024 The Botho Foundation

//! Scan cursors and the unit ranges derived from them.

use serde::{Deserialize, Serialize};

use crate::chains::ChainId;

/// Scope used for read indexes into the sequenced log.
pub const LOG_SCOPE: &str = "LOG";

/// What a cursor tracks progress over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    /// Block heights or slots
    Blocks,
    /// Logical time of native transfers into the vault
    Native,
    /// Logical time of token transfers into the vault
    Token,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Blocks => "blocks",
            AssetClass::Native => "native",
            AssetClass::Token => "token",
        }
    }
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one cursor: `(chain, assetClass)`, or `("LOG", listName)` for
/// a log reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorKey {
    pub chain: String,
    pub asset_class: String,
}

impl CursorKey {
    pub fn chain(chain: ChainId, class: AssetClass) -> Self {
        Self {
            chain: chain.as_str().to_string(),
            asset_class: class.as_str().to_string(),
        }
    }

    pub fn log(list: &str) -> Self {
        Self {
            chain: LOG_SCOPE.to_string(),
            asset_class: list.to_string(),
        }
    }
}

impl std::fmt::Display for CursorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.chain, self.asset_class)
    }
}

/// Last committed position for a key. Never moves backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    #[serde(flatten)]
    pub key: CursorKey,
    pub position: u64,
}

impl Cursor {
    pub fn new(key: CursorKey, position: u64) -> Self {
        Self { key, position }
    }

    /// Move to `position` if it is ahead. Returns whether the cursor moved.
    pub fn advance(&mut self, position: u64) -> bool {
        if position > self.position {
            self.position = position;
            true
        } else {
            false
        }
    }
}

/// The half-open range `(last, head]` of units still to be enqueued,
/// walked one unit at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitRange {
    /// Last unit already handed out
    pub after: u64,
    /// Newest unit to hand out
    pub through: u64,
}

impl UnitRange {
    /// `None` when the head has not moved past `last`.
    pub fn after(last: u64, head: u64) -> Option<Self> {
        (head > last).then_some(Self {
            after: last,
            through: head,
        })
    }

    pub fn len(&self) -> u64 {
        self.through - self.after
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn units(&self) -> impl Iterator<Item = u64> {
        (self.after + 1)..=self.through
    }
}
