// Copyright (c) 2024 The Botho Foundation

//! Deposit addresses and the per-cycle address book used to attribute
//! observed transfers to their owners.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chains::ChainId;

/// A chain address assigned to a (agent, account, user) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositAddress {
    /// Agent that owns the account
    pub agent: String,

    /// Account index within the agent
    pub account: u32,

    /// Chain the address lives on
    pub chain: ChainId,

    /// User index within the account
    pub user: u64,

    /// On-chain address funds are sent to
    pub address: String,

    /// Memo distinguishing users sharing one vault address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,

    /// Inactive addresses are never watched
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// The identity a deposit is credited to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub agent: String,
    pub account: u32,
    pub user: u64,
}

impl DepositAddress {
    pub fn owner(&self) -> Owner {
        Owner {
            agent: self.agent.clone(),
            account: self.account,
            user: self.user,
        }
    }
}

/// Active deposit addresses of one chain, indexed for lookup.
///
/// Built fresh at the start of every processing cycle so address changes
/// take effect on the next cycle.
#[derive(Debug, Default, Clone)]
pub struct AddressBook {
    by_address: HashMap<String, Vec<DepositAddress>>,
    by_memo: HashMap<String, DepositAddress>,
}

impl AddressBook {
    pub fn new(addresses: impl IntoIterator<Item = DepositAddress>) -> Self {
        let mut book = Self::default();
        for entry in addresses.into_iter().filter(|a| a.active) {
            if let Some(memo) = &entry.memo {
                book.by_memo.insert(memo.clone(), entry.clone());
            }
            book.by_address
                .entry(entry.address.clone())
                .or_default()
                .push(entry);
        }
        book
    }

    /// Addresses whose incoming transfers should be extracted.
    pub fn watch_list(&self) -> Vec<String> {
        self.by_address.keys().cloned().collect()
    }

    pub fn is_watched(&self, address: &str) -> bool {
        self.by_address.contains_key(address)
    }

    /// Find the owner of a transfer to `address`.
    ///
    /// Among the entries at the address, the one carrying the transfer's
    /// memo wins; otherwise the entry without a memo. Addresses outside the
    /// book never resolve.
    pub fn resolve(&self, address: &str, memo: Option<&str>) -> Option<&DepositAddress> {
        let entries = self.by_address.get(address)?;
        if let Some(memo) = memo {
            if let Some(entry) = entries.iter().find(|a| a.memo.as_deref() == Some(memo)) {
                return Some(entry);
            }
        }
        entries.iter().find(|a| a.memo.is_none())
    }

    /// Find the owner of a transfer into the shared vault.
    ///
    /// The vault may be reported in another address form than the stored
    /// one, so an address missing from the book falls back to the memo.
    pub fn resolve_vault(&self, address: &str, memo: Option<&str>) -> Option<&DepositAddress> {
        if self.is_watched(address) {
            return self.resolve(address, memo);
        }
        memo.and_then(|memo| self.by_memo.get(memo))
    }

    pub fn len(&self) -> usize {
        self.by_address.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(user: u64, address: &str, memo: Option<&str>, active: bool) -> DepositAddress {
        DepositAddress {
            agent: "agent-1".to_string(),
            account: 0,
            chain: ChainId::Solana,
            user,
            address: address.to_string(),
            memo: memo.map(str::to_string),
            active,
        }
    }

    #[test]
    fn test_inactive_addresses_are_not_watched() {
        let book = AddressBook::new(vec![
            addr(1, "ADDR1", None, true),
            addr(2, "ADDR2", None, false),
        ]);
        assert!(book.is_watched("ADDR1"));
        assert!(!book.is_watched("ADDR2"));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_resolve_by_address() {
        let book = AddressBook::new(vec![addr(7, "ADDR1", None, true)]);
        let owner = book.resolve("ADDR1", None).unwrap().owner();
        assert_eq!(owner.user, 7);
        assert!(book.resolve("ADDR9", None).is_none());
    }

    #[test]
    fn test_resolve_by_memo_on_shared_vault() {
        let book = AddressBook::new(vec![
            addr(1, "VAULT", Some("1001"), true),
            addr(2, "VAULT", Some("1002"), true),
        ]);
        assert_eq!(book.resolve("VAULT", Some("1002")).unwrap().user, 2);
        // Unknown memo and missing memo are both unattributable
        assert!(book.resolve("VAULT", Some("9999")).is_none());
        assert!(book.resolve("VAULT", None).is_none());
        // Other address forms never resolve through the plain lookup
        assert!(book.resolve("0:vault-raw", Some("1001")).is_none());
    }

    #[test]
    fn test_vault_resolution_falls_back_to_memo() {
        let book = AddressBook::new(vec![
            addr(1, "VAULT", Some("1001"), true),
            addr(7, "ADDR1", None, true),
        ]);
        assert_eq!(book.resolve_vault("VAULT", Some("1001")).unwrap().user, 1);
        assert_eq!(book.resolve_vault("0:vault-raw", Some("1001")).unwrap().user, 1);
        assert!(book.resolve_vault("0:vault-raw", Some("9999")).is_none());
        assert!(book.resolve_vault("0:vault-raw", None).is_none());
        // A known address still resolves by address first
        assert_eq!(book.resolve_vault("ADDR1", Some("1001")).unwrap().user, 7);
    }

    #[test]
    fn test_stray_memo_does_not_hide_address_owner() {
        let book = AddressBook::new(vec![addr(7, "ADDR1", None, true)]);
        assert_eq!(book.resolve("ADDR1", Some("hello")).unwrap().user, 7);
    }

    #[test]
    fn test_memo_of_another_address_is_ignored() {
        let book = AddressBook::new(vec![
            addr(7, "ADDR1", None, true),
            addr(1, "VAULT", Some("1001"), true),
        ]);
        assert_eq!(book.resolve("ADDR1", Some("1001")).unwrap().user, 7);
        assert!(book.resolve("ADDR2", Some("1001")).is_none());
    }

    #[test]
    fn test_memo_entry_preferred_over_plain_entry() {
        let book = AddressBook::new(vec![
            addr(3, "SHARED", None, true),
            addr(4, "SHARED", Some("m4"), true),
        ]);
        assert_eq!(book.resolve("SHARED", Some("m4")).unwrap().user, 4);
        assert_eq!(book.resolve("SHARED", Some("other")).unwrap().user, 3);
        assert_eq!(book.resolve("SHARED", None).unwrap().user, 3);
    }

    #[test]
    fn test_address_wire_defaults() {
        let json = r#"{"agent":"a","account":1,"chain":"TON","user":3,"address":"X"}"#;
        let parsed: DepositAddress = serde_json::from_str(json).unwrap();
        assert!(parsed.active);
        assert_eq!(parsed.memo, None);
    }
}
