// Copyright (c) 2024 The Botho Foundation

//! Test doubles and fixtures shared by unit and integration tests.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use custody_core::{
    AssetClass, AvsSignature, ChainId, CustodyError, DepositAddress, DepositRecord, TokenInfo,
    Transfer, WithdrawalBatching, WithdrawalRecord, WithdrawalStatus,
};
use serde_json::{json, Value};

use crate::{
    adapter::{extract_normalized_transfers, AuthorizedWithdrawal, ChainAdapter, RawUnit},
    db::Database,
    tokens::TokenRegistry,
};

type SweepHook = Arc<dyn Fn(&[DepositRecord]) + Send + Sync>;

#[derive(Default)]
struct MockState {
    head: u64,
    units: BTreeMap<u64, Vec<Transfer>>,
    raw_units: BTreeMap<u64, Value>,
    sweep_hook: Option<SweepHook>,
    vault_transfers: Vec<(AssetClass, Transfer)>,
    fail_sweeps: bool,
    failing_withdrawals: HashSet<String>,
    sweeps: Vec<Vec<String>>,
    withdrawal_batches: Vec<Vec<String>>,
    next_tx: u64,
}

/// In-memory chain. Transaction ids are `X1`, `X2`, ... in submission
/// order, shared between sweeps and withdrawals.
pub struct MockChainAdapter {
    chain: ChainId,
    batching: WithdrawalBatching,
    state: Mutex<MockState>,
}

impl MockChainAdapter {
    pub fn new(chain: ChainId) -> Self {
        Self {
            chain,
            batching: WithdrawalBatching::Batched,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_batching(mut self, batching: WithdrawalBatching) -> Self {
        self.batching = batching;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    /// Place transfers in the unit at `position`.
    pub fn add_unit(&self, position: u64, transfers: Vec<Transfer>) {
        self.state().units.entry(position).or_default().extend(transfers);
    }

    /// Serve `payload` verbatim as the unit at `position`.
    pub fn add_raw_unit(&self, position: u64, payload: Value) {
        self.state().raw_units.insert(position, payload);
    }

    /// Call `hook` with the deposits of every sweep before it is accepted.
    pub fn on_sweep(&self, hook: impl Fn(&[DepositRecord]) + Send + Sync + 'static) {
        self.state().sweep_hook = Some(Arc::new(hook));
    }

    /// Report a transfer into the vault for logical-time detection.
    pub fn add_vault_transfer(&self, class: AssetClass, transfer: Transfer) {
        self.state().vault_transfers.push((class, transfer));
    }

    pub fn fail_sweeps(&self, fail: bool) {
        self.state().fail_sweeps = fail;
    }

    /// Reject any submission containing withdrawal `id`.
    pub fn fail_withdrawal(&self, id: &str) {
        self.state().failing_withdrawals.insert(id.to_string());
    }

    /// Deposit tx hashes of every accepted sweep.
    pub fn sweeps(&self) -> Vec<Vec<String>> {
        self.state().sweeps.clone()
    }

    /// Withdrawal ids of every accepted submission.
    pub fn withdrawal_batches(&self) -> Vec<Vec<String>> {
        self.state().withdrawal_batches.clone()
    }

    fn next_tx(state: &mut MockState) -> String {
        state.next_tx += 1;
        format!("X{}", state.next_tx)
    }
}

#[async_trait]
impl ChainAdapter for MockChainAdapter {
    fn chain(&self) -> ChainId {
        self.chain
    }

    fn native_token(&self) -> TokenInfo {
        TokenInfo::native(self.chain.as_str(), 9)
    }

    fn withdrawal_batching(&self) -> WithdrawalBatching {
        self.batching
    }

    async fn get_head(&self) -> Result<u64, CustodyError> {
        Ok(self.state().head)
    }

    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<RawUnit>, CustodyError> {
        let state = self.state();
        let mut units: BTreeMap<u64, Value> = state
            .units
            .range(from..=to)
            .map(|(position, transfers)| (*position, json!({ "transfers": transfers })))
            .collect();
        for (position, payload) in state.raw_units.range(from..=to) {
            units.insert(*position, payload.clone());
        }
        Ok(units
            .into_iter()
            .map(|(position, payload)| RawUnit { position, payload })
            .collect())
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
        Ok("VAULT".to_string())
    }

    async fn submit_sweep(&self, deposits: &[DepositRecord]) -> Result<String, CustodyError> {
        let hook = self.state().sweep_hook.clone();
        if let Some(hook) = hook {
            hook(deposits);
        }

        let mut state = self.state();
        if state.fail_sweeps {
            return Err(CustodyError::Submission("sweep rejected".into()));
        }
        state
            .sweeps
            .push(deposits.iter().map(|d| d.tx_hash.clone()).collect());
        Ok(Self::next_tx(&mut state))
    }

    async fn submit_withdrawals(
        &self,
        withdrawals: &[AuthorizedWithdrawal],
    ) -> Result<String, CustodyError> {
        let mut state = self.state();
        if let Some(bad) = withdrawals
            .iter()
            .find(|w| state.failing_withdrawals.contains(&w.record.id))
        {
            return Err(CustodyError::Submission(format!(
                "signature for {} rejected",
                bad.record.id
            )));
        }
        state
            .withdrawal_batches
            .push(withdrawals.iter().map(|w| w.record.id.clone()).collect());
        Ok(Self::next_tx(&mut state))
    }

    async fn fetch_vault_transfers(
        &self,
        class: AssetClass,
        after_lt: u64,
        limit: usize,
    ) -> Result<Vec<Transfer>, CustodyError> {
        let mut transfers: Vec<Transfer> = self
            .state()
            .vault_transfers
            .iter()
            .filter(|(c, t)| *c == class && t.lt.unwrap_or(0) > after_lt)
            .map(|(_, t)| t.clone())
            .collect();
        transfers.sort_by_key(|t| t.lt);
        transfers.truncate(limit);
        Ok(transfers)
    }
}

/// Fixed token list for every chain.
pub struct StaticTokenRegistry {
    tokens: Vec<TokenInfo>,
}

impl StaticTokenRegistry {
    pub fn new(tokens: Vec<TokenInfo>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenRegistry for StaticTokenRegistry {
    async fn available_tokens(&self, _chain: ChainId) -> Result<Vec<TokenInfo>, CustodyError> {
        Ok(self.tokens.clone())
    }
}

/// Migrated in-memory database.
pub fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.migrate().unwrap();
    db
}

pub fn deposit_address(
    agent: &str,
    account: u32,
    chain: ChainId,
    user: u64,
    address: &str,
) -> DepositAddress {
    DepositAddress {
        agent: agent.to_string(),
        account,
        chain,
        user,
        address: address.to_string(),
        memo: None,
        active: true,
    }
}

pub fn transfer(tx_hash: &str, address: &str, change: &str) -> Transfer {
    Transfer {
        tx_hash: tx_hash.to_string(),
        address: address.to_string(),
        change: change.to_string(),
        contract: None,
        memo: None,
        lt: None,
    }
}

/// An approved native withdrawal carrying a well-formed AVS signature.
pub fn approved_withdrawal(id: &str, chain: ChainId, amount: u64) -> WithdrawalRecord {
    WithdrawalRecord {
        id: id.to_string(),
        agent: "a1".to_string(),
        signatures: vec!["0xuser".to_string()],
        token: TokenInfo::native(chain.as_str(), 9),
        target_chain: chain,
        amount,
        to_address: "EQ-destination".to_string(),
        status: WithdrawalStatus::Approved,
        avs_signature: Some(AvsSignature::new("0xa1b2", "0xc3d4")),
        transfer_tx: None,
    }
}
