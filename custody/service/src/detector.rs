// Copyright (c) 2024 The Botho Foundation

//! Deposit detection for chains ordered by logical time.
//!
//! Users share the vault address and are told apart by memo, so funds are
//! already in the vault when a deposit is seen and no sweep is needed.
//! Native and token transfers are tracked by separate cursors.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use custody_core::{
    token::resolve_token, AddressBook, AssetClass, ChainId, Cursor, CursorKey, CustodyError,
    DepositRecord, WorkerPhase, WorkerRole,
};
use tracing::{debug, info, warn};

use crate::{
    adapter::ChainAdapter,
    db::Database,
    log::SequencedLog,
    processor::{publish_deposits, republish_deposits},
    tokens::TokenRegistry,
    worker::{PhaseTracker, Worker},
};

const CLASSES: [AssetClass; 2] = [AssetClass::Native, AssetClass::Token];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectReport {
    pub recorded: usize,
    pub duplicates: usize,
    pub discarded: usize,
}

pub struct LtDepositDetector {
    chain: ChainId,
    adapter: Arc<dyn ChainAdapter>,
    tokens: Arc<dyn TokenRegistry>,
    db: Database,
    log: SequencedLog,
    interval: Duration,
    limit: usize,
    positions: HashMap<AssetClass, u64>,
}

impl LtDepositDetector {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        tokens: Arc<dyn TokenRegistry>,
        db: Database,
        log: SequencedLog,
        interval: Duration,
        limit: usize,
    ) -> Self {
        Self {
            chain: adapter.chain(),
            adapter,
            tokens,
            db,
            log,
            interval,
            limit,
            positions: HashMap::new(),
        }
    }

    /// Logical time after which `class` transfers are still unseen.
    ///
    /// Starts from the stored cursor, then the newest recorded deposit of
    /// the class, then the chain head.
    async fn position(&mut self, class: AssetClass) -> Result<u64, CustodyError> {
        if let Some(position) = self.positions.get(&class) {
            return Ok(*position);
        }

        let key = CursorKey::chain(self.chain, class);
        let position = match self.db.load_cursor(&key)? {
            Some(position) => position,
            None => match self
                .db
                .last_deposit_logical_time(self.chain, class == AssetClass::Native)?
            {
                Some(lt) => lt,
                None => {
                    let head = self.adapter.get_head().await?;
                    info!(cursor = %key, head, "Cold start, detecting from head");
                    head
                }
            },
        };

        self.positions.insert(class, position);
        Ok(position)
    }

    /// Record and publish new vault deposits, then advance the cursors.
    pub async fn detect_once(&mut self) -> Result<DetectReport, CustodyError> {
        republish_deposits(&self.db, &self.log, self.chain).await?;

        let book = AddressBook::new(self.db.find_active_deposit_addresses(self.chain)?);
        let allowed = self.tokens.available_tokens(self.chain).await?;
        let native = self.adapter.native_token();

        let mut report = DetectReport::default();
        let mut recorded = Vec::new();
        let mut advanced = Vec::new();

        for class in CLASSES {
            let after = self.position(class).await?;
            let transfers = self
                .adapter
                .fetch_vault_transfers(class, after, self.limit)
                .await?;

            let mut newest = after;
            for transfer in transfers {
                newest = newest.max(transfer.lt.unwrap_or(0));
                if !transfer.is_incoming() {
                    continue;
                }

                let token = match (class, transfer.contract.as_deref()) {
                    (AssetClass::Native, None) | (AssetClass::Token, Some(_)) => {
                        resolve_token(&native, &allowed, transfer.contract.as_deref())
                    }
                    _ => None,
                };
                let Some(token) = token else {
                    debug!(
                        tx = %transfer.tx_hash,
                        contract = ?transfer.contract,
                        "Skipping unlisted token"
                    );
                    report.discarded += 1;
                    continue;
                };

                let memo = transfer.memo.as_deref();
                let Some(owner) = book.resolve_vault(&transfer.address, memo) else {
                    warn!(
                        chain = %self.chain,
                        tx = %transfer.tx_hash,
                        memo = ?transfer.memo,
                        "Discarding vault transfer with unknown memo"
                    );
                    report.discarded += 1;
                    continue;
                };

                let mut record =
                    DepositRecord::from_transfer(self.chain, owner, &transfer, &token, None);
                record.transferred = true;

                if self.db.insert_deposit_if_absent(&record)? {
                    info!(
                        chain = %self.chain,
                        tx = %record.tx_hash,
                        agent = %record.agent,
                        user = record.user,
                        amount = %record.deposit.amount,
                        token = %record.deposit.token,
                        "Deposit detected"
                    );
                    recorded.push(record);
                } else {
                    report.duplicates += 1;
                }
            }

            if newest > after {
                advanced.push((class, Cursor::new(CursorKey::chain(self.chain, class), newest)));
            }
        }

        report.recorded = recorded.len();
        if !recorded.is_empty() {
            publish_deposits(&self.db, &self.log, &recorded).await?;
        }

        for (class, cursor) in advanced {
            self.db.save_cursor(&cursor)?;
            debug!(cursor = %cursor.key, position = cursor.position, "Cursor advanced");
            self.positions.insert(class, cursor.position);
        }

        Ok(report)
    }
}

#[async_trait]
impl Worker for LtDepositDetector {
    type Work = ();

    fn role(&self) -> WorkerRole {
        WorkerRole::DepositDetector
    }

    fn cycle_delay(&self) -> Duration {
        self.interval
    }

    async fn fetch(&mut self) -> Result<Option<()>, CustodyError> {
        Ok(Some(()))
    }

    async fn process(&mut self, _: (), phase: &mut PhaseTracker) -> Result<(), CustodyError> {
        let report = self.detect_once().await?;
        phase.enter(WorkerPhase::Persisting);
        if report.recorded > 0 || report.discarded > 0 {
            info!(
                chain = %self.chain,
                recorded = report.recorded,
                duplicates = report.duplicates,
                discarded = report.discarded,
                "Detection cycle finished"
            );
        }
        Ok(())
    }
}
