// Copyright (c) 2024 The Botho Foundation

//! Block processor: turns queued units into deposit records, sweeps them
//! into the vault and publishes the result.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use custody_core::{
    token::resolve_token, AddressBook, ChainId, CustodyError, DepositRecord, LogEvent,
    WorkerPhase, WorkerRole,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    adapter::ChainAdapter,
    db::Database,
    log::{SendMode, SequencedLog},
    queue::{DurableQueue, QueueItem},
    tokens::TokenRegistry,
    worker::{PhaseTracker, Worker},
};

/// Counters for one reconciled unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Transfers extracted for watched addresses
    pub discovered: usize,
    /// New deposit records
    pub recorded: usize,
    /// Transfers already recorded earlier
    pub duplicates: usize,
    /// Transfers with no owner or no allowed token
    pub discarded: usize,
    pub swept_tx: Option<String>,
}

/// Publish every swept deposit of `chain` whose event is missing from the
/// log, one `Deposit` event per sweep transaction.
pub async fn republish_deposits(
    db: &Database,
    log: &SequencedLog,
    chain: ChainId,
) -> Result<usize, CustodyError> {
    let pending = db.find_unpublished_deposits(chain)?;
    if pending.is_empty() {
        return Ok(0);
    }

    let mut groups: BTreeMap<Option<String>, Vec<DepositRecord>> = BTreeMap::new();
    for record in pending {
        groups
            .entry(record.transfer_tx.clone())
            .or_default()
            .push(record);
    }

    let mut published = 0;
    for deposits in groups.into_values() {
        publish_deposits(db, log, &deposits).await?;
        published += deposits.len();
    }
    info!(%chain, published, "Republished deposit events");
    Ok(published)
}

/// Append one `Deposit` event and flag its records as published.
pub(crate) async fn publish_deposits(
    db: &Database,
    log: &SequencedLog,
    deposits: &[DepositRecord],
) -> Result<(), CustodyError> {
    log.send(&[LogEvent::Deposit(deposits.to_vec())], SendMode::FireAndForget)
        .await?;
    let hashes: Vec<String> = deposits.iter().map(|d| d.tx_hash.clone()).collect();
    db.mark_deposits_published(&hashes)
}

/// Deposit discovery and settlement for one chain.
pub struct Reconciler {
    chain: ChainId,
    adapter: Arc<dyn ChainAdapter>,
    tokens: Arc<dyn TokenRegistry>,
    db: Database,
    log: SequencedLog,
}

impl Reconciler {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        tokens: Arc<dyn TokenRegistry>,
        db: Database,
        log: SequencedLog,
    ) -> Self {
        Self {
            chain: adapter.chain(),
            adapter,
            tokens,
            db,
            log,
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// Record the deposits found in the unit at `position` and sweep them.
    ///
    /// Records are committed before the sweep. If the sweep fails they stay
    /// untransferred for [`Reconciler::retry_unswept`] and the submission
    /// error is returned.
    pub async fn reconcile_unit(&self, position: u64) -> Result<CycleReport, CustodyError> {
        let book = AddressBook::new(self.db.find_active_deposit_addresses(self.chain)?);
        let mut report = CycleReport::default();
        if book.is_empty() {
            debug!(chain = %self.chain, position, "No active deposit addresses");
            return Ok(report);
        }

        let allowed = self.tokens.available_tokens(self.chain).await?;
        let native = self.adapter.native_token();
        let watch: HashSet<String> = book.watch_list().into_iter().collect();

        let units = self.adapter.fetch_range(position, position).await?;
        let mut recorded = Vec::new();

        for unit in &units {
            let transfers = self.adapter.extract_transfers(unit, &watch, &allowed)?;
            for transfer in transfers {
                report.discovered += 1;

                let Some(owner) = book.resolve(&transfer.address, transfer.memo.as_deref()) else {
                    warn!(
                        chain = %self.chain,
                        tx = %transfer.tx_hash,
                        address = %transfer.address,
                        "Discarding transfer to unknown address"
                    );
                    report.discarded += 1;
                    continue;
                };

                let Some(token) = resolve_token(&native, &allowed, transfer.contract.as_deref())
                else {
                    warn!(
                        chain = %self.chain,
                        tx = %transfer.tx_hash,
                        contract = ?transfer.contract,
                        "Discarding transfer of unlisted token"
                    );
                    report.discarded += 1;
                    continue;
                };

                let record = DepositRecord::from_transfer(
                    self.chain,
                    owner,
                    &transfer,
                    &token,
                    Some(unit.position),
                );
                if self.db.insert_deposit_if_absent(&record)? {
                    info!(
                        chain = %self.chain,
                        tx = %record.tx_hash,
                        agent = %record.agent,
                        user = record.user,
                        amount = %record.deposit.amount,
                        token = %record.deposit.token,
                        "Deposit recorded"
                    );
                    recorded.push(record);
                } else {
                    debug!(chain = %self.chain, tx = %record.tx_hash, "Deposit already recorded");
                    report.duplicates += 1;
                }
            }
        }

        report.recorded = recorded.len();
        if !recorded.is_empty() {
            report.swept_tx = Some(self.settle(recorded).await?);
        }
        Ok(report)
    }

    /// Sweep `deposits` in one transaction, mark them transferred and
    /// publish one `Deposit` event.
    ///
    /// Nothing is marked or published when the sweep fails.
    pub async fn settle(&self, mut deposits: Vec<DepositRecord>) -> Result<String, CustodyError> {
        let tx = self
            .adapter
            .submit_sweep(&deposits)
            .await
            .map_err(|e| match e {
                CustodyError::Submission(_) => e,
                other => CustodyError::Submission(other.to_string()),
            })?;
        info!(chain = %self.chain, tx = %tx, count = deposits.len(), "Sweep submitted");

        for deposit in &mut deposits {
            if !self.db.mark_deposit_transferred(&deposit.tx_hash, &tx)? {
                debug!(tx = %deposit.tx_hash, "Deposit was already marked transferred");
            }
            deposit.mark_transferred(tx.clone());
        }

        publish_deposits(&self.db, &self.log, &deposits).await?;
        Ok(tx)
    }

    /// Secondary pass over deposits whose sweep failed earlier.
    ///
    /// Publishes any settled deposits still missing from the log first.
    pub async fn retry_unswept(&self) -> Result<Option<String>, CustodyError> {
        republish_deposits(&self.db, &self.log, self.chain).await?;

        let pending = self.db.find_unswept_deposits(self.chain)?;
        if pending.is_empty() {
            return Ok(None);
        }
        info!(chain = %self.chain, count = pending.len(), "Retrying unswept deposits");
        self.settle(pending).await.map(Some)
    }
}

/// Work handed from `fetch` to `process`.
#[derive(Debug)]
pub enum ProcessorWork {
    Unit(QueueItem),
    RetryUnswept,
}

/// Worker consuming the chain's block queue.
pub struct BlockProcessor {
    reconciler: Reconciler,
    queue: Arc<dyn DurableQueue>,
    unswept_interval: Duration,
    next_unswept: Instant,
}

impl BlockProcessor {
    /// The unswept pass runs first, then every `unswept_interval`.
    pub fn new(
        reconciler: Reconciler,
        queue: Arc<dyn DurableQueue>,
        unswept_interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            queue,
            unswept_interval,
            next_unswept: Instant::now(),
        }
    }

    async fn process_unit(
        &self,
        item: QueueItem,
        phase: &mut PhaseTracker,
    ) -> Result<(), CustodyError> {
        let Ok(position) = item.payload.parse::<u64>() else {
            warn!(
                queue = %self.queue.name(),
                payload = %item.payload,
                "Dropping malformed queue item"
            );
            return self.queue.ack(&item).await;
        };

        let result = self.reconciler.reconcile_unit(position).await;
        phase.enter(WorkerPhase::Persisting);

        match result {
            Ok(report) => {
                if report.discovered > 0 {
                    info!(
                        chain = %self.reconciler.chain(),
                        position,
                        recorded = report.recorded,
                        duplicates = report.duplicates,
                        discarded = report.discarded,
                        "Unit reconciled"
                    );
                }
                self.queue.ack(&item).await
            }
            // Redelivery cannot repair the unit.
            Err(CustodyError::Integrity(reason)) => {
                warn!(
                    chain = %self.reconciler.chain(),
                    position,
                    "Dropping unit that failed integrity checks: {}",
                    reason
                );
                self.queue.ack(&item).await
            }
            // Records are committed; the unswept pass takes over.
            Err(e @ CustodyError::Submission(_)) => {
                self.queue.ack(&item).await?;
                Err(e)
            }
            // Left claimed; redelivered after the visibility timeout.
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Worker for BlockProcessor {
    type Work = ProcessorWork;

    fn role(&self) -> WorkerRole {
        WorkerRole::BlockProcessor
    }

    fn cycle_delay(&self) -> Duration {
        Duration::ZERO
    }

    async fn fetch(&mut self) -> Result<Option<ProcessorWork>, CustodyError> {
        let now = Instant::now();
        if now >= self.next_unswept {
            self.next_unswept = now + self.unswept_interval;
            return Ok(Some(ProcessorWork::RetryUnswept));
        }

        match tokio::time::timeout(self.next_unswept - now, self.queue.pop()).await {
            Ok(item) => Ok(Some(ProcessorWork::Unit(item?))),
            Err(_) => Ok(None),
        }
    }

    async fn process(
        &mut self,
        work: ProcessorWork,
        phase: &mut PhaseTracker,
    ) -> Result<(), CustodyError> {
        match work {
            ProcessorWork::Unit(item) => self.process_unit(item, phase).await,
            ProcessorWork::RetryUnswept => {
                let swept = self.reconciler.retry_unswept().await?;
                phase.enter(WorkerPhase::Persisting);
                if let Some(tx) = swept {
                    info!(chain = %self.reconciler.chain(), tx = %tx, "Unswept deposits settled");
                }
                Ok(())
            }
        }
    }
}
