// Copyright (c) 2024 The Botho Foundation

//! Log observer.
//!
//! Replays the sequenced log from its own read index and projects every
//! event onto the store. Applying an event twice has no further effect, so
//! the index only needs to be saved after each batch.

use std::time::Duration;

use async_trait::async_trait;
use custody_core::{
    events::decode_batch, AvsSignature, ChainAddress, Cursor, CursorKey, CustodyError, LogEvent,
    WithdrawalStatus, WorkerPhase, WorkerRole,
};
use futures::{stream::BoxStream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    db::Database,
    log::SequencedLog,
    worker::{PhaseTracker, Worker},
};

type BatchStream = BoxStream<'static, Result<(String, u64), CustodyError>>;

/// Counters for one applied batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

pub struct LogObserver {
    db: Database,
    log: SequencedLog,
    key: CursorKey,
    next_index: u64,
    stream: Option<BatchStream>,
}

impl LogObserver {
    /// Resume from the index stored for `list`, or the start of the log.
    pub fn new(db: Database, log: SequencedLog, list: &str) -> Result<Self, CustodyError> {
        let key = CursorKey::log(list);
        let next_index = db.load_cursor(&key)?.unwrap_or(0);
        info!(cursor = %key, next_index, "Log observer starting");

        Ok(Self {
            db,
            log,
            key,
            next_index,
            stream: None,
        })
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Apply every batch already in the log. Returns the number of batches.
    pub async fn catch_up(&mut self) -> Result<u64, CustodyError> {
        let tail = self.log.last_finalized().await?;
        let mut batches = 0;
        while self.next_index < tail {
            let Some((raw, next)) = self.next_batch().await? else {
                break;
            };
            self.commit(&raw, next)?;
            batches += 1;
        }
        Ok(batches)
    }

    async fn next_batch(&mut self) -> Result<Option<(String, u64)>, CustodyError> {
        let next_index = self.next_index;
        let log = &self.log;
        let stream = self.stream.get_or_insert_with(|| log.batches(next_index));

        match stream.next().await {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Apply one batch and save the index after it.
    fn commit(&mut self, raw: &str, next: u64) -> Result<ApplyReport, CustodyError> {
        let report = match self.apply_batch(raw) {
            Ok(report) => report,
            Err(e) => {
                // Restart the stream from the last saved index
                self.stream = None;
                return Err(e);
            }
        };

        self.db.save_cursor(&Cursor::new(self.key.clone(), next))?;
        self.next_index = next;
        debug!(
            cursor = %self.key,
            next,
            applied = report.applied,
            skipped = report.skipped,
            "Batch applied"
        );
        Ok(report)
    }

    /// Apply the events of one raw batch. Undecodable events are skipped.
    pub fn apply_batch(&self, raw: &str) -> Result<ApplyReport, CustodyError> {
        let mut report = ApplyReport::default();
        let events = match decode_batch(raw) {
            Ok(events) => events,
            Err(e) => {
                warn!(
                    cursor = %self.key,
                    index = self.next_index,
                    "Skipping malformed batch: {}",
                    e
                );
                report.skipped += 1;
                return Ok(report);
            }
        };

        for event in events {
            match event {
                Ok(event) => {
                    if self.apply(event)? {
                        report.applied += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                Err(e) => {
                    warn!(cursor = %self.key, index = self.next_index, "Skipping event: {}", e);
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Project one event. Returns whether the store changed.
    fn apply(&self, event: LogEvent) -> Result<bool, CustodyError> {
        match event {
            LogEvent::CreateDepositAddress(address) => {
                let chain_address = ChainAddress::new(address.chain, address.address.clone());
                if let Err(e) = chain_address.validate() {
                    warn!(
                        agent = %address.agent,
                        user = address.user,
                        "Ignoring invalid address: {}",
                        e
                    );
                    return Ok(false);
                }
                self.db.upsert_deposit_address(&address)?;
                Ok(true)
            }
            LogEvent::Deposit(records) => {
                let mut changed = false;
                for record in &records {
                    changed |= self.db.record_observed_deposit(record)?;
                }
                Ok(changed)
            }
            LogEvent::AddWithdraw(mut record) => {
                record.status = WithdrawalStatus::Initialized;
                record.avs_signature = None;
                record.transfer_tx = None;
                self.db.insert_withdrawal_if_absent(&record)
            }
            LogEvent::ApproveWithdraw(approval) => {
                let signature =
                    AvsSignature::new(approval.avs_verifying_key, approval.avs_signature);
                let approved = self.db.approve_withdrawal(&approval.id, &signature)?;
                if !approved {
                    debug!(id = %approval.id, "Approval for unknown or advanced withdrawal");
                }
                Ok(approved)
            }
            LogEvent::TransferWithdraw(transfer) => {
                let mut changed = false;
                for id in &transfer.withdraws {
                    changed |= self.db.mark_withdrawal_transferred(id, &transfer.tx_hash)?;
                }
                self.db.mark_withdrawals_published(&transfer.withdraws)?;
                Ok(changed)
            }
        }
    }
}

#[async_trait]
impl Worker for LogObserver {
    type Work = (String, u64);

    fn role(&self) -> WorkerRole {
        WorkerRole::LogObserver
    }

    fn cycle_delay(&self) -> Duration {
        Duration::ZERO
    }

    async fn fetch(&mut self) -> Result<Option<(String, u64)>, CustodyError> {
        match self.next_batch().await? {
            Some(batch) => Ok(Some(batch)),
            None => Err(CustodyError::Transient("log stream ended".into())),
        }
    }

    async fn process(
        &mut self,
        (raw, next): (String, u64),
        phase: &mut PhaseTracker,
    ) -> Result<(), CustodyError> {
        phase.enter(WorkerPhase::Persisting);
        self.commit(&raw, next).map(|_| ())
    }
}
