// Copyright (c) 2024 The Botho Foundation

//! Withdrawal executor.
//!
//! Releases approved withdrawals on one chain. A record is complete once it
//! carries a transfer transaction; until a submission returns a transaction
//! id nothing about the record changes, so a failed submission is simply
//! retried on the next poll.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use custody_core::{
    ChainId, CustodyError, LogEvent, WithdrawTransfer, WithdrawalBatching, WorkerPhase, WorkerRole,
};
use tracing::{info, warn};

use crate::{
    adapter::{AuthorizedWithdrawal, ChainAdapter},
    db::{Database, WithdrawalQuery},
    log::{SendMode, SequencedLog},
    worker::{PhaseTracker, Worker},
};

/// Outcome of one executor poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Settled withdrawal ids per transaction
    pub settled: Vec<WithdrawTransfer>,
    /// Records skipped for a missing or malformed AVS signature
    pub skipped: Vec<String>,
    /// Records whose submission failed; still approved
    pub failed: Vec<String>,
}

pub struct WithdrawalExecutor {
    chain: ChainId,
    adapter: Arc<dyn ChainAdapter>,
    db: Database,
    log: SequencedLog,
    interval: Duration,
}

impl WithdrawalExecutor {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        db: Database,
        log: SequencedLog,
        interval: Duration,
    ) -> Self {
        Self {
            chain: adapter.chain(),
            adapter,
            db,
            log,
            interval,
        }
    }

    /// Submit every executable withdrawal of the chain.
    ///
    /// Records are grouped by token since native and token releases need
    /// different instructions. A batching chain submits one transaction per
    /// group; otherwise each record goes alone and a failure only affects
    /// that record.
    pub async fn execute_once(&self) -> Result<ExecutionReport, CustodyError> {
        self.republish_pending().await?;

        let mut report = ExecutionReport::default();
        let records = self.db.find_withdrawals(&WithdrawalQuery::executable(self.chain))?;
        if records.is_empty() {
            return Ok(report);
        }

        let mut groups: BTreeMap<Option<String>, Vec<AuthorizedWithdrawal>> = BTreeMap::new();
        for record in records {
            let id = record.id.clone();
            match AuthorizedWithdrawal::authorize(record) {
                Ok(authorized) => groups
                    .entry(authorized.record.token.contract.clone())
                    .or_default()
                    .push(authorized),
                Err(e) => {
                    warn!(chain = %self.chain, id = %id, "Skipping withdrawal: {}", e);
                    report.skipped.push(id);
                }
            }
        }

        let batches: Vec<Vec<AuthorizedWithdrawal>> = match self.adapter.withdrawal_batching() {
            WithdrawalBatching::Batched => groups.into_values().collect(),
            WithdrawalBatching::PerRecord => groups
                .into_values()
                .flatten()
                .map(|w| vec![w])
                .collect(),
        };

        for batch in batches {
            let ids: Vec<String> = batch.iter().map(|w| w.record.id.clone()).collect();
            match self.submit(&batch).await {
                Ok(settled) => report.settled.push(settled),
                Err(e) => {
                    warn!(chain = %self.chain, ids = ?ids, "Withdrawal submission failed: {}", e);
                    report.failed.extend(ids);
                }
            }
        }

        Ok(report)
    }

    async fn submit(
        &self,
        batch: &[AuthorizedWithdrawal],
    ) -> Result<WithdrawTransfer, CustodyError> {
        let tx = self
            .adapter
            .submit_withdrawals(batch)
            .await
            .map_err(|e| match e {
                CustodyError::Submission(_) => e,
                other => CustodyError::Submission(other.to_string()),
            })?;

        let mut settled = Vec::with_capacity(batch.len());
        for w in batch {
            if self.db.mark_withdrawal_transferred(&w.record.id, &tx)? {
                settled.push(w.record.id.clone());
            } else {
                warn!(id = %w.record.id, tx = %tx, "Withdrawal was already settled");
            }
        }
        info!(chain = %self.chain, tx = %tx, ids = ?settled, "Withdrawals transferred");

        let transfer = WithdrawTransfer {
            withdraws: settled,
            tx_hash: tx,
        };
        if !transfer.withdraws.is_empty() {
            if let Err(e) = self.publish(&transfer).await {
                warn!(tx = %transfer.tx_hash, "Publish failed, will republish: {}", e);
            }
        }
        Ok(transfer)
    }

    async fn publish(&self, transfer: &WithdrawTransfer) -> Result<(), CustodyError> {
        self.log
            .send(
                &[LogEvent::TransferWithdraw(transfer.clone())],
                SendMode::FireAndForget,
            )
            .await?;
        self.db.mark_withdrawals_published(&transfer.withdraws)
    }

    /// Publish settled withdrawals whose event never reached the log.
    pub async fn republish_pending(&self) -> Result<usize, CustodyError> {
        let mut published = 0;
        for (tx_hash, withdraws) in self.db.find_unpublished_withdrawals(self.chain)? {
            published += withdraws.len();
            self.publish(&WithdrawTransfer { withdraws, tx_hash }).await?;
        }
        if published > 0 {
            info!(chain = %self.chain, published, "Republished withdrawal events");
        }
        Ok(published)
    }
}

#[async_trait]
impl Worker for WithdrawalExecutor {
    type Work = ();

    fn role(&self) -> WorkerRole {
        WorkerRole::WithdrawExecutor
    }

    fn cycle_delay(&self) -> Duration {
        self.interval
    }

    async fn fetch(&mut self) -> Result<Option<()>, CustodyError> {
        Ok(Some(()))
    }

    async fn process(&mut self, _: (), phase: &mut PhaseTracker) -> Result<(), CustodyError> {
        let report = self.execute_once().await?;
        phase.enter(WorkerPhase::Persisting);

        if report.failed.is_empty() {
            Ok(())
        } else {
            Err(CustodyError::Submission(format!(
                "{} withdrawals not submitted: {:?}",
                report.failed.len(),
                report.failed
            )))
        }
    }
}
