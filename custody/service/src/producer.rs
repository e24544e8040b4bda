// Copyright (c) 2024 The Botho Foundation

//! Block scan producer.
//!
//! Polls the chain head and enqueues every new unit individually. The
//! last enqueued position is persisted as the chain's `blocks` cursor, so a
//! restart resumes where it stopped and a failed push is re-derived on the
//! next poll.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use custody_core::{AssetClass, Cursor, CursorKey, CustodyError, UnitRange, WorkerPhase, WorkerRole};
use tracing::{debug, info, warn};

use crate::{
    adapter::ChainAdapter,
    db::Database,
    queue::DurableQueue,
    worker::{PhaseTracker, Worker},
};

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// First poll without a stored cursor; nothing enqueued.
    Primed { head: u64 },
    /// Head has not moved.
    Unchanged,
    /// `enqueued` units pushed, cursor now at `position`.
    Enqueued { enqueued: u64, position: u64 },
}

pub struct BlockScanProducer {
    adapter: Arc<dyn ChainAdapter>,
    queue: Arc<dyn DurableQueue>,
    db: Database,
    key: CursorKey,
    last_observed: Option<u64>,
    interval: Duration,
}

impl BlockScanProducer {
    /// Create a producer, resuming from the stored cursor if there is one.
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        queue: Arc<dyn DurableQueue>,
        db: Database,
        interval: Duration,
    ) -> Result<Self, CustodyError> {
        let key = CursorKey::chain(adapter.chain(), AssetClass::Blocks);
        let last_observed = db.load_cursor(&key)?;
        if let Some(position) = last_observed {
            info!(cursor = %key, position, "Resuming block scan");
        }

        Ok(Self {
            adapter,
            queue,
            db,
            key,
            last_observed,
            interval,
        })
    }

    pub fn last_observed(&self) -> Option<u64> {
        self.last_observed
    }

    /// Read the head and enqueue everything after the cursor.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, CustodyError> {
        let head = self.adapter.get_head().await?;
        self.enqueue_through(head).await
    }

    async fn enqueue_through(&mut self, head: u64) -> Result<PollOutcome, CustodyError> {
        let Some(last) = self.last_observed else {
            self.db.save_cursor(&Cursor::new(self.key.clone(), head))?;
            self.last_observed = Some(head);
            info!(cursor = %self.key, head, "Cold start, cursor primed at head");
            return Ok(PollOutcome::Primed { head });
        };

        let Some(range) = UnitRange::after(last, head) else {
            if head < last {
                warn!(cursor = %self.key, head, last, "Head is behind cursor");
            }
            return Ok(PollOutcome::Unchanged);
        };

        let mut position = last;
        let mut push_error = None;
        for unit in range.units() {
            if let Err(e) = self.queue.push(&unit.to_string()).await {
                push_error = Some(e);
                break;
            }
            position = unit;
        }

        let enqueued = position - last;
        if enqueued > 0 {
            self.db.save_cursor(&Cursor::new(self.key.clone(), position))?;
            self.last_observed = Some(position);
            debug!(cursor = %self.key, from = last + 1, to = position, "Enqueued units");
        }

        match push_error {
            Some(e) => {
                warn!(cursor = %self.key, position, "Enqueue stopped early: {}", e);
                Err(e)
            }
            None => Ok(PollOutcome::Enqueued { enqueued, position }),
        }
    }
}

#[async_trait]
impl Worker for BlockScanProducer {
    type Work = u64;

    fn role(&self) -> WorkerRole {
        WorkerRole::BlockFetcher
    }

    fn cycle_delay(&self) -> Duration {
        self.interval
    }

    async fn fetch(&mut self) -> Result<Option<u64>, CustodyError> {
        Ok(Some(self.adapter.get_head().await?))
    }

    async fn process(&mut self, head: u64, phase: &mut PhaseTracker) -> Result<(), CustodyError> {
        phase.enter(WorkerPhase::Persisting);
        self.enqueue_through(head).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::{QueueItem, SqliteQueue},
        test_utils::{test_db, MockChainAdapter},
    };
    use custody_core::ChainId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn producer(db: &Database, adapter: Arc<MockChainAdapter>) -> BlockScanProducer {
        let queue = Arc::new(SqliteQueue::new(db.clone(), "sol-blocks"));
        BlockScanProducer::new(adapter, queue, db.clone(), Duration::from_millis(10)).unwrap()
    }

    async fn drain(db: &Database) -> Vec<u64> {
        let queue = SqliteQueue::new(db.clone(), "sol-blocks");
        let mut units = vec![];
        while let Some(item) = queue.try_pop().unwrap() {
            units.push(item.payload.parse().unwrap());
            queue.ack(&item).await.unwrap();
        }
        units
    }

    #[tokio::test]
    async fn test_cold_start_enqueues_nothing() {
        let db = test_db();
        let adapter = Arc::new(MockChainAdapter::new(ChainId::Solana));
        adapter.set_head(1_000);

        let mut producer = producer(&db, adapter);
        let outcome = producer.poll_once().await.unwrap();
        assert_eq!(outcome, PollOutcome::Primed { head: 1_000 });
        assert!(drain(&db).await.is_empty());

        let key = CursorKey::chain(ChainId::Solana, AssetClass::Blocks);
        assert_eq!(db.load_cursor(&key).unwrap(), Some(1_000));
    }

    #[tokio::test]
    async fn test_no_gap_no_duplicate() {
        let db = test_db();
        let adapter = Arc::new(MockChainAdapter::new(ChainId::Solana));
        let mut producer = producer(&db, adapter.clone());

        adapter.set_head(10);
        producer.poll_once().await.unwrap();
        adapter.set_head(13);
        producer.poll_once().await.unwrap();
        adapter.set_head(13);
        assert_eq!(producer.poll_once().await.unwrap(), PollOutcome::Unchanged);
        adapter.set_head(17);
        producer.poll_once().await.unwrap();

        assert_eq!(drain(&db).await, (11..=17).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_resumes_from_stored_cursor() {
        let db = test_db();
        db.save_cursor(&Cursor::new(
            CursorKey::chain(ChainId::Solana, AssetClass::Blocks),
            50,
        ))
        .unwrap();
        let adapter = Arc::new(MockChainAdapter::new(ChainId::Solana));
        adapter.set_head(55);

        let mut producer = producer(&db, adapter);
        assert_eq!(producer.last_observed(), Some(50));
        let outcome = producer.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Enqueued {
                enqueued: 5,
                position: 55
            }
        );
        assert_eq!(drain(&db).await, vec![51, 52, 53, 54, 55]);
    }

    /// Accepts a fixed number of pushes, then fails.
    struct FailingQueue {
        inner: SqliteQueue,
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl DurableQueue for FailingQueue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn push(&self, item: &str) -> Result<(), CustodyError> {
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return Err(CustodyError::Transient("queue unreachable".into()));
            }
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            self.inner.push(item).await
        }

        async fn pop(&self) -> Result<QueueItem, CustodyError> {
            self.inner.pop().await
        }

        async fn ack(&self, item: &QueueItem) -> Result<(), CustodyError> {
            self.inner.ack(item).await
        }

        async fn length(&self) -> Result<u64, CustodyError> {
            self.inner.length().await
        }
    }

    #[tokio::test]
    async fn test_failed_push_is_rederived() {
        let db = test_db();
        db.save_cursor(&Cursor::new(
            CursorKey::chain(ChainId::Solana, AssetClass::Blocks),
            20,
        ))
        .unwrap();
        let adapter = Arc::new(MockChainAdapter::new(ChainId::Solana));
        adapter.set_head(25);

        let queue = Arc::new(FailingQueue {
            inner: SqliteQueue::new(db.clone(), "sol-blocks"),
            remaining: AtomicUsize::new(2),
        });
        let mut producer =
            BlockScanProducer::new(adapter, queue.clone(), db.clone(), Duration::ZERO).unwrap();

        assert!(producer.poll_once().await.is_err());
        assert_eq!(producer.last_observed(), Some(22));

        queue.remaining.store(usize::MAX, Ordering::SeqCst);
        producer.poll_once().await.unwrap();
        assert_eq!(drain(&db).await, (21..=25).collect::<Vec<_>>());
    }
}
