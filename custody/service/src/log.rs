// Copyright (c) 2024 The Botho Foundation

//! Client for the sequenced event log.
//!
//! Every state change is appended as one JSON batch to a named ordered
//! list. Readers replay the list from any index; the log never feeds back
//! into decisions made by the writers.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use custody_core::{events::encode_batch, CustodyError, LogEvent};
use futures::{stream::BoxStream, StreamExt};
use tracing::debug;

use crate::db::Database;

/// Batches fetched per read while replaying.
const READ_CHUNK: usize = 100;

/// Storage behind the log: an append-only list of opaque batches.
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Append a batch; returns the index it was stored at.
    async fn append(&self, payload: &str) -> Result<u64, CustodyError>;

    /// Number of batches in the list.
    async fn length(&self) -> Result<u64, CustodyError>;

    /// Up to `limit` batches starting at index `from`.
    async fn read_from(&self, from: u64, limit: usize) -> Result<Vec<String>, CustodyError>;
}

/// Log list stored in the shared SQLite database.
pub struct SqliteLogBackend {
    db: Database,
    list: String,
}

impl SqliteLogBackend {
    pub fn new(db: Database, list: impl Into<String>) -> Self {
        Self {
            db,
            list: list.into(),
        }
    }
}

#[async_trait]
impl LogBackend for SqliteLogBackend {
    async fn append(&self, payload: &str) -> Result<u64, CustodyError> {
        self.db.log_append(&self.list, payload)
    }

    async fn length(&self) -> Result<u64, CustodyError> {
        self.db.log_len(&self.list)
    }

    async fn read_from(&self, from: u64, limit: usize) -> Result<Vec<String>, CustodyError> {
        self.db.log_read(&self.list, from, limit)
    }
}

/// How `send` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Return once the append is accepted
    FireAndForget,
    /// Wait until the batch is observed in the log
    Blocking,
}

/// Publisher and reader for one log list.
///
/// Constructed per worker and passed to the components that publish.
#[derive(Clone)]
pub struct SequencedLog {
    backend: Arc<dyn LogBackend>,
    poll_interval: Duration,
}

impl SequencedLog {
    pub fn new(backend: Arc<dyn LogBackend>) -> Self {
        Self {
            backend,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn sqlite(db: Database, list: &str) -> Self {
        Self::new(Arc::new(SqliteLogBackend::new(db, list)))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Index one past the newest batch.
    pub async fn last_finalized(&self) -> Result<u64, CustodyError> {
        self.backend.length().await
    }

    /// Append one batch of events.
    ///
    /// In blocking mode the log is read from the tail observed before the
    /// append until a batch with exactly the sent bytes shows up; its index
    /// is returned.
    pub async fn send(
        &self,
        events: &[LogEvent],
        mode: SendMode,
    ) -> Result<Option<u64>, CustodyError> {
        let payload = encode_batch(events)?;

        match mode {
            SendMode::FireAndForget => {
                self.backend.append(&payload).await?;
                debug!(events = events.len(), "Published batch");
                Ok(None)
            }
            SendMode::Blocking => {
                let tail = self.last_finalized().await?;
                self.backend.append(&payload).await?;

                let mut batches = self.batches(tail);
                while let Some(next) = batches.next().await {
                    let (raw, next_index) = next?;
                    if raw == payload {
                        debug!(index = next_index - 1, "Observed published batch");
                        return Ok(Some(next_index - 1));
                    }
                }
                Err(CustodyError::Transient("log stream ended".into()))
            }
        }
    }

    /// Replay batches starting at index `after`, yielding each raw batch
    /// with the index to resume from.
    ///
    /// The stream never ends: once caught up it polls for new batches.
    /// A read error is yielded after one poll interval and the stream keeps
    /// going from the same index.
    pub fn batches(&self, after: u64) -> BoxStream<'static, Result<(String, u64), CustodyError>> {
        let backend = self.backend.clone();
        let poll = self.poll_interval;

        futures::stream::unfold(
            (after, VecDeque::<String>::new()),
            move |(mut next, mut pending)| {
                let backend = backend.clone();
                async move {
                    loop {
                        if let Some(raw) = pending.pop_front() {
                            next += 1;
                            return Some((Ok((raw, next)), (next, pending)));
                        }
                        match backend.read_from(next, READ_CHUNK).await {
                            Ok(batch) if !batch.is_empty() => pending.extend(batch),
                            Ok(_) => tokio::time::sleep(poll).await,
                            Err(e) => {
                                tokio::time::sleep(poll).await;
                                return Some((Err(e), (next, pending)));
                            }
                        }
                    }
                }
            },
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::{events::decode_batch, WithdrawTransfer};

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn test_log() -> SequencedLog {
        SequencedLog::sqlite(test_db(), "events").with_poll_interval(Duration::from_millis(10))
    }

    /// Another writer's batch lands right before every append.
    struct ContendedBackend {
        inner: SqliteLogBackend,
        other: String,
    }

    #[async_trait]
    impl LogBackend for ContendedBackend {
        async fn append(&self, payload: &str) -> Result<u64, CustodyError> {
            self.inner.append(&self.other).await?;
            self.inner.append(payload).await
        }

        async fn length(&self) -> Result<u64, CustodyError> {
            self.inner.length().await
        }

        async fn read_from(&self, from: u64, limit: usize) -> Result<Vec<String>, CustodyError> {
            self.inner.read_from(from, limit).await
        }
    }

    /// Accepts appends but cannot be read back.
    struct UnreadableBackend {
        inner: SqliteLogBackend,
    }

    #[async_trait]
    impl LogBackend for UnreadableBackend {
        async fn append(&self, payload: &str) -> Result<u64, CustodyError> {
            self.inner.append(payload).await
        }

        async fn length(&self) -> Result<u64, CustodyError> {
            self.inner.length().await
        }

        async fn read_from(&self, _from: u64, _limit: usize) -> Result<Vec<String>, CustodyError> {
            Err(CustodyError::Transient("log node unreachable".into()))
        }
    }

    fn transfer_event(tx: &str) -> LogEvent {
        LogEvent::TransferWithdraw(WithdrawTransfer {
            withdraws: vec!["W1".to_string()],
            tx_hash: tx.to_string(),
        })
    }

    #[tokio::test]
    async fn test_fire_and_forget_appends() {
        let log = test_log();
        assert_eq!(
            log.send(&[transfer_event("X1")], SendMode::FireAndForget)
                .await
                .unwrap(),
            None
        );
        assert_eq!(log.last_finalized().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_blocking_send_returns_own_index() {
        let log = test_log();
        log.send(&[transfer_event("X0")], SendMode::FireAndForget)
            .await
            .unwrap();
        log.send(&[transfer_event("X1")], SendMode::FireAndForget)
            .await
            .unwrap();

        let index = log
            .send(&[transfer_event("X2")], SendMode::Blocking)
            .await
            .unwrap();
        assert_eq!(index, Some(2));
    }

    #[tokio::test]
    async fn test_batches_replay_from_index() {
        let log = test_log();
        for tx in ["X0", "X1", "X2"] {
            log.send(&[transfer_event(tx)], SendMode::FireAndForget)
                .await
                .unwrap();
        }

        let mut stream = log.batches(1);
        let (raw, next) = stream.next().await.unwrap().unwrap();
        assert_eq!(next, 2);
        let events = decode_batch(&raw).unwrap();
        assert_eq!(events[0].as_ref().unwrap(), &transfer_event("X1"));

        let (_, next) = stream.next().await.unwrap().unwrap();
        assert_eq!(next, 3);
    }

    #[tokio::test]
    async fn test_independent_readers_and_live_tail() {
        let log = test_log();
        log.send(&[transfer_event("X0")], SendMode::FireAndForget)
            .await
            .unwrap();

        let mut a = log.batches(0);
        let mut b = log.batches(0);
        assert_eq!(a.next().await.unwrap().unwrap().1, 1);
        assert_eq!(b.next().await.unwrap().unwrap().1, 1);

        // Caught up: the next read waits for a new batch
        let waiter = tokio::spawn(async move { a.next().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        log.send(&[transfer_event("X1")], SendMode::FireAndForget)
            .await
            .unwrap();
        let (_, next) = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn test_blocking_send_skips_interleaved_batch() {
        let db = test_db();
        let other = encode_batch(&[transfer_event("OTHER")]).unwrap();
        let log = SequencedLog::new(Arc::new(ContendedBackend {
            inner: SqliteLogBackend::new(db.clone(), "events"),
            other,
        }))
        .with_poll_interval(Duration::from_millis(10));

        let index = log
            .send(&[transfer_event("X1")], SendMode::Blocking)
            .await
            .unwrap();
        assert_eq!(index, Some(1));
        assert_eq!(log.last_finalized().await.unwrap(), 2);

        let ours = db.log_read("events", 1, 1).unwrap();
        let events = decode_batch(&ours[0]).unwrap();
        assert_eq!(events[0].as_ref().unwrap(), &transfer_event("X1"));
    }

    #[tokio::test]
    async fn test_blocking_send_returns_read_error() {
        let log = SequencedLog::new(Arc::new(UnreadableBackend {
            inner: SqliteLogBackend::new(test_db(), "events"),
        }))
        .with_poll_interval(Duration::from_millis(10));

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            log.send(&[transfer_event("X1")], SendMode::Blocking),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(CustodyError::Transient(_))));
    }
}
