// Copyright (c) 2024 The Botho Foundation

//! Durable FIFO work queue shared between producer and consumer processes.
//!
//! Delivery is at-least-once: `pop` claims the head item for a visibility
//! timeout and `ack` removes it once the consumer has committed. An item
//! whose consumer died before acking is handed out again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use custody_core::{ChainId, CustodyError};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::db::Database;

/// An item handed to a consumer, to be acked after commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub claim: String,
    pub payload: String,
}

/// A named FIFO queue.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Append an item. Failures are logged and returned, never panic.
    async fn push(&self, item: &str) -> Result<(), CustodyError>;

    /// Wait until an item is available and claim it.
    async fn pop(&self) -> Result<QueueItem, CustodyError>;

    /// Remove a claimed item.
    async fn ack(&self, item: &QueueItem) -> Result<(), CustodyError>;

    /// Items waiting for a consumer.
    async fn length(&self) -> Result<u64, CustodyError>;
}

/// Queue name for a chain's block units.
pub fn block_queue_name(prefix: &str, chain: ChainId) -> String {
    format!("{}-{}-blocks-queue", prefix, chain.as_str().to_lowercase())
}

/// Queue stored in the shared SQLite database.
#[derive(Clone)]
pub struct SqliteQueue {
    db: Database,
    name: String,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

impl SqliteQueue {
    pub fn new(db: Database, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
            poll_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Claim the head item if there is one.
    pub fn try_pop(&self) -> Result<Option<QueueItem>, CustodyError> {
        let claim = Uuid::new_v4().to_string();
        let claimed = self.db.queue_claim(
            &self.name,
            &claim,
            Utc::now().timestamp_millis(),
            self.visibility_timeout.as_millis() as i64,
        )?;

        Ok(claimed.map(|(id, payload)| QueueItem { id, claim, payload }))
    }
}

#[async_trait]
impl DurableQueue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, item: &str) -> Result<(), CustodyError> {
        match self.db.queue_push(&self.name, item) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(queue = %self.name, item, "Queue push failed: {}", e);
                Err(CustodyError::Transient(e.to_string()))
            }
        }
    }

    async fn pop(&self) -> Result<QueueItem, CustodyError> {
        loop {
            match self.try_pop() {
                Ok(Some(item)) => return Ok(item),
                Ok(None) => {}
                Err(e) => warn!(queue = %self.name, "Queue pop failed: {}", e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, item: &QueueItem) -> Result<(), CustodyError> {
        if !self.db.queue_ack(item.id, &item.claim)? {
            // Claim expired and the item went to another consumer
            debug!(queue = %self.name, id = item.id, "Ack for a claim that was lost");
        }
        Ok(())
    }

    async fn length(&self) -> Result<u64, CustodyError> {
        self.db.queue_len(
            &self.name,
            Utc::now().timestamp_millis(),
            self.visibility_timeout.as_millis() as i64,
        )
    }
}
