// Copyright (c) 2024 The Botho Foundation

//! SQLite store shared by every custody worker.
//!
//! Holds the address directory, deposit and withdrawal documents, scan
//! cursors, the durable queue table and the sequenced log table. Several
//! worker processes open the same file, so the connection runs in WAL mode
//! with a busy timeout and every write is a single statement or an
//! immediate transaction.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use custody_core::{
    AvsSignature, ChainId, Cursor, CursorKey, CustodyError, DepositAddress, DepositRecord,
    DepositedToken, WithdrawalRecord, WithdrawalStatus,
};
use rusqlite::{
    ffi, params, types::Type, Connection, Result as SqliteResult, Row, TransactionBehavior,
};
use serde::de::DeserializeOwned;

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Filter for [`Database::find_withdrawals`].
#[derive(Debug, Clone, Default)]
pub struct WithdrawalQuery {
    pub status: Option<WithdrawalStatus>,
    pub target_chain: Option<ChainId>,
    pub transfer_tx_absent: bool,
}

impl WithdrawalQuery {
    /// Approved, unsettled withdrawals bound for `chain`.
    pub fn executable(chain: ChainId) -> Self {
        Self {
            status: Some(WithdrawalStatus::Approved),
            target_chain: Some(chain),
            transfer_tx_absent: true,
        }
    }
}

const DEPOSIT_COLUMNS: &str = "chain, tx_hash, block, agent, account, user, address, token, \
     contract, amount, decimals, extra, confirmed, transferred, transfer_tx";

const WITHDRAWAL_COLUMNS: &str = "id, agent, signatures, token, target_chain, amount, \
     to_address, status, avs_signature, transfer_tx";

impl Database {
    /// Open or create the database.
    pub fn open(path: &str) -> Result<Self, CustodyError> {
        let conn = Connection::open(path).map_err(|e| db_error("Failed to open database", e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| db_error("Failed to enable WAL", e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| db_error("Failed to set busy timeout", e))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, CustodyError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| db_error("Failed to open in-memory database", e))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, CustodyError> {
        self.conn
            .lock()
            .map_err(|e| CustodyError::Database(format!("Lock error: {}", e)))
    }

    /// Run database migrations.
    pub fn migrate(&self) -> Result<(), CustodyError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deposit_addresses (
                agent TEXT NOT NULL,
                account INTEGER NOT NULL,
                chain TEXT NOT NULL,
                user INTEGER NOT NULL,
                address TEXT NOT NULL,
                memo TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (agent, account, chain, user)
            );

            CREATE INDEX IF NOT EXISTS idx_addresses_chain ON deposit_addresses(chain, active);

            CREATE TABLE IF NOT EXISTS deposits (
                tx_hash TEXT PRIMARY KEY,
                chain TEXT NOT NULL,
                block INTEGER,
                agent TEXT NOT NULL,
                account INTEGER NOT NULL,
                user INTEGER NOT NULL,
                address TEXT NOT NULL,
                token TEXT NOT NULL,
                contract TEXT,
                amount TEXT NOT NULL,
                decimals INTEGER NOT NULL,
                extra TEXT,
                confirmed INTEGER NOT NULL,
                transferred INTEGER NOT NULL DEFAULT 0,
                transfer_tx TEXT,
                logical_time INTEGER,
                published INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_pending ON deposits(chain, transferred);
            CREATE INDEX IF NOT EXISTS idx_deposits_unpublished ON deposits(chain, published);

            CREATE TABLE IF NOT EXISTS withdrawals (
                id TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                signatures TEXT NOT NULL,
                token TEXT NOT NULL,
                target_chain TEXT NOT NULL,
                amount INTEGER NOT NULL,
                to_address TEXT NOT NULL,
                status TEXT NOT NULL,
                avs_signature TEXT,
                transfer_tx TEXT,
                published INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_withdrawals_pending ON withdrawals(target_chain, status);

            CREATE TABLE IF NOT EXISTS cursors (
                chain TEXT NOT NULL,
                asset_class TEXT NOT NULL,
                position INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (chain, asset_class)
            );

            CREATE TABLE IF NOT EXISTS queue_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                claim_token TEXT,
                claimed_at INTEGER,
                enqueued_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_items ON queue_items(queue, id);

            CREATE TABLE IF NOT EXISTS log_batches (
                list TEXT NOT NULL,
                idx INTEGER NOT NULL,
                payload TEXT NOT NULL,
                appended_at INTEGER NOT NULL,
                PRIMARY KEY (list, idx)
            );
            "#,
        )
        .map_err(|e| db_error("Migration failed", e))?;

        Ok(())
    }

    // ===== Address directory =====

    /// Insert or replace a deposit address.
    pub fn upsert_deposit_address(&self, address: &DepositAddress) -> Result<(), CustodyError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO deposit_addresses (agent, account, chain, user, address, memo, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (agent, account, chain, user) DO UPDATE SET
                address = excluded.address,
                memo = excluded.memo,
                active = excluded.active
            "#,
            params![
                address.agent,
                address.account as i64,
                address.chain.as_str(),
                address.user as i64,
                address.address,
                address.memo,
                address.active,
            ],
        )
        .map_err(|e| db_error("Upsert address failed", e))?;
        Ok(())
    }

    /// Active deposit addresses of a chain.
    pub fn find_active_deposit_addresses(
        &self,
        chain: ChainId,
    ) -> Result<Vec<DepositAddress>, CustodyError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT agent, account, chain, user, address, memo, active
                FROM deposit_addresses WHERE chain = ?1 AND active = 1
                ORDER BY agent, account, user
                "#,
            )
            .map_err(|e| db_error("Prepare failed", e))?;

        let addresses = stmt
            .query_map(params![chain.as_str()], row_to_address)
            .map_err(|e| db_error("Query failed", e))?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| db_error("Row mapping failed", e))?;

        Ok(addresses)
    }

    // ===== Deposits =====

    /// Insert a deposit unless its `tx_hash` is already recorded.
    ///
    /// Returns `false` when the transaction was processed before.
    pub fn insert_deposit_if_absent(&self, record: &DepositRecord) -> Result<bool, CustodyError> {
        self.insert_deposit(record, false)
    }

    /// Insert a deposit learned from the sequenced log; it is never
    /// republished. A later sweep reported by the log is applied to an
    /// existing row.
    pub fn record_observed_deposit(&self, record: &DepositRecord) -> Result<bool, CustodyError> {
        let inserted = self.insert_deposit(record, true)?;
        if !inserted && record.transferred {
            if let Some(tx) = &record.transfer_tx {
                self.mark_deposit_transferred(&record.tx_hash, tx)?;
            }
        }
        Ok(inserted)
    }

    fn insert_deposit(
        &self,
        record: &DepositRecord,
        published: bool,
    ) -> Result<bool, CustodyError> {
        let extra = record
            .extra
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        let result = conn.execute(
            r#"
            INSERT INTO deposits (
                chain, tx_hash, block, agent, account, user, address, token, contract,
                amount, decimals, extra, confirmed, transferred, transfer_tx,
                logical_time, published, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18
            )
            "#,
            params![
                record.chain.as_str(),
                record.tx_hash,
                record.block.map(|b| b as i64),
                record.agent,
                record.account as i64,
                record.user as i64,
                record.address,
                record.deposit.token,
                record.deposit.contract,
                record.deposit.amount,
                record.deposit.decimals as i64,
                extra,
                record.confirmed,
                record.transferred,
                record.transfer_tx,
                record.logical_time().map(|lt| lt as i64),
                published,
                Utc::now().timestamp_millis(),
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(db_error("Insert deposit failed", e)),
        }
    }

    /// Get a deposit by transaction hash.
    pub fn get_deposit(&self, tx_hash: &str) -> Result<Option<DepositRecord>, CustodyError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM deposits WHERE tx_hash = ?1", DEPOSIT_COLUMNS);
        conn.query_row(&sql, params![tx_hash], row_to_deposit)
            .optional()
            .map_err(|e| db_error("Query failed", e))
    }

    /// Record the sweep that moved a deposit into the vault.
    ///
    /// Returns `false` if the deposit was already marked.
    pub fn mark_deposit_transferred(
        &self,
        tx_hash: &str,
        sweep_tx: &str,
    ) -> Result<bool, CustodyError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE deposits SET transferred = 1, transfer_tx = ?2 \
                 WHERE tx_hash = ?1 AND transferred = 0",
                params![tx_hash, sweep_tx],
            )
            .map_err(|e| db_error("Update failed", e))?;
        Ok(changed == 1)
    }

    /// Deposits of a chain still waiting for a sweep, oldest first.
    pub fn find_unswept_deposits(
        &self,
        chain: ChainId,
    ) -> Result<Vec<DepositRecord>, CustodyError> {
        self.query_deposits(
            "chain = ?1 AND transferred = 0 ORDER BY created_at, tx_hash",
            chain,
        )
    }

    /// Swept deposits whose event has not reached the log yet.
    pub fn find_unpublished_deposits(
        &self,
        chain: ChainId,
    ) -> Result<Vec<DepositRecord>, CustodyError> {
        self.query_deposits(
            "chain = ?1 AND transferred = 1 AND published = 0 ORDER BY created_at, tx_hash",
            chain,
        )
    }

    fn query_deposits(
        &self,
        clause: &str,
        chain: ChainId,
    ) -> Result<Vec<DepositRecord>, CustodyError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM deposits WHERE {}", DEPOSIT_COLUMNS, clause);
        let mut stmt = conn.prepare(&sql).map_err(|e| db_error("Prepare failed", e))?;

        let deposits = stmt
            .query_map(params![chain.as_str()], row_to_deposit)
            .map_err(|e| db_error("Query failed", e))?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| db_error("Row mapping failed", e))?;

        Ok(deposits)
    }

    pub fn mark_deposits_published(&self, tx_hashes: &[String]) -> Result<(), CustodyError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("UPDATE deposits SET published = 1 WHERE tx_hash = ?1")
            .map_err(|e| db_error("Prepare failed", e))?;
        for tx_hash in tx_hashes {
            stmt.execute(params![tx_hash])
                .map_err(|e| db_error("Update failed", e))?;
        }
        Ok(())
    }

    /// Newest logical time recorded for a chain's native or token deposits.
    pub fn last_deposit_logical_time(
        &self,
        chain: ChainId,
        native: bool,
    ) -> Result<Option<u64>, CustodyError> {
        let conn = self.conn()?;
        let sql = if native {
            "SELECT MAX(logical_time) FROM deposits WHERE chain = ?1 AND contract IS NULL"
        } else {
            "SELECT MAX(logical_time) FROM deposits WHERE chain = ?1 AND contract IS NOT NULL"
        };
        let lt: Option<i64> = conn
            .query_row(sql, params![chain.as_str()], |row| row.get(0))
            .map_err(|e| db_error("Query failed", e))?;
        Ok(lt.map(|lt| lt as u64))
    }

    pub fn count_unswept(&self, chain: ChainId) -> Result<u64, CustodyError> {
        self.count(
            "SELECT COUNT(*) FROM deposits WHERE chain = ?1 AND transferred = 0",
            chain,
        )
    }

    // ===== Withdrawals =====

    /// Insert a withdrawal unless its id is already known.
    pub fn insert_withdrawal_if_absent(
        &self,
        record: &WithdrawalRecord,
    ) -> Result<bool, CustodyError> {
        let signatures = serde_json::to_string(&record.signatures)?;
        let token = serde_json::to_string(&record.token)?;
        let avs = record
            .avs_signature
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        let result = conn.execute(
            r#"
            INSERT INTO withdrawals (
                id, agent, signatures, token, target_chain, amount, to_address,
                status, avs_signature, transfer_tx, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.id,
                record.agent,
                signatures,
                token,
                record.target_chain.as_str(),
                record.amount as i64,
                record.to_address,
                record.status.as_str(),
                avs,
                record.transfer_tx,
                Utc::now().timestamp_millis(),
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(db_error("Insert withdrawal failed", e)),
        }
    }

    /// Get a withdrawal by id.
    pub fn get_withdrawal(&self, id: &str) -> Result<Option<WithdrawalRecord>, CustodyError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM withdrawals WHERE id = ?1", WITHDRAWAL_COLUMNS);
        conn.query_row(&sql, params![id], row_to_withdrawal)
            .optional()
            .map_err(|e| db_error("Query failed", e))
    }

    /// Withdrawals matching a filter, in insertion order.
    pub fn find_withdrawals(
        &self,
        query: &WithdrawalQuery,
    ) -> Result<Vec<WithdrawalRecord>, CustodyError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM withdrawals \
             WHERE (?1 IS NULL OR status = ?1) \
               AND (?2 IS NULL OR target_chain = ?2) \
               AND (?3 = 0 OR transfer_tx IS NULL) \
             ORDER BY rowid",
            WITHDRAWAL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| db_error("Prepare failed", e))?;

        let withdrawals = stmt
            .query_map(
                params![
                    query.status.map(|s| s.as_str()),
                    query.target_chain.map(|c| c.as_str()),
                    query.transfer_tx_absent,
                ],
                row_to_withdrawal,
            )
            .map_err(|e| db_error("Query failed", e))?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| db_error("Row mapping failed", e))?;

        Ok(withdrawals)
    }

    /// Advance `initialized -> approved`, attaching the AVS signature.
    pub fn approve_withdrawal(
        &self,
        id: &str,
        signature: &AvsSignature,
    ) -> Result<bool, CustodyError> {
        let avs = serde_json::to_string(signature)?;
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE withdrawals SET status = 'approved', avs_signature = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND status = 'initialized'",
                params![id, avs, Utc::now().timestamp_millis()],
            )
            .map_err(|e| db_error("Update failed", e))?;
        Ok(changed == 1)
    }

    /// Settle a withdrawal. Only moves an approved or in-progress record
    /// without a transaction; returns `false` otherwise.
    pub fn mark_withdrawal_transferred(&self, id: &str, tx: &str) -> Result<bool, CustodyError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE withdrawals SET status = 'transferred', transfer_tx = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND transfer_tx IS NULL AND status IN ('approved', 'in-progress')",
                params![id, tx, Utc::now().timestamp_millis()],
            )
            .map_err(|e| db_error("Update failed", e))?;
        Ok(changed == 1)
    }

    /// Settled withdrawals of a chain whose event has not reached the log,
    /// grouped by settlement transaction.
    pub fn find_unpublished_withdrawals(
        &self,
        chain: ChainId,
    ) -> Result<BTreeMap<String, Vec<String>>, CustodyError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT transfer_tx, id FROM withdrawals \
                 WHERE target_chain = ?1 AND status = 'transferred' AND published = 0 \
                   AND transfer_tx IS NOT NULL \
                 ORDER BY rowid",
            )
            .map_err(|e| db_error("Prepare failed", e))?;

        let rows = stmt
            .query_map(params![chain.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| db_error("Query failed", e))?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| db_error("Row mapping failed", e))?;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (tx, id) in rows {
            groups.entry(tx).or_default().push(id);
        }
        Ok(groups)
    }

    pub fn mark_withdrawals_published(&self, ids: &[String]) -> Result<(), CustodyError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("UPDATE withdrawals SET published = 1 WHERE id = ?1")
            .map_err(|e| db_error("Prepare failed", e))?;
        for id in ids {
            stmt.execute(params![id])
                .map_err(|e| db_error("Update failed", e))?;
        }
        Ok(())
    }

    pub fn count_pending_withdrawals(&self, chain: ChainId) -> Result<u64, CustodyError> {
        self.count(
            "SELECT COUNT(*) FROM withdrawals \
             WHERE target_chain = ?1 AND status = 'approved' AND transfer_tx IS NULL",
            chain,
        )
    }

    fn count(&self, sql: &str, chain: ChainId) -> Result<u64, CustodyError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(sql, params![chain.as_str()], |row| row.get(0))
            .map_err(|e| db_error("Count failed", e))?;
        Ok(count as u64)
    }

    // ===== Cursors =====

    /// Last committed position for a cursor.
    pub fn load_cursor(&self, key: &CursorKey) -> Result<Option<u64>, CustodyError> {
        let conn = self.conn()?;
        let position: Option<i64> = conn
            .query_row(
                "SELECT position FROM cursors WHERE chain = ?1 AND asset_class = ?2",
                params![key.chain, key.asset_class],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_error("Query failed", e))?;
        Ok(position.map(|p| p as u64))
    }

    /// Persist a cursor. A stored position is never moved backwards.
    pub fn save_cursor(&self, cursor: &Cursor) -> Result<(), CustodyError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO cursors (chain, asset_class, position, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (chain, asset_class) DO UPDATE SET
                position = excluded.position,
                updated_at = excluded.updated_at
            WHERE excluded.position >= cursors.position
            "#,
            params![
                cursor.key.chain,
                cursor.key.asset_class,
                cursor.position as i64,
                Utc::now().timestamp_millis(),
            ],
        )
        .map_err(|e| db_error("Save cursor failed", e))?;
        Ok(())
    }

    pub fn list_cursors(&self) -> Result<Vec<Cursor>, CustodyError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT chain, asset_class, position FROM cursors ORDER BY chain, asset_class")
            .map_err(|e| db_error("Prepare failed", e))?;

        let cursors = stmt
            .query_map([], |row| {
                Ok(Cursor::new(
                    CursorKey {
                        chain: row.get(0)?,
                        asset_class: row.get(1)?,
                    },
                    row.get::<_, i64>(2)? as u64,
                ))
            })
            .map_err(|e| db_error("Query failed", e))?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| db_error("Row mapping failed", e))?;

        Ok(cursors)
    }

    // ===== Queue table =====

    /// Append an item to the tail of a queue.
    pub fn queue_push(&self, queue: &str, payload: &str) -> Result<i64, CustodyError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO queue_items (queue, payload, enqueued_at) VALUES (?1, ?2, ?3)",
            params![queue, payload, Utc::now().timestamp_millis()],
        )
        .map_err(|e| db_error("Queue push failed", e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim the oldest item that is unclaimed or whose claim has expired.
    pub fn queue_claim(
        &self,
        queue: &str,
        claim_token: &str,
        now_ms: i64,
        visibility_ms: i64,
    ) -> Result<Option<(i64, String)>, CustodyError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_error("Begin failed", e))?;

        let head: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, payload FROM queue_items \
                 WHERE queue = ?1 AND (claim_token IS NULL OR claimed_at <= ?2) \
                 ORDER BY id LIMIT 1",
                params![queue, now_ms - visibility_ms],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| db_error("Queue claim failed", e))?;

        if let Some((id, _)) = &head {
            tx.execute(
                "UPDATE queue_items SET claim_token = ?2, claimed_at = ?3 WHERE id = ?1",
                params![id, claim_token, now_ms],
            )
            .map_err(|e| db_error("Queue claim failed", e))?;
        }

        tx.commit().map_err(|e| db_error("Commit failed", e))?;
        Ok(head)
    }

    /// Remove a claimed item. Returns `false` if the claim was lost.
    pub fn queue_ack(&self, id: i64, claim_token: &str) -> Result<bool, CustodyError> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM queue_items WHERE id = ?1 AND claim_token = ?2",
                params![id, claim_token],
            )
            .map_err(|e| db_error("Queue ack failed", e))?;
        Ok(removed == 1)
    }

    /// Items available to a consumer: unclaimed or with an expired claim.
    pub fn queue_len(
        &self,
        queue: &str,
        now_ms: i64,
        visibility_ms: i64,
    ) -> Result<u64, CustodyError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_items \
                 WHERE queue = ?1 AND (claim_token IS NULL OR claimed_at <= ?2)",
                params![queue, now_ms - visibility_ms],
                |row| row.get(0),
            )
            .map_err(|e| db_error("Queue length failed", e))?;
        Ok(count as u64)
    }

    // ===== Log table =====

    /// Append a batch to a log list and return its index.
    pub fn log_append(&self, list: &str, payload: &str) -> Result<u64, CustodyError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_error("Begin failed", e))?;

        let idx: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(idx) + 1, 0) FROM log_batches WHERE list = ?1",
                params![list],
                |row| row.get(0),
            )
            .map_err(|e| db_error("Log append failed", e))?;
        tx.execute(
            "INSERT INTO log_batches (list, idx, payload, appended_at) VALUES (?1, ?2, ?3, ?4)",
            params![list, idx, payload, Utc::now().timestamp_millis()],
        )
        .map_err(|e| db_error("Log append failed", e))?;

        tx.commit().map_err(|e| db_error("Commit failed", e))?;
        Ok(idx as u64)
    }

    /// Number of batches in a log list.
    pub fn log_len(&self, list: &str) -> Result<u64, CustodyError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM log_batches WHERE list = ?1",
                params![list],
                |row| row.get(0),
            )
            .map_err(|e| db_error("Log length failed", e))?;
        Ok(count as u64)
    }

    /// Up to `limit` batches starting at index `from`.
    pub fn log_read(
        &self,
        list: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<String>, CustodyError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT payload FROM log_batches WHERE list = ?1 AND idx >= ?2 \
                 ORDER BY idx LIMIT ?3",
            )
            .map_err(|e| db_error("Prepare failed", e))?;

        let batches = stmt
            .query_map(params![list, from as i64, limit as i64], |row| row.get(0))
            .map_err(|e| db_error("Query failed", e))?
            .collect::<SqliteResult<Vec<String>>>()
            .map_err(|e| db_error("Row mapping failed", e))?;

        Ok(batches)
    }
}

fn db_error(context: &str, e: impl std::fmt::Display) -> CustodyError {
    CustodyError::Database(format!("{}: {}", context, e))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn parse_column<T>(idx: usize, value: &str) -> SqliteResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_json_column<T: DeserializeOwned>(idx: usize, value: &str) -> SqliteResult<T> {
    serde_json::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_address(row: &Row) -> SqliteResult<DepositAddress> {
    let chain: String = row.get(2)?;
    Ok(DepositAddress {
        agent: row.get(0)?,
        account: row.get::<_, i64>(1)? as u32,
        chain: parse_column(2, &chain)?,
        user: row.get::<_, i64>(3)? as u64,
        address: row.get(4)?,
        memo: row.get(5)?,
        active: row.get(6)?,
    })
}

fn row_to_deposit(row: &Row) -> SqliteResult<DepositRecord> {
    let chain: String = row.get(0)?;
    let extra: Option<String> = row.get(11)?;

    Ok(DepositRecord {
        chain: parse_column(0, &chain)?,
        tx_hash: row.get(1)?,
        block: row.get::<_, Option<i64>>(2)?.map(|b| b as u64),
        agent: row.get(3)?,
        account: row.get::<_, i64>(4)? as u32,
        user: row.get::<_, i64>(5)? as u64,
        address: row.get(6)?,
        deposit: DepositedToken {
            token: row.get(7)?,
            contract: row.get(8)?,
            amount: row.get(9)?,
            decimals: row.get::<_, i64>(10)? as u8,
        },
        extra: extra.as_deref().map(|e| parse_json_column(11, e)).transpose()?,
        confirmed: row.get(12)?,
        transferred: row.get(13)?,
        transfer_tx: row.get(14)?,
    })
}

fn row_to_withdrawal(row: &Row) -> SqliteResult<WithdrawalRecord> {
    let signatures: String = row.get(2)?;
    let token: String = row.get(3)?;
    let chain: String = row.get(4)?;
    let status: String = row.get(7)?;
    let avs: Option<String> = row.get(8)?;

    Ok(WithdrawalRecord {
        id: row.get(0)?,
        agent: row.get(1)?,
        signatures: parse_json_column(2, &signatures)?,
        token: parse_json_column(3, &token)?,
        target_chain: parse_column(4, &chain)?,
        amount: row.get::<_, i64>(5)? as u64,
        to_address: row.get(6)?,
        status: parse_column(7, &status)?,
        avs_signature: avs.as_deref().map(|a| parse_json_column(8, a)).transpose()?,
        transfer_tx: row.get(9)?,
    })
}

/// Extension trait for optional query results.
trait OptionalExt<T> {
    fn optional(self) -> SqliteResult<Option<T>>;
}

impl<T> OptionalExt<T> for SqliteResult<T> {
    fn optional(self) -> SqliteResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::{AssetClass, TokenInfo, Transfer};

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn address(user: u64, addr: &str, active: bool) -> DepositAddress {
        DepositAddress {
            agent: "a1".to_string(),
            account: 0,
            chain: ChainId::Solana,
            user,
            address: addr.to_string(),
            memo: None,
            active,
        }
    }

    fn deposit(tx_hash: &str) -> DepositRecord {
        let transfer = Transfer {
            tx_hash: tx_hash.to_string(),
            address: "ADDR1".to_string(),
            change: "1000000000".to_string(),
            contract: None,
            memo: None,
            lt: None,
        };
        DepositRecord::from_transfer(
            ChainId::Solana,
            &address(7, "ADDR1", true),
            &transfer,
            &TokenInfo::native("SOL", 9),
            Some(55),
        )
    }

    fn withdrawal(id: &str, status: WithdrawalStatus) -> WithdrawalRecord {
        WithdrawalRecord {
            id: id.to_string(),
            agent: "a1".to_string(),
            signatures: vec!["sig-a".to_string()],
            token: TokenInfo::native("TON", 9),
            target_chain: ChainId::Ton,
            amount: 500,
            to_address: "EQ-dest".to_string(),
            status,
            avs_signature: Some(AvsSignature::new("ab01", "cd02")),
            transfer_tx: None,
        }
    }

    #[test]
    fn test_active_addresses() {
        let db = test_db();
        db.upsert_deposit_address(&address(1, "ADDR1", true)).unwrap();
        db.upsert_deposit_address(&address(2, "ADDR2", false)).unwrap();

        let active = db.find_active_deposit_addresses(ChainId::Solana).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address, "ADDR1");
        assert!(db.find_active_deposit_addresses(ChainId::Ton).unwrap().is_empty());

        // Same key replaces the row
        db.upsert_deposit_address(&address(1, "ADDR1b", true)).unwrap();
        let active = db.find_active_deposit_addresses(ChainId::Solana).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address, "ADDR1b");
    }

    #[test]
    fn test_deposit_insert_is_idempotent() {
        let db = test_db();
        let record = deposit("T1");

        assert!(db.insert_deposit_if_absent(&record).unwrap());
        assert!(!db.insert_deposit_if_absent(&record).unwrap());

        let stored = db.get_deposit("T1").unwrap().unwrap();
        assert_eq!(stored, record);
        assert_eq!(db.count_unswept(ChainId::Solana).unwrap(), 1);
    }

    #[test]
    fn test_mark_deposit_transferred_once() {
        let db = test_db();
        db.insert_deposit_if_absent(&deposit("T1")).unwrap();

        assert!(db.mark_deposit_transferred("T1", "SWEEP1").unwrap());
        assert!(!db.mark_deposit_transferred("T1", "SWEEP2").unwrap());

        let stored = db.get_deposit("T1").unwrap().unwrap();
        assert!(stored.transferred);
        assert_eq!(stored.transfer_tx.as_deref(), Some("SWEEP1"));
        assert!(db.find_unswept_deposits(ChainId::Solana).unwrap().is_empty());

        assert_eq!(db.find_unpublished_deposits(ChainId::Solana).unwrap().len(), 1);
        db.mark_deposits_published(&["T1".to_string()]).unwrap();
        assert!(db.find_unpublished_deposits(ChainId::Solana).unwrap().is_empty());
    }

    #[test]
    fn test_observed_deposits_are_not_republished() {
        let db = test_db();
        let mut record = deposit("T1");
        record.mark_transferred("SWEEP1");

        assert!(db.record_observed_deposit(&record).unwrap());
        assert!(db.find_unpublished_deposits(ChainId::Solana).unwrap().is_empty());
    }

    #[test]
    fn test_last_logical_time_per_class() {
        let db = test_db();
        let mut native = deposit("T1");
        native.chain = ChainId::Ton;
        native.extra = Some(serde_json::json!({"lt": 900}));
        let mut token = deposit("T2");
        token.chain = ChainId::Ton;
        token.deposit.contract = Some("JETTON".to_string());
        token.extra = Some(serde_json::json!({"lt": 1200}));

        db.insert_deposit_if_absent(&native).unwrap();
        db.insert_deposit_if_absent(&token).unwrap();

        assert_eq!(db.last_deposit_logical_time(ChainId::Ton, true).unwrap(), Some(900));
        assert_eq!(db.last_deposit_logical_time(ChainId::Ton, false).unwrap(), Some(1200));
        assert_eq!(db.last_deposit_logical_time(ChainId::Solana, true).unwrap(), None);
    }

    #[test]
    fn test_withdrawal_queries() {
        let db = test_db();
        assert!(db
            .insert_withdrawal_if_absent(&withdrawal("W1", WithdrawalStatus::Approved))
            .unwrap());
        assert!(!db
            .insert_withdrawal_if_absent(&withdrawal("W1", WithdrawalStatus::Approved))
            .unwrap());
        db.insert_withdrawal_if_absent(&withdrawal("W2", WithdrawalStatus::Initialized))
            .unwrap();

        let pending = db
            .find_withdrawals(&WithdrawalQuery::executable(ChainId::Ton))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "W1");
        assert_eq!(pending[0].avs_signature, Some(AvsSignature::new("ab01", "cd02")));

        let all = db.find_withdrawals(&WithdrawalQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(db
            .find_withdrawals(&WithdrawalQuery::executable(ChainId::Solana))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_withdrawal_status_only_moves_forward() {
        let db = test_db();
        db.insert_withdrawal_if_absent(&withdrawal("W1", WithdrawalStatus::Initialized))
            .unwrap();

        // Not approved yet, so it cannot settle
        assert!(!db.mark_withdrawal_transferred("W1", "X0").unwrap());

        assert!(db.approve_withdrawal("W1", &AvsSignature::new("ab", "cd")).unwrap());
        assert!(!db.approve_withdrawal("W1", &AvsSignature::new("ef", "01")).unwrap());

        assert!(db.mark_withdrawal_transferred("W1", "X1").unwrap());
        assert!(!db.mark_withdrawal_transferred("W1", "X2").unwrap());
        assert!(!db.approve_withdrawal("W1", &AvsSignature::new("ab", "cd")).unwrap());

        let stored = db.get_withdrawal("W1").unwrap().unwrap();
        assert_eq!(stored.status, WithdrawalStatus::Transferred);
        assert_eq!(stored.transfer_tx.as_deref(), Some("X1"));
        assert_eq!(stored.avs_signature, Some(AvsSignature::new("ab", "cd")));
    }

    #[test]
    fn test_unpublished_withdrawals_grouped_by_tx() {
        let db = test_db();
        for id in ["W1", "W2", "W3"] {
            db.insert_withdrawal_if_absent(&withdrawal(id, WithdrawalStatus::Approved))
                .unwrap();
        }
        db.mark_withdrawal_transferred("W1", "X1").unwrap();
        db.mark_withdrawal_transferred("W2", "X1").unwrap();
        db.mark_withdrawal_transferred("W3", "X2").unwrap();
        db.mark_withdrawals_published(&["W3".to_string()]).unwrap();

        let groups = db.find_unpublished_withdrawals(ChainId::Ton).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["X1"], vec!["W1".to_string(), "W2".to_string()]);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let db = test_db();
        let key = CursorKey::chain(ChainId::Solana, AssetClass::Blocks);
        assert_eq!(db.load_cursor(&key).unwrap(), None);

        db.save_cursor(&Cursor::new(key.clone(), 50)).unwrap();
        db.save_cursor(&Cursor::new(key.clone(), 40)).unwrap();
        assert_eq!(db.load_cursor(&key).unwrap(), Some(50));

        db.save_cursor(&Cursor::new(key.clone(), 55)).unwrap();
        assert_eq!(db.load_cursor(&key).unwrap(), Some(55));
        assert_eq!(db.list_cursors().unwrap().len(), 1);
    }

    #[test]
    fn test_queue_claim_and_redelivery() {
        let db = test_db();
        db.queue_push("q", "51").unwrap();
        db.queue_push("q", "52").unwrap();
        db.queue_push("other", "x").unwrap();
        assert_eq!(db.queue_len("q", 1_000, 100).unwrap(), 2);

        let (id, payload) = db.queue_claim("q", "c1", 1_000, 100).unwrap().unwrap();
        assert_eq!(payload, "51");
        assert_eq!(db.queue_len("q", 1_000, 100).unwrap(), 1);

        // Second consumer gets the next item while the claim is live
        let (_, next) = db.queue_claim("q", "c2", 1_050, 100).unwrap().unwrap();
        assert_eq!(next, "52");
        assert!(db.queue_claim("q", "c3", 1_050, 100).unwrap().is_none());

        // Expired claim is handed out again, and the stale ack is refused
        let (again, payload) = db.queue_claim("q", "c3", 1_200, 100).unwrap().unwrap();
        assert_eq!((again, payload.as_str()), (id, "51"));
        assert!(!db.queue_ack(id, "c1").unwrap());
        assert!(db.queue_ack(id, "c3").unwrap());
    }

    #[test]
    fn test_log_append_and_read() {
        let db = test_db();
        assert_eq!(db.log_append("events", "[1]").unwrap(), 0);
        assert_eq!(db.log_append("events", "[2]").unwrap(), 1);
        assert_eq!(db.log_append("other", "[9]").unwrap(), 0);

        assert_eq!(db.log_len("events").unwrap(), 2);
        assert_eq!(db.log_read("events", 1, 10).unwrap(), vec!["[2]".to_string()]);
        assert_eq!(db.log_read("events", 0, 1).unwrap(), vec!["[1]".to_string()]);
        assert!(db.log_read("events", 2, 10).unwrap().is_empty());
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custody.db");
        let path = path.to_str().unwrap();

        let db = Database::open(path).unwrap();
        db.migrate().unwrap();
        db.insert_deposit_if_absent(&deposit("T1")).unwrap();
        drop(db);

        let reopened = Database::open(path).unwrap();
        reopened.migrate().unwrap();
        assert!(reopened.get_deposit("T1").unwrap().is_some());
    }
}
