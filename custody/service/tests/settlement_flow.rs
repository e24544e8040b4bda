// Copyright (c) 2024 The Botho Foundation

//! Integration tests for custody settlement
//!
//! These tests drive the workers together over one shared database:
//! - Deposit scanning, recording and sweeping
//! - Withdrawal execution
//! - Rebuilding a replica from the event log

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use custody_core::{
    events::decode_batch, AssetClass, ChainId, Cursor, CursorKey, LogEvent, TokenInfo,
    WithdrawTransfer, WithdrawalStatus,
};
use custody_service::{
    db::Database,
    executor::WithdrawalExecutor,
    log::SequencedLog,
    observer::LogObserver,
    processor::{BlockProcessor, Reconciler},
    producer::{BlockScanProducer, PollOutcome},
    queue::{block_queue_name, DurableQueue, SqliteQueue},
    test_utils::{
        approved_withdrawal, deposit_address, test_db, transfer, MockChainAdapter,
        StaticTokenRegistry,
    },
    worker::WorkerScheduler,
};
use futures::StreamExt;
use tokio::sync::broadcast;

const SOL_ADDR: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";

fn event_log(db: &Database) -> SequencedLog {
    SequencedLog::sqlite(db.clone(), "events").with_poll_interval(Duration::from_millis(10))
}

fn block_queue(db: &Database, chain: ChainId) -> SqliteQueue {
    SqliteQueue::new(db.clone(), block_queue_name("custody", chain))
        .with_poll_interval(Duration::from_millis(10))
}

async fn logged_events(log: &SequencedLog) -> Vec<LogEvent> {
    let len = log.last_finalized().await.unwrap();
    let batches: Vec<_> = log.batches(0).take(len as usize).collect().await;
    batches
        .into_iter()
        .flat_map(|batch| decode_batch(&batch.unwrap().0).unwrap())
        .map(|event| event.unwrap())
        .collect()
}

/// Solana deployment: user 7 of agent `a1` owns `SOL_ADDR`, the producer
/// last saw unit 50.
fn solana_fixture() -> (Database, Arc<MockChainAdapter>, SequencedLog) {
    let db = test_db();
    db.upsert_deposit_address(&deposit_address("a1", 0, ChainId::Solana, 7, SOL_ADDR))
        .unwrap();
    db.save_cursor(&Cursor::new(
        CursorKey::chain(ChainId::Solana, AssetClass::Blocks),
        50,
    ))
    .unwrap();

    let adapter = Arc::new(MockChainAdapter::new(ChainId::Solana));
    adapter.set_head(55);
    adapter.add_unit(55, vec![transfer("T1", SOL_ADDR, "1000000000")]);

    let log = event_log(&db);
    (db, adapter, log)
}

fn reconciler(db: &Database, adapter: Arc<MockChainAdapter>, log: &SequencedLog) -> Reconciler {
    let tokens = Arc::new(StaticTokenRegistry::new(vec![TokenInfo::contract(
        "USDC",
        "USDC-MINT",
        6,
    )]));
    Reconciler::new(adapter, tokens, db.clone(), log.clone())
}

// ============================================================================
// Deposit Tests
// ============================================================================

mod deposits {
    use super::*;

    #[tokio::test]
    async fn test_gap_is_enqueued_and_deposit_swept() {
        let (db, adapter, log) = solana_fixture();
        let queue = Arc::new(block_queue(&db, ChainId::Solana));

        // 1. Producer resumes at 50 and closes the gap to 55
        let mut producer =
            BlockScanProducer::new(adapter.clone(), queue.clone(), db.clone(), Duration::ZERO)
                .unwrap();
        assert_eq!(producer.last_observed(), Some(50));
        assert_eq!(
            producer.poll_once().await.unwrap(),
            PollOutcome::Enqueued {
                enqueued: 5,
                position: 55
            }
        );
        assert_eq!(queue.length().await.unwrap(), 5);

        // 2. Each unit is reconciled in order and acked; while the sweep is
        //    in flight the deposit is stored but not yet transferred
        let in_flight = Arc::new(Mutex::new(Vec::new()));
        let observed = in_flight.clone();
        let store = db.clone();
        adapter.on_sweep(move |deposits| {
            for deposit in deposits {
                let stored = store.get_deposit(&deposit.tx_hash).unwrap().unwrap();
                observed.lock().unwrap().push((stored.tx_hash, stored.transferred));
            }
        });

        let reconciler = reconciler(&db, adapter.clone(), &log);
        let mut positions = vec![];
        while let Some(item) = queue.try_pop().unwrap() {
            let position: u64 = item.payload.parse().unwrap();
            reconciler.reconcile_unit(position).await.unwrap();
            queue.ack(&item).await.unwrap();
            positions.push(position);
        }
        assert_eq!(positions, vec![51, 52, 53, 54, 55]);
        assert_eq!(*in_flight.lock().unwrap(), vec![("T1".to_string(), false)]);

        // 3. The deposit is recorded once, swept and published
        let record = db.get_deposit("T1").unwrap().unwrap();
        assert_eq!(record.agent, "a1");
        assert_eq!(record.user, 7);
        assert_eq!(record.block, Some(55));
        assert_eq!(record.deposit.amount, "1000000000");
        assert_eq!(record.deposit.decimals, 9);
        assert!(record.transferred);
        assert_eq!(record.transfer_tx.as_deref(), Some("X1"));
        assert_eq!(adapter.sweeps(), vec![vec!["T1".to_string()]]);

        let events = logged_events(&log).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            LogEvent::Deposit(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].tx_hash, "T1");
                assert!(records[0].transferred);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(db.find_unpublished_deposits(ChainId::Solana).unwrap().is_empty());

        // 4. A restarted producer resumes at 55
        let restarted =
            BlockScanProducer::new(adapter, queue, db.clone(), Duration::ZERO).unwrap();
        assert_eq!(restarted.last_observed(), Some(55));
    }

    #[tokio::test]
    async fn test_processor_worker_settles_after_failed_sweep() {
        let (db, adapter, log) = solana_fixture();
        let queue: Arc<dyn DurableQueue> = Arc::new(block_queue(&db, ChainId::Solana));
        queue.push("55").await.unwrap();

        // The first sweep is rejected; records stay pending
        adapter.fail_sweeps(true);
        let reconciler = reconciler(&db, adapter.clone(), &log);
        assert!(reconciler.reconcile_unit(55).await.is_err());
        assert_eq!(db.count_unswept(ChainId::Solana).unwrap(), 1);
        adapter.fail_sweeps(false);

        // The processor's startup pass sweeps them
        let processor = BlockProcessor::new(reconciler, queue.clone(), Duration::from_secs(60));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = WorkerScheduler::new(3).with_retry_delay(Duration::from_millis(10));
        let handle = tokio::spawn(async move { scheduler.run(processor, shutdown_rx).await });

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if db.count_unswept(ChainId::Solana).unwrap() == 0
                    && queue.length().await.unwrap() == 0
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok(), "processor did not settle");

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        let record = db.get_deposit("T1").unwrap().unwrap();
        assert_eq!(record.transfer_tx.as_deref(), Some("X1"));
        assert_eq!(adapter.sweeps(), vec![vec!["T1".to_string()]]);
    }
}

// ============================================================================
// Withdrawal Tests
// ============================================================================

mod withdrawals {
    use super::*;

    #[tokio::test]
    async fn test_approved_withdrawal_is_released_once() {
        let db = test_db();
        db.insert_withdrawal_if_absent(&approved_withdrawal("W1", ChainId::Ton, 500))
            .unwrap();
        let adapter = Arc::new(MockChainAdapter::new(ChainId::Ton));
        let log = event_log(&db);
        let executor =
            WithdrawalExecutor::new(adapter.clone(), db.clone(), log.clone(), Duration::ZERO);

        let report = executor.execute_once().await.unwrap();
        assert_eq!(
            report.settled,
            vec![WithdrawTransfer {
                withdraws: vec!["W1".to_string()],
                tx_hash: "X1".to_string(),
            }]
        );

        let record = db.get_withdrawal("W1").unwrap().unwrap();
        assert_eq!(record.status, WithdrawalStatus::Transferred);
        assert_eq!(record.transfer_tx.as_deref(), Some("X1"));

        let events = logged_events(&log).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            LogEvent::TransferWithdraw(t) => {
                assert_eq!(t.tx_hash, "X1");
                assert_eq!(t.withdraws, vec!["W1".to_string()]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // A second poll finds nothing to do
        let again = executor.execute_once().await.unwrap();
        assert!(again.settled.is_empty());
        assert_eq!(adapter.withdrawal_batches().len(), 1);
        assert_eq!(logged_events(&log).await.len(), 1);
    }
}

// ============================================================================
// Replica Tests
// ============================================================================

mod replica {
    use super::*;

    #[tokio::test]
    async fn test_replica_follows_settlement_log() {
        let (db, adapter, log) = solana_fixture();
        let reconciler = reconciler(&db, adapter, &log);
        reconciler.reconcile_unit(55).await.unwrap();

        // The replica shares only the log
        let replica = test_db();
        let mut observer = LogObserver::new(replica.clone(), log, "events").unwrap();
        assert_eq!(observer.catch_up().await.unwrap(), 1);

        let record = replica.get_deposit("T1").unwrap().unwrap();
        assert!(record.transferred);
        assert_eq!(record.transfer_tx.as_deref(), Some("X1"));
        assert!(replica
            .find_unpublished_deposits(ChainId::Solana)
            .unwrap()
            .is_empty());
    }
}
