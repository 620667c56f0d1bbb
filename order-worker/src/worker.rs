use std::sync::Arc;
use std::time::Duration;

use order_common::dedup::{DedupStatus, DuplicateFilter};
use order_common::health::HealthHandle;
use order_common::lock::{LockManager, LockStatus, ReleaseStatus};
use order_common::order::Order;
use order_common::records::{OrderStore, StoreError};
use order_common::redis::StreamEntry;
use order_common::stream::StreamConsumer;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Outcome of a single stream entry for one poll cycle.
#[derive(Debug, PartialEq, Eq)]
enum ItemOutcome {
    /// Persisted, marked, acknowledged.
    Inserted,
    /// Already processed (cache, store, or constraint); acknowledged.
    Duplicate,
    /// Locked by another consumer; left pending for a later attempt.
    Contended,
    /// Unparseable payload; acknowledged to avoid a poison pill.
    Malformed,
    /// Transient failure; left pending and retried via redelivery.
    Failed,
}

/// The pipeline orchestrator. Owns handles to the stream consumer, the lock
/// manager, the duplicate filter and the record store, and drives each entry
/// through fetch → lock → check → insert → ack. The runner that calls `run`
/// owns the cancellation signal.
pub struct OrderWorker {
    consumer: StreamConsumer,
    locks: LockManager,
    filter: DuplicateFilter,
    store: Arc<dyn OrderStore + Send + Sync>,
    poll_interval: Duration,
    batch_size: usize,
    liveness: HealthHandle,
}

impl OrderWorker {
    pub fn new(
        consumer: StreamConsumer,
        locks: LockManager,
        filter: DuplicateFilter,
        store: Arc<dyn OrderStore + Send + Sync>,
        poll_interval: Duration,
        batch_size: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            consumer,
            locks,
            filter,
            store,
            poll_interval,
            batch_size,
            liveness,
        }
    }

    /// Run the poll loop until `shutdown` fires. The in-flight batch is
    /// finished (and its locks released) before returning; anything left
    /// unacknowledged is redelivered to the group later.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!(consumer = self.consumer.consumer(), "shutdown requested, stopping order worker");
                    break;
                }
            }

            self.liveness.report_healthy().await;
            self.run_cycle().await;
        }
    }

    /// One fetch cycle: read a batch and process its entries in order.
    /// A failure on one entry never aborts the batch or the loop.
    async fn run_cycle(&self) {
        let batch = match self.consumer.read_batch(self.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                // Transient stream store failure, retried next cycle.
                error!(error = %err, "failed to read from the order stream");
                metrics::counter!("order_worker_read_errors_total").increment(1);
                return;
            }
        };

        if batch.is_empty() {
            return;
        }

        metrics::histogram!("order_worker_batch_size").record(batch.len() as f64);

        for entry in batch {
            let start = tokio::time::Instant::now();
            let outcome = self.process_entry(&entry).await;
            metrics::histogram!("order_worker_item_duration_seconds")
                .record(start.elapsed().as_secs_f64());

            let counter = match outcome {
                ItemOutcome::Inserted => "order_worker_orders_inserted_total",
                ItemOutcome::Duplicate => "order_worker_orders_duplicate_total",
                ItemOutcome::Contended => "order_worker_lock_contended_total",
                ItemOutcome::Malformed => "order_worker_orders_malformed_total",
                ItemOutcome::Failed => "order_worker_item_errors_total",
            };
            metrics::counter!(counter).increment(1);
        }
    }

    /// Drive a single entry through the locked section. All failures are
    /// contained here, and the lock, once acquired, is released on every
    /// path out.
    async fn process_entry(&self, entry: &StreamEntry) -> ItemOutcome {
        let order = match Order::from_entry(entry) {
            Ok(order) => order,
            Err(err) => {
                // At-least-once delivery would redeliver a malformed entry
                // forever, so acknowledge it and move on.
                warn!(entry_id = %entry.id, error = %err, "malformed order entry, acknowledging");
                return self.ack_entry(entry, ItemOutcome::Malformed).await;
            }
        };

        let token = match self.locks.acquire(&order.order_number).await {
            Ok(LockStatus::Acquired(token)) => token,
            Ok(LockStatus::Contended) => {
                info!(
                    order_number = %order.order_number,
                    entry_id = %entry.id,
                    "order is locked by another consumer, skipping"
                );
                return ItemOutcome::Contended;
            }
            Err(err) => {
                // No work without a confirmed acquire; the entry stays
                // pending and is retried.
                error!(order_number = %order.order_number, error = %err, "failed to acquire lock");
                return ItemOutcome::Failed;
            }
        };

        let outcome = self.process_locked(&order, entry).await;

        // Guaranteed cleanup: every branch of the locked section lands here.
        match self.locks.release(&token).await {
            Ok(ReleaseStatus::Released) => {}
            Ok(ReleaseStatus::NotHeld) => {
                warn!(
                    lock_key = token.key(),
                    "lock expired or changed hands before release"
                );
            }
            Err(err) => {
                // The TTL bounds how long the stale lock can linger.
                warn!(lock_key = token.key(), error = %err, "failed to release lock, letting it expire");
            }
        }

        outcome
    }

    /// The critical section: duplicate check, insert, marker, ack. Only runs
    /// while the per-order lock is held.
    async fn process_locked(&self, order: &Order, entry: &StreamEntry) -> ItemOutcome {
        match self.filter.check(&order.order_number).await {
            Ok(DedupStatus::Fresh) => {}
            Ok(DedupStatus::Duplicate) => {
                info!(
                    order_number = %order.order_number,
                    entry_id = %entry.id,
                    "duplicate order, skipping insert"
                );
                return self.ack_entry(entry, ItemOutcome::Duplicate).await;
            }
            Err(err) => {
                error!(order_number = %order.order_number, error = %err, "duplicate check failed");
                return ItemOutcome::Failed;
            }
        }

        match self.store.insert(order).await {
            Ok(record_id) => {
                info!(
                    order_number = %order.order_number,
                    record_id = %record_id,
                    entry_id = %entry.id,
                    "inserted order"
                );
                if let Err(err) = self.filter.mark(&order.order_number).await {
                    // The authoritative check still catches replays; a missing
                    // marker only costs them a store round trip.
                    warn!(order_number = %order.order_number, error = %err, "failed to set dedup marker");
                }
                self.ack_entry(entry, ItemOutcome::Inserted).await
            }
            Err(StoreError::Conflict { .. }) => {
                // A writer we could not see slipped in, or a previous run died
                // between insert and ack. Either way the record exists.
                warn!(
                    order_number = %order.order_number,
                    entry_id = %entry.id,
                    "order already persisted, acknowledging"
                );
                self.ack_entry(entry, ItemOutcome::Duplicate).await
            }
            Err(err) => {
                // No ack and no marker: the entry stays pending and the next
                // delivery retries the insert.
                error!(
                    order_number = %order.order_number,
                    entry_id = %entry.id,
                    error = %err,
                    "failed to insert order"
                );
                ItemOutcome::Failed
            }
        }
    }

    async fn ack_entry(&self, entry: &StreamEntry, outcome: ItemOutcome) -> ItemOutcome {
        match self.consumer.ack(&entry.id).await {
            Ok(()) => outcome,
            Err(err) => {
                error!(entry_id = %entry.id, error = %err, "failed to acknowledge entry");
                ItemOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use order_common::health::HealthRegistry;
    use order_common::records::MemoryOrderStore;
    use order_common::redis::{Client, MockRedisClient};
    use uuid::Uuid;

    const STREAM: &str = "order_stream";
    const GROUP: &str = "order_group";

    async fn worker_with_store(
        client: &MockRedisClient,
        store: Arc<dyn OrderStore + Send + Sync>,
    ) -> OrderWorker {
        let redis: Arc<dyn Client + Send + Sync> = Arc::new(client.clone());
        let consumer = StreamConsumer::new(redis.clone(), STREAM, GROUP, "c1");
        consumer.ensure_group().await.unwrap();

        let liveness = HealthRegistry::new("liveness")
            .register("worker".to_string(), time::Duration::seconds(30))
            .await;

        OrderWorker::new(
            consumer,
            LockManager::new(redis.clone(), Duration::from_secs(60)),
            DuplicateFilter::new(redis, store.clone(), Duration::from_secs(30)),
            store,
            Duration::from_millis(10),
            10,
            liveness,
        )
    }

    async fn worker(client: &MockRedisClient, store: &Arc<MemoryOrderStore>) -> OrderWorker {
        worker_with_store(client, store.clone()).await
    }

    async fn produce(client: &MockRedisClient, order_number: &str) -> String {
        client
            .xadd(
                STREAM.to_string(),
                vec![
                    ("order_number".to_string(), order_number.to_string()),
                    ("item_name".to_string(), "Item 1".to_string()),
                    ("quantity".to_string(), "2".to_string()),
                ],
            )
            .await
            .unwrap()
    }

    async fn lock_is_free(client: &MockRedisClient, order_number: &str) -> bool {
        client
            .get(format!("order_lock:{}", order_number))
            .await
            .unwrap()
            .is_none()
    }

    #[tokio::test]
    async fn a_fresh_order_is_inserted_acked_and_unlocked() {
        let client = MockRedisClient::new();
        let store = Arc::new(MemoryOrderStore::new());
        let worker = worker(&client, &store).await;

        produce(&client, "ORD-00042").await;
        let batch = worker.consumer.read_batch(10).await.unwrap();

        let outcome = worker.process_entry(&batch[0]).await;

        assert_eq!(outcome, ItemOutcome::Inserted);
        let rows = store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order_number, "ORD-00042");
        assert_eq!(rows[0].quantity, 2);
        assert!(client.pending(STREAM, GROUP).is_empty());
        assert!(lock_is_free(&client, "ORD-00042").await);
        // The marker was set for the fast-path check on replays.
        assert_eq!(
            client
                .get("order_seen:ORD-00042".to_string())
                .await
                .unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn a_replayed_order_is_detected_and_only_persisted_once() {
        let client = MockRedisClient::new();
        let store = Arc::new(MemoryOrderStore::new());
        let worker = worker(&client, &store).await;

        produce(&client, "ORD-00042").await;
        produce(&client, "ORD-00042").await;
        let batch = worker.consumer.read_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);

        assert_eq!(worker.process_entry(&batch[0]).await, ItemOutcome::Inserted);
        assert_eq!(worker.process_entry(&batch[1]).await, ItemOutcome::Duplicate);

        assert_eq!(store.rows().len(), 1);
        // Both entries are acknowledged: the duplicate's work is already done.
        assert!(client.pending(STREAM, GROUP).is_empty());
    }

    #[tokio::test]
    async fn a_contended_order_is_skipped_without_ack() {
        let client = MockRedisClient::new();
        let store = Arc::new(MemoryOrderStore::new());
        let worker = worker(&client, &store).await;

        // Another consumer holds the lock for this order.
        assert!(client
            .set_nx_ex(
                "order_lock:ORD-00042".to_string(),
                Uuid::new_v4().to_string(),
                Duration::from_secs(60),
            )
            .await
            .unwrap());

        let id = produce(&client, "ORD-00042").await;
        let batch = worker.consumer.read_batch(10).await.unwrap();

        let outcome = worker.process_entry(&batch[0]).await;

        assert_eq!(outcome, ItemOutcome::Contended);
        assert!(store.rows().is_empty());
        // Not acked: the entry stays pending for a later attempt.
        assert_eq!(
            worker_pending_ids(&client),
            vec![id]
        );
    }

    #[tokio::test]
    async fn a_malformed_entry_is_acked_and_never_persisted() {
        let client = MockRedisClient::new();
        let store = Arc::new(MemoryOrderStore::new());
        let worker = worker(&client, &store).await;

        client
            .xadd(
                STREAM.to_string(),
                vec![("order_number".to_string(), "ORD-00042".to_string())],
            )
            .await
            .unwrap();
        let batch = worker.consumer.read_batch(10).await.unwrap();

        let outcome = worker.process_entry(&batch[0]).await;

        assert_eq!(outcome, ItemOutcome::Malformed);
        assert!(store.rows().is_empty());
        // Acked regardless, so the poison pill is not redelivered forever.
        assert!(client.pending(STREAM, GROUP).is_empty());
    }

    #[tokio::test]
    async fn an_insert_failure_leaves_the_entry_pending_and_unmarked() {
        let client = MockRedisClient::new();
        let store = Arc::new(MemoryOrderStore::new());
        let worker = worker(&client, &store).await;

        store.fail_inserts(true);
        let id = produce(&client, "ORD-00042").await;
        let batch = worker.consumer.read_batch(10).await.unwrap();

        let outcome = worker.process_entry(&batch[0]).await;

        assert_eq!(outcome, ItemOutcome::Failed);
        assert_eq!(worker_pending_ids(&client), vec![id]);
        // No marker was set: once the store recovers, the retry inserts.
        assert_eq!(
            client
                .get("order_seen:ORD-00042".to_string())
                .await
                .unwrap(),
            None
        );
        // The lock was still released on the failure path.
        assert!(lock_is_free(&client, "ORD-00042").await);

        store.fail_inserts(false);
        assert_eq!(worker.process_entry(&batch[0]).await, ItemOutcome::Inserted);
        assert_eq!(store.rows().len(), 1);
    }

    /// A store whose uniqueness constraint rejects every insert while the
    /// duplicate check sees nothing: the race where another writer commits
    /// between our check and our insert.
    struct ConflictingStore;

    #[async_trait]
    impl OrderStore for ConflictingStore {
        async fn insert(&self, order: &Order) -> Result<Uuid, StoreError> {
            Err(StoreError::Conflict {
                order_number: order.order_number.clone(),
            })
        }

        async fn exists(&self, _order_number: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn a_constraint_conflict_is_treated_as_a_duplicate_and_acked() {
        let client = MockRedisClient::new();
        let worker = worker_with_store(&client, Arc::new(ConflictingStore)).await;

        produce(&client, "ORD-00042").await;
        let batch = worker.consumer.read_batch(10).await.unwrap();

        let outcome = worker.process_entry(&batch[0]).await;

        assert_eq!(outcome, ItemOutcome::Duplicate);
        assert!(client.pending(STREAM, GROUP).is_empty());
        assert!(lock_is_free(&client, "ORD-00042").await);
    }

    #[tokio::test]
    async fn the_loop_drains_a_batch_and_stops_on_shutdown() {
        let client = MockRedisClient::new();
        let store = Arc::new(MemoryOrderStore::new());
        let worker = worker(&client, &store).await;

        produce(&client, "ORD-00001").await;
        produce(&client, "ORD-00002").await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            worker.run(shutdown_rx).await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.rows().len(), 2);
        assert!(client.pending(STREAM, GROUP).is_empty());
    }

    fn worker_pending_ids(client: &MockRedisClient) -> Vec<String> {
        client
            .pending(STREAM, GROUP)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }
}
