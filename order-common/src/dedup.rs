use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::records::{OrderStore, StoreError};
use crate::redis::{Client, CustomRedisError};

const MARKER_KEY_PREFIX: &str = "order_seen:";

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("dedup cache error: {0}")]
    Cache(#[from] CustomRedisError),
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum DedupStatus {
    Fresh,
    Duplicate,
}

/// Two-tier duplicate detection: a short-lived marker key in the key-value
/// store as the fast path, with the record store as the source of truth
/// whenever the cache is silent. Only sound while the caller holds the
/// per-order lock, which keeps a single process between check and insert.
pub struct DuplicateFilter {
    client: Arc<dyn Client + Send + Sync>,
    store: Arc<dyn OrderStore + Send + Sync>,
    marker_ttl: Duration,
}

impl DuplicateFilter {
    pub fn new(
        client: Arc<dyn Client + Send + Sync>,
        store: Arc<dyn OrderStore + Send + Sync>,
        marker_ttl: Duration,
    ) -> Self {
        Self {
            client,
            store,
            marker_ttl,
        }
    }

    /// Check whether `order_number` was already processed. A cache hit short
    /// circuits; a store hit backfills the marker so replays within the TTL
    /// stay off the store.
    pub async fn check(&self, order_number: &str) -> Result<DedupStatus, DedupError> {
        let key = Self::marker_key(order_number);

        if self.client.get(key.clone()).await?.is_some() {
            return Ok(DedupStatus::Duplicate);
        }

        if self.store.exists(order_number).await? {
            if let Err(err) = self
                .client
                .set_ex(key, "1".to_owned(), self.marker_ttl)
                .await
            {
                // The store already answered; a missing marker only costs the
                // next replay another store round trip.
                warn!(order_number, error = %err, "failed to backfill dedup marker");
            }
            return Ok(DedupStatus::Duplicate);
        }

        Ok(DedupStatus::Fresh)
    }

    /// Record that `order_number` has been persisted. Called after a
    /// successful insert, never before.
    pub async fn mark(&self, order_number: &str) -> Result<(), CustomRedisError> {
        self.client
            .set_ex(
                Self::marker_key(order_number),
                "1".to_owned(),
                self.marker_ttl,
            )
            .await
    }

    fn marker_key(order_number: &str) -> String {
        format!("{}{}", MARKER_KEY_PREFIX, order_number)
    }
}
