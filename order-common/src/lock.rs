use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::redis::{Client, CustomRedisError};

const LOCK_KEY_PREFIX: &str = "order_lock:";

/// Proof of ownership handed out by a successful acquire. Release presents
/// the token again, so a holder whose TTL already expired cannot delete a
/// lock that has since changed hands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    token: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug)]
pub enum LockStatus {
    Acquired(LockToken),
    /// The lock is held by somebody else. Not an error: the caller decides
    /// whether to skip, retry later, or abort.
    Contended,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseStatus {
    Released,
    /// The key was absent or held a different token. Informational only;
    /// a TTL expiry followed by a re-acquire looks exactly like this.
    NotHeld,
}

/// Named, time-bounded mutual exclusion on top of the key-value store.
/// At most one non-expired token exists per key, delegated to the store's
/// set-if-absent atomicity. Tokens are never renewed: critical sections must
/// stay well under the configured TTL.
pub struct LockManager {
    client: Arc<dyn Client + Send + Sync>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(client: Arc<dyn Client + Send + Sync>, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    /// Attempt to take the lock for `resource` with a fresh token. One atomic
    /// set-if-absent round trip; no blocking, no retries.
    pub async fn acquire(&self, resource: &str) -> Result<LockStatus, CustomRedisError> {
        let key = format!("{}{}", LOCK_KEY_PREFIX, resource);
        let token = Uuid::new_v4().to_string();

        if self
            .client
            .set_nx_ex(key.clone(), token.clone(), self.ttl)
            .await?
        {
            debug!(key = %key, "acquired lock");
            Ok(LockStatus::Acquired(LockToken { key, token }))
        } else {
            Ok(LockStatus::Contended)
        }
    }

    /// Release a held lock: delete the key only if it still holds our token,
    /// as one atomic step in the backing store. If the store is unreachable
    /// here the lock self-heals when its TTL elapses.
    pub async fn release(&self, token: &LockToken) -> Result<ReleaseStatus, CustomRedisError> {
        if self
            .client
            .del_if_eq(token.key.clone(), token.token.clone())
            .await?
        {
            Ok(ReleaseStatus::Released)
        } else {
            Ok(ReleaseStatus::NotHeld)
        }
    }
}
