use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::prelude::*;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::order::Order;

/// Enumeration of errors for operations against the record store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    /// The table's uniqueness constraint rejected the insert: the order was
    /// already persisted by somebody else. A duplicate after the fact, not a
    /// storage failure.
    #[error("a record for order {order_number} already exists")]
    Conflict { order_number: String },
}

/// A processed order as persisted in the record store. Written once, never
/// mutated, never deleted by this system.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessedOrder {
    pub id: Uuid,
    pub order_number: String,
    pub item_name: String,
    pub quantity: i32,
    pub inserted_at: DateTime<Utc>,
}

/// The authoritative, durable store of processed orders: the source of truth
/// for duplicate detection whenever the marker cache is cold.
#[async_trait]
pub trait OrderStore {
    /// Persist an order under a generated record id, returning the id.
    /// A uniqueness violation on the order number maps to `StoreError::Conflict`.
    async fn insert(&self, order: &Order) -> Result<Uuid, StoreError>;

    /// Authoritative check: has a record for this order number been persisted?
    async fn exists(&self, order_number: &str) -> Result<bool, StoreError>;
}

/// `OrderStore` backed by a PostgreSQL table with a UNIQUE constraint on the
/// order number. The constraint is load-bearing: it closes the check-then-act
/// window that remains when a lock expires mid-insert.
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: &Order) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
INSERT INTO processed_orders
    (id, order_number, item_name, quantity, inserted_at)
VALUES
    ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(id)
        .bind(&order.order_number)
        .bind(&order.item_name)
        .bind(order.quantity)
        .execute(&self.pool)
        .await
        .map_err(|error| match &error {
            sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
                StoreError::Conflict {
                    order_number: order.order_number.clone(),
                }
            }
            _ => StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            },
        })?;

        Ok(id)
    }

    async fn exists(&self, order_number: &str) -> Result<bool, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM processed_orders WHERE order_number = $1")
                .bind(order_number)
                .fetch_one(&self.pool)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "SELECT".to_owned(),
                    error,
                })?;

        Ok(count > 0)
    }
}

/// In-memory `OrderStore` used by tests across the workspace. Enforces the
/// same unique-order-number invariant as the real table, and can be told to
/// fail inserts to exercise the no-ack-on-failure path.
#[derive(Default)]
pub struct MemoryOrderStore {
    rows: Mutex<Vec<ProcessedOrder>>,
    fail_inserts: AtomicBool,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_rows(&self) -> MutexGuard<'_, Vec<ProcessedOrder>> {
        match self.rows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn rows(&self) -> Vec<ProcessedOrder> {
        self.lock_rows().clone()
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: &Order) -> Result<Uuid, StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::QueryError {
                command: "INSERT".to_owned(),
                error: sqlx::Error::PoolClosed,
            });
        }

        let mut rows = self.lock_rows();
        if rows
            .iter()
            .any(|row| row.order_number == order.order_number)
        {
            return Err(StoreError::Conflict {
                order_number: order.order_number.clone(),
            });
        }

        let id = Uuid::new_v4();
        rows.push(ProcessedOrder {
            id,
            order_number: order.order_number.clone(),
            item_name: order.item_name.clone(),
            quantity: order.quantity,
            inserted_at: Utc::now(),
        });

        Ok(id)
    }

    async fn exists(&self, order_number: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock_rows()
            .iter()
            .any(|row| row.order_number == order_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(order_number: &str) -> Order {
        Order {
            order_number: order_number.to_string(),
            item_name: "Item 1".to_string(),
            quantity: 1,
        }
    }

    #[tokio::test]
    async fn insert_is_visible_to_exists() {
        let store = MemoryOrderStore::new();

        assert!(!store.exists("ORD-00042").await.unwrap());
        store.insert(&order("ORD-00042")).await.unwrap();
        assert!(store.exists("ORD-00042").await.unwrap());
    }

    #[tokio::test]
    async fn a_second_insert_for_the_same_order_number_conflicts() {
        let store = MemoryOrderStore::new();

        store.insert(&order("ORD-00042")).await.unwrap();
        let err = store.insert(&order("ORD-00042")).await.unwrap_err();

        assert!(matches!(
            err,
            StoreError::Conflict { order_number } if order_number == "ORD-00042"
        ));
        assert_eq!(store.rows().len(), 1);
    }
}
