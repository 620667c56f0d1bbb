use order_common::records::StoreError;
use order_common::redis::CustomRedisError;
use thiserror::Error;

/// Enumeration of errors that take down the worker process. Only startup
/// failures land here: per-item failures are contained inside the processing
/// loop and retried on later cycles.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("the key-value store is unavailable: {0}")]
    Redis(#[from] CustomRedisError),
    #[error("the record store is unavailable: {0}")]
    Store(#[from] StoreError),
}
