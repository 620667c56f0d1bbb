pub mod dedup;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod order;
pub mod records;
pub mod redis;
pub mod stream;
