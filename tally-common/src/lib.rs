pub mod category;
pub mod envelope;
pub mod health;
pub mod metrics;
pub mod pgqueue;
pub mod pgstore;
pub mod queue;
pub mod retry;
pub mod store;
pub mod transaction;
