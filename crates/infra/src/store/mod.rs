//! Durable key-value store boundary.
//!
//! The orchestrator keeps all of its state (chunk queue, job registry,
//! pending-callback ledger, polling clock) behind this abstraction, together
//! with a single schedulable wake-up alarm.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryDurableStore;
pub use postgres::PostgresDurableStore;
pub use r#trait::{
    DurableStore, StoreError, discard, get_json, list_json_discarding, put_json,
};
