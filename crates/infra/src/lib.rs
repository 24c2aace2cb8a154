//! Infrastructure layer: the batch orchestrator, durable storage, external
//! service clients and configuration.

pub mod config;
pub mod external;
pub mod jobs;
pub mod store;
pub mod vector_store;
