//! `curator-core`: identifiers and the error taxonomy shared by the batch pipeline.
//!
//! This crate contains no I/O.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{ArticleId, ChunkId, FileId, JobHandle, OwnerId};
