//! Persisted state layout of one orchestrator instance.

use curator_core::{ChunkId, JobHandle};

pub const CHUNK_PREFIX: &str = "chunk:";
pub const JOB_PREFIX: &str = "job:";
pub const PENDING_CALLBACKS: &str = "pending_callbacks";
pub const POLLING_STARTED_AT: &str = "polling_started_at";
pub const POLLING_INTERVAL_MS: &str = "polling_interval_ms";

/// Chunk keys sort in enqueue order because `ChunkId` is a UUIDv7.
pub fn chunk(id: &ChunkId) -> String {
    format!("{CHUNK_PREFIX}{id}")
}

pub fn chunk_id(key: &str) -> Option<ChunkId> {
    key.strip_prefix(CHUNK_PREFIX)?.parse().ok()
}

/// One key per job, so two jobs polled in the same cycle never share a value.
pub fn job(handle: &JobHandle) -> String {
    format!("{JOB_PREFIX}{handle}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_keys_round_trip() {
        let id = ChunkId::new();
        assert_eq!(chunk_id(&chunk(&id)), Some(id));
        assert_eq!(chunk_id("job:abc"), None);
    }
}
