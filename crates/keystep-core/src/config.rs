//! Engine configuration

use serde::{Deserialize, Serialize};

/// Attachment chunking limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Smallest chunk the planner will produce, except for the last chunk
    pub min_chunk_len: u64,
    /// Upper bound on the number of chunks per attachment
    pub max_chunk_count: u64,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self { min_chunk_len: 32 * 1024, max_chunk_count: 1024 }
    }
}

/// Protocol engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on local messages processed as a consequence of one
    /// incoming message (spawned children, their children, ...)
    pub max_local_deliveries_per_message: usize,
    /// Capacity of each per-identity worker queue in the runtime
    pub worker_queue_capacity: usize,
    /// Attachment chunking limits
    pub attachment: AttachmentConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_local_deliveries_per_message: 64,
            worker_queue_capacity: 256,
            attachment: AttachmentConfig::default(),
        }
    }
}
