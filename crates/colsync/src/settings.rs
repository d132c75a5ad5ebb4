//! Supervisor-scoped settings
//!
//! All values govern a single materialized database; two supervisors never
//! share a settings object.

use serde::{Deserialize, Serialize};

/// Tuning knobs for one sync supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Flush buffered blocks at least this often, in milliseconds.
    pub max_flush_data_time: u64,
    /// Flush when any single table buffer reaches this many rows.
    pub max_rows_in_buffer: usize,
    /// Flush when any single table buffer reaches this many bytes.
    pub max_bytes_in_buffer: usize,
    /// Flush when all buffers together reach this many rows.
    pub max_rows_in_buffers: usize,
    /// Flush when all buffers together reach this many bytes.
    pub max_bytes_in_buffers: usize,
    /// Sleep this long, in milliseconds, before retrying an unavailable source.
    pub max_wait_time_when_mysql_unavailable: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_flush_data_time: 1_000,
            max_rows_in_buffer: 65_505,
            max_bytes_in_buffer: 1_048_576,
            max_rows_in_buffers: 65_505,
            max_bytes_in_buffers: 1_048_576,
            max_wait_time_when_mysql_unavailable: 1_000,
        }
    }
}

impl SyncSettings {
    pub fn with_max_flush_data_time(mut self, ms: u64) -> Self {
        self.max_flush_data_time = ms;
        self
    }

    pub fn with_max_rows_in_buffer(mut self, rows: usize) -> Self {
        self.max_rows_in_buffer = rows;
        self
    }

    pub fn with_max_bytes_in_buffer(mut self, bytes: usize) -> Self {
        self.max_bytes_in_buffer = bytes;
        self
    }

    pub fn with_max_rows_in_buffers(mut self, rows: usize) -> Self {
        self.max_rows_in_buffers = rows;
        self
    }

    pub fn with_max_bytes_in_buffers(mut self, bytes: usize) -> Self {
        self.max_bytes_in_buffers = bytes;
        self
    }

    pub fn with_max_wait_time_when_mysql_unavailable(mut self, ms: u64) -> Self {
        self.max_wait_time_when_mysql_unavailable = ms;
        self
    }
}
