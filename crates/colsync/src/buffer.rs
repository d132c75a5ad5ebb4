//! Per-table write buffers
//!
//! One column block per destination table, created lazily from the table's
//! current metadata, plus running totals driving the flush decision. The
//! buffers are owned by a single worker; nothing here needs a lock.

use std::collections::HashMap;

use tracing::debug;

use crate::block::Block;
use crate::destination::{BlockSink, Destination};
use crate::error::{Result, SyncError};

/// A table buffer: the column block plus the cached positions of the
/// sorting-key columns inside it.
pub type BufferAndSortingColumns = (Block, Vec<usize>);

/// The buffer set for one materialized database.
#[derive(Debug, Default)]
pub struct Buffers {
    database: String,
    data: HashMap<String, BufferAndSortingColumns>,
    max_block_rows: usize,
    max_block_bytes: usize,
    total_blocks_rows: usize,
    total_blocks_bytes: usize,
}

impl Buffers {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The buffer for `table`, created from destination metadata on first use.
    pub async fn table_buffer(
        &mut self,
        destination: &dyn Destination,
        table: &str,
    ) -> Result<&mut BufferAndSortingColumns> {
        if !self.data.contains_key(table) {
            let meta = destination.table_meta(&self.database, table).await?;
            let mut sorting_columns_index = Vec::with_capacity(meta.sorting_key.len());
            for name in &meta.sorting_key {
                let position = meta.sample_block.position_by_name(name).ok_or_else(|| {
                    SyncError::logical(format!(
                        "sorting-key column {name} is missing from table {table}"
                    ))
                })?;
                sorting_columns_index.push(position);
            }
            debug!(table = %table, "created write buffer");
            self.data.insert(
                table.to_string(),
                (meta.sample_block.clone_empty(), sorting_columns_index),
            );
        }
        self.data
            .get_mut(table)
            .ok_or_else(|| SyncError::logical("freshly created buffer vanished"))
    }

    /// Fold one applied event into the running totals.
    pub fn add(
        &mut self,
        block_rows: usize,
        block_bytes: usize,
        written_rows: usize,
        written_bytes: usize,
    ) {
        self.total_blocks_rows += written_rows;
        self.total_blocks_bytes += written_bytes;
        self.max_block_rows = self.max_block_rows.max(block_rows);
        self.max_block_bytes = self.max_block_bytes.max(block_bytes);
    }

    /// True when any of the four limits is met or exceeded.
    pub fn check_thresholds(
        &self,
        check_block_rows: usize,
        check_block_bytes: usize,
        check_total_rows: usize,
        check_total_bytes: usize,
    ) -> bool {
        self.max_block_rows >= check_block_rows
            || self.max_block_bytes >= check_block_bytes
            || self.total_blocks_rows >= check_total_rows
            || self.total_blocks_bytes >= check_total_bytes
    }

    /// Stream every buffered block through the destination's insert
    /// pipelines, then clear.
    ///
    /// On failure the buffers are dropped and the error rethrown; the
    /// durable binlog position has not advanced, so the lost events replay.
    pub async fn commit(&mut self, destination: &dyn Destination) -> Result<()> {
        let result = self.write_all(destination).await;
        self.data.clear();
        if result.is_ok() {
            self.max_block_rows = 0;
            self.max_block_bytes = 0;
            self.total_blocks_rows = 0;
            self.total_blocks_bytes = 0;
        }
        result
    }

    async fn write_all(&self, destination: &dyn Destination) -> Result<()> {
        for (table_name, (block, _)) in &self.data {
            let mut sink = destination
                .insert_pipeline(&self.database, table_name, true)
                .await?;
            sink.write(block).await?;
        }
        Ok(())
    }
}
