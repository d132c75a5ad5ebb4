//! # colsync - MySQL-to-columnar-store CDC replication
//!
//! Materializes a source MySQL database into a local columnar store and keeps
//! it synchronized by consuming the source's row-based binary log.
//!
//! Each logical source row is represented destination-side by one or more
//! physical rows carrying a `_sign` (±1) marker and a monotonically
//! increasing `_version`, so a merge-on-read storage engine can collapse
//! inserts, updates and deletes into the latest state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   SHOW VARIABLES    ┌──────────────────┐
//! │   MySQL     │◄────────────────────┤   health probe   │
//! │   server    │   snapshot txn      ├──────────────────┤
//! │             │◄────────────────────┤ snapshot         │──► destination DDL
//! │             │                     │ coordinator      │──► full-table dumps
//! │   binlog ───┼──► typed events ───►├──────────────────┤
//! └─────────────┘                     │ sync supervisor  │
//!                                     │  row translator  │──► sign/version blocks
//!                                     │  write buffers   │──► insert pipelines
//!                                     │  metadata store  │──► durable position
//!                                     └──────────────────┘
//! ```
//!
//! The supervisor owns one materialized database: it probes the source,
//! performs the initial consistent snapshot, then streams binlog events into
//! per-table column blocks which are flushed through the destination's insert
//! pipelines. The durable binlog position only advances together with the
//! data it covers, so a crash replays events instead of losing them.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use colsync::{MySqlSourcePool, SyncConfig, SyncSettings, SyncSupervisor};
//!
//! # async fn example(binlog: Arc<dyn colsync::BinlogClient>,
//! #                  destination: Arc<dyn colsync::Destination>) -> colsync::Result<()> {
//! let pool = Arc::new(MySqlSourcePool::new("localhost", 3306, "repl", "secret", "shop"));
//!
//! let config = SyncConfig::new("shop_materialized", "shop").with_settings(SyncSettings::default());
//! let mut supervisor = SyncSupervisor::new(config, pool, binlog, destination);
//! supervisor.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod buffer;
pub mod destination;
pub mod error;
pub mod event;
pub mod metadata;
pub mod probe;
pub mod settings;
pub mod snapshot;
pub mod source;
pub mod supervisor;
pub mod translate;
pub mod value;

pub use block::{Block, Column, ColumnData, ColumnKind, ColumnSchema, TRAILER_COLUMNS};
pub use buffer::Buffers;
pub use destination::{BlockSink, CountingSink, Destination, MemoryDestination, TableMeta};
pub use error::{Result, SyncError};
pub use event::{BinlogEvent, BinlogPosition, QueryEventData, RowsEventData};
pub use metadata::MaterializeMetadata;
pub use settings::SyncSettings;
pub use source::{next_server_id, BinlogClient, BinlogStream, MySqlSourcePool, SourceConnection, SourcePool};
pub use supervisor::{SyncConfig, SyncState, SyncSupervisor};
pub use value::Field;

#[cfg(test)]
pub(crate) mod testing;
