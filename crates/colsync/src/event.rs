//! Typed binlog events
//!
//! The handled event types form a closed set; the supervisor dispatches on
//! the variant tag. Anything the engine does not materialize arrives as
//! [`BinlogEvent::Unknown`] and is skipped at debug level.

use crate::value::Field;

/// A position in the source's binary log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BinlogPosition {
    /// Binlog file name on the source.
    pub file: String,
    /// Byte offset within the file.
    pub offset: u64,
    /// The executed GTID set at this position, if the source tracks GTIDs.
    pub gtid_set: String,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64, gtid_set: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            offset,
            gtid_set: gtid_set.into(),
        }
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// Row images attached to a write/update/delete event.
///
/// For updates the images are arranged pairwise: `[before, after, before,
/// after, ...]`.
#[derive(Debug, Clone)]
pub struct RowsEventData {
    /// Source table the images belong to.
    pub table: String,
    /// Full row images, one `Field` per source column.
    pub rows: Vec<Vec<Field>>,
}

/// A statement (DDL) event from the binlog.
#[derive(Debug, Clone)]
pub struct QueryEventData {
    /// Default schema the statement executed under on the source.
    pub schema: String,
    /// The statement text.
    pub query: String,
}

/// One decoded binlog event.
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    /// Row inserts (n images).
    WriteRows(RowsEventData),
    /// Row updates (2n images, before/after interleaved).
    UpdateRows(RowsEventData),
    /// Row deletes (n images).
    DeleteRows(RowsEventData),
    /// DDL statement.
    Query(QueryEventData),
    /// Master heartbeat; carries no data.
    Heartbeat,
    /// Any other event type; the payload is a description for debug logging.
    Unknown(String),
}
