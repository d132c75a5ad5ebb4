//! Destination-side seams
//!
//! The engine never touches destination storage directly. It goes through
//! [`Destination`] for catalog lookups, statement execution (the destination
//! owns DDL translation) and block-output pipelines, so the columnar store
//! stays an external collaborator.
//!
//! [`MemoryDestination`] is an in-memory implementation for tests and
//! embedding experiments; it records every executed statement and keeps
//! written blocks per table.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::block::{Block, ColumnSchema, TRAILER_COLUMNS};
use crate::error::{Result, SyncError};

/// Destination-side metadata for one materialized table.
#[derive(Debug, Clone)]
pub struct TableMeta {
    /// Empty block with all physical columns, trailer columns last.
    pub sample_block: Block,
    /// Names of the sorting-key columns, in key order.
    pub sorting_key: Vec<String>,
}

/// A block-output pipeline for one insert statement.
#[async_trait]
pub trait BlockSink: Send {
    async fn write(&mut self, block: &Block) -> Result<()>;
}

/// The destination catalog, DDL executor and insert-pipeline factory.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Tables currently present in a destination database.
    async fn list_tables(&self, database: &str) -> Result<Vec<String>>;

    /// Execute a statement against the destination.
    ///
    /// `query` may carry the engine's DDL routing prefix; `database` is the
    /// target database or empty when the destination should decide;
    /// `comment` identifies the replication step and is attached as a
    /// `/* comment */` marker. DDL the destination cannot parse must come
    /// back as [`SyncError::Syntax`].
    async fn execute(&self, query: &str, database: &str, comment: &str) -> Result<()>;

    /// Current metadata for a table.
    async fn table_meta(&self, database: &str, table: &str) -> Result<TableMeta>;

    /// Open an insert pipeline for a table.
    ///
    /// With `include_materialized` the block must carry all physical columns
    /// (streaming flushes fill the trailers); without it only the ordinary
    /// columns (snapshot dumps leave the trailers to their defaults).
    async fn insert_pipeline(
        &self,
        database: &str,
        table: &str,
        include_materialized: bool,
    ) -> Result<Box<dyn BlockSink>>;

    /// Directory holding the database's durable replication metadata.
    fn metadata_path(&self) -> PathBuf;

    /// Publish a worker-fatal error so user queries against the materialized
    /// database surface it.
    fn publish_error(&self, error: &SyncError);
}

/// Sink adapter counting written rows and bytes, for progress reporting.
pub struct CountingSink {
    inner: Box<dyn BlockSink>,
    written_rows: usize,
    written_bytes: usize,
}

impl CountingSink {
    pub fn new(inner: Box<dyn BlockSink>) -> Self {
        Self {
            inner,
            written_rows: 0,
            written_bytes: 0,
        }
    }

    pub fn written_rows(&self) -> usize {
        self.written_rows
    }

    pub fn written_bytes(&self) -> usize {
        self.written_bytes
    }
}

#[async_trait]
impl BlockSink for CountingSink {
    async fn write(&mut self, block: &Block) -> Result<()> {
        self.inner.write(block).await?;
        self.written_rows += block.rows();
        self.written_bytes += block.bytes();
        Ok(())
    }
}

/// A statement recorded by [`MemoryDestination`].
#[derive(Debug, Clone)]
pub struct ExecutedQuery {
    pub query: String,
    pub database: String,
    pub comment: String,
}

#[derive(Debug, Clone)]
struct TableDefinition {
    schema: Vec<ColumnSchema>,
    sorting_key: Vec<String>,
}

#[derive(Default)]
struct MemoryState {
    /// Known table shapes, keyed by table name. A CREATE statement naming one
    /// of these makes it live.
    defined: BTreeMap<String, TableDefinition>,
    /// Live tables and their written blocks, keyed by (database, table).
    live: BTreeMap<(String, String), Vec<Block>>,
    queries: Vec<ExecutedQuery>,
    syntax_error_marker: Option<String>,
    failing_table: Option<String>,
    published_errors: Vec<String>,
}

/// In-memory [`Destination`] for tests and embedding experiments.
///
/// It does not parse DDL: table shapes are registered up front with
/// [`define_table`](Self::define_table), and a forwarded CREATE statement
/// that mentions a defined name makes the table live. DROP statements remove
/// live tables. Everything executed is recorded for inspection.
pub struct MemoryDestination {
    metadata_dir: PathBuf,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDestination {
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Register a table shape (all physical columns, trailers last).
    pub fn define_table(
        &self,
        table: &str,
        schema: Vec<ColumnSchema>,
        sorting_key: Vec<&str>,
    ) -> &Self {
        self.state.lock().unwrap().defined.insert(
            table.to_string(),
            TableDefinition {
                schema,
                sorting_key: sorting_key.into_iter().map(String::from).collect(),
            },
        );
        self
    }

    /// Make a defined table live without a CREATE statement (resume tests).
    pub fn make_live(&self, database: &str, table: &str) {
        let mut state = self.state.lock().unwrap();
        assert!(state.defined.contains_key(table), "table {table} not defined");
        state
            .live
            .insert((database.to_string(), table.to_string()), Vec::new());
    }

    /// Treat statements containing `marker` as unparseable (syntax error).
    pub fn reject_as_syntax_error(&self, marker: &str) {
        self.state.lock().unwrap().syntax_error_marker = Some(marker.to_string());
    }

    /// Make insert pipelines for `table` fail on write.
    pub fn fail_inserts_into(&self, table: &str) {
        self.state.lock().unwrap().failing_table = Some(table.to_string());
    }

    /// Blocks written to a table so far.
    pub fn written_blocks(&self, database: &str, table: &str) -> Vec<Block> {
        self.state
            .lock()
            .unwrap()
            .live
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Every statement executed, in order.
    pub fn executed_queries(&self) -> Vec<ExecutedQuery> {
        self.state.lock().unwrap().queries.clone()
    }

    /// Errors published by the supervisor.
    pub fn published_errors(&self) -> Vec<String> {
        self.state.lock().unwrap().published_errors.clone()
    }
}

/// Pull the `db`.`table` (or bare `table`) identifier that follows `keyword`.
fn identifier_after<'a>(query: &'a str, keyword: &str) -> Option<&'a str> {
    let start = query.find(keyword)? + keyword.len();
    let rest = query[start..].trim_start();
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn last_identifier_segment(identifier: &str) -> String {
    identifier
        .rsplit('.')
        .next()
        .unwrap_or(identifier)
        .trim_matches('`')
        .to_string()
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .live
            .keys()
            .filter(|(db, _)| db == database)
            .map(|(_, table)| table.clone())
            .collect())
    }

    async fn execute(&self, query: &str, database: &str, comment: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(ExecutedQuery {
            query: query.to_string(),
            database: database.to_string(),
            comment: comment.to_string(),
        });

        if let Some(marker) = &state.syntax_error_marker {
            if query.contains(marker.as_str()) {
                return Err(SyncError::syntax(format!("cannot parse: {query}")));
            }
        }

        if let Some(identifier) = identifier_after(query, "DROP TABLE") {
            let table = last_identifier_segment(identifier);
            state.live.retain(|(_, name), _| *name != table);
        } else if let Some(identifier) = identifier_after(query, "CREATE TABLE") {
            let table = last_identifier_segment(identifier);
            if state.defined.contains_key(&table) {
                state
                    .live
                    .insert((database.to_string(), table), Vec::new());
            }
        }
        Ok(())
    }

    async fn table_meta(&self, database: &str, table: &str) -> Result<TableMeta> {
        let state = self.state.lock().unwrap();
        let key = (database.to_string(), table.to_string());
        if !state.live.contains_key(&key) {
            return Err(SyncError::destination(format!(
                "table {database}.{table} does not exist"
            )));
        }
        let definition = state
            .defined
            .get(table)
            .ok_or_else(|| SyncError::destination(format!("table {table} has no definition")))?;
        Ok(TableMeta {
            sample_block: Block::from_schema(&definition.schema),
            sorting_key: definition.sorting_key.clone(),
        })
    }

    async fn insert_pipeline(
        &self,
        database: &str,
        table: &str,
        include_materialized: bool,
    ) -> Result<Box<dyn BlockSink>> {
        let state = self.state.lock().unwrap();
        let key = (database.to_string(), table.to_string());
        if !state.live.contains_key(&key) {
            return Err(SyncError::destination(format!(
                "table {database}.{table} does not exist"
            )));
        }
        let definition = state
            .defined
            .get(table)
            .ok_or_else(|| SyncError::destination(format!("table {table} has no definition")))?;
        let expected_columns = if include_materialized {
            definition.schema.len()
        } else {
            definition.schema.len() - TRAILER_COLUMNS
        };
        let failing = state.failing_table.as_deref() == Some(table);
        Ok(Box::new(MemorySink {
            state: Arc::clone(&self.state),
            key,
            expected_columns,
            failing,
        }))
    }

    fn metadata_path(&self) -> PathBuf {
        self.metadata_dir.clone()
    }

    fn publish_error(&self, error: &SyncError) {
        self.state
            .lock()
            .unwrap()
            .published_errors
            .push(error.to_string());
    }
}

struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
    key: (String, String),
    expected_columns: usize,
    failing: bool,
}

#[async_trait]
impl BlockSink for MemorySink {
    async fn write(&mut self, block: &Block) -> Result<()> {
        if self.failing {
            return Err(SyncError::destination(format!(
                "insert pipeline for {}.{} is broken",
                self.key.0, self.key.1
            )));
        }
        if block.column_count() != self.expected_columns {
            return Err(SyncError::logical(format!(
                "insert into {}.{} expected {} columns, block has {}",
                self.key.0,
                self.key.1,
                self.expected_columns,
                block.column_count()
            )));
        }
        let mut state = self.state.lock().unwrap();
        match state.live.get_mut(&self.key) {
            Some(blocks) => {
                blocks.push(block.clone());
                Ok(())
            }
            None => Err(SyncError::destination(format!(
                "table {}.{} vanished mid-insert",
                self.key.0, self.key.1
            ))),
        }
    }
}
