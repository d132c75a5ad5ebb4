//! Sync supervisor
//!
//! One supervisor owns one materialized database: its source pool, its
//! binlog stream, its buffers and its metadata file. The background worker
//! is single-threaded by construction, so buffer mutation, translation and
//! flushing need no locks, and `_version` stays strictly monotone.

use std::cmp::max;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::buffer::Buffers;
use crate::destination::Destination;
use crate::error::{Result, SyncError};
use crate::event::{BinlogEvent, BinlogPosition};
use crate::metadata::MaterializeMetadata;
use crate::probe;
use crate::settings::SyncSettings;
use crate::snapshot::{self, back_quote};
use crate::source::{next_server_id, BinlogClient, BinlogStream, SourcePool};
use crate::translate;

/// Marker attached to every streaming-phase destination query.
pub(crate) const SYNC_STEP_COMMENT: &str = "colsync step 2: sync binlog data";

/// Name of the tracing span every worker runs under; shows up in log entries
/// and task dumps.
pub const SYNC_WORKER_SPAN: &str = "sync_worker";

/// True when the current code runs inside a sync worker span.
pub fn is_sync_worker() -> bool {
    tracing::Span::current()
        .metadata()
        .is_some_and(|m| m.name() == SYNC_WORKER_SPAN)
}

/// Lifecycle of one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    Init = 0,
    Probing = 1,
    Snapshotting = 2,
    Streaming = 3,
    Cancelled = 4,
    Failed = 5,
}

impl SyncState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncState::Probing,
            2 => SyncState::Snapshotting,
            3 => SyncState::Streaming,
            4 => SyncState::Cancelled,
            5 => SyncState::Failed,
            _ => SyncState::Init,
        }
    }
}

/// Identity of one materialization, plus its tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Destination database name.
    pub database_name: String,
    /// Source database name.
    pub mysql_database_name: String,
    pub settings: SyncSettings,
}

impl SyncConfig {
    pub fn new(database_name: impl Into<String>, mysql_database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            mysql_database_name: mysql_database_name.into(),
            settings: SyncSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Routing prefix attached to every DDL statement forwarded to the
    /// destination's translator.
    pub fn ddl_prefix(&self) -> String {
        format!(
            "EXTERNAL DDL FROM MySQL({}, {}) ",
            back_quote(&self.database_name),
            back_quote(&self.mysql_database_name)
        )
    }
}

/// The long-running agent materializing one MySQL database.
pub struct SyncSupervisor {
    config: SyncConfig,
    pool: Arc<dyn SourcePool>,
    binlog: Arc<dyn BinlogClient>,
    destination: Arc<dyn Destination>,
    cancelled: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    worker: Option<JoinHandle<()>>,
}

impl SyncSupervisor {
    pub fn new(
        config: SyncConfig,
        pool: Arc<dyn SourcePool>,
        binlog: Arc<dyn BinlogClient>,
        destination: Arc<dyn Destination>,
    ) -> Self {
        Self {
            config,
            pool,
            binlog,
            destination,
            cancelled: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(SyncState::Init as u8)),
            worker: None,
        }
    }

    /// Validate the source, then start the background worker.
    ///
    /// A misconfigured source fails here and no worker is started; every
    /// later failure surfaces through [`Destination::publish_error`].
    pub async fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.state
            .store(SyncState::Probing as u8, Ordering::SeqCst);
        let mysql_version = match probe::check_source_and_get_version(self.pool.as_ref()).await {
            Ok(version) => version,
            Err(e) => {
                self.state.store(SyncState::Failed as u8, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!(
            database = %self.config.database_name,
            source = %self.config.mysql_database_name,
            version = %mysql_version,
            "starting synchronization"
        );

        let worker = Worker {
            config: self.config.clone(),
            pool: Arc::clone(&self.pool),
            binlog: Arc::clone(&self.binlog),
            destination: Arc::clone(&self.destination),
            cancelled: Arc::clone(&self.cancelled),
            state: Arc::clone(&self.state),
        };
        let span = info_span!("sync_worker", database = %self.config.database_name);
        self.worker = Some(tokio::spawn(
            async move { worker.run(mysql_version).await }.instrument(span),
        ));
        Ok(())
    }

    /// Request cancellation and wait for the worker to finish its current
    /// unit of work. Idempotent.
    pub async fn stop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "sync worker join failed");
            }
        }
    }

    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Worker {
    config: SyncConfig,
    pool: Arc<dyn SourcePool>,
    binlog: Arc<dyn BinlogClient>,
    destination: Arc<dyn Destination>,
    cancelled: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl Worker {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SyncState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    async fn run(self, mysql_version: String) {
        match self.synchronize(&mysql_version).await {
            Ok(()) | Err(SyncError::Cancelled) => {
                info!("synchronization stopped");
                self.set_state(SyncState::Cancelled);
            }
            Err(e) => {
                error!(error = %e, "synchronization failed");
                self.destination.publish_error(&e);
                self.set_state(SyncState::Failed);
            }
        }
    }

    async fn synchronize(&self, mysql_version: &str) -> Result<()> {
        let Some((mut metadata, mut stream)) = self.prepare_synchronized(mysql_version).await
        else {
            return Ok(());
        };

        self.set_state(SyncState::Streaming);
        let mut buffers = Buffers::new(&self.config.database_name);
        let mut watch = Instant::now();

        while !self.is_cancelled() {
            let max_flush_time = self.config.settings.max_flush_data_time;
            let elapsed = watch.elapsed().as_millis() as u64;
            let timeout = Duration::from_millis(max(1, max_flush_time.saturating_sub(elapsed)));

            match stream.read_event(timeout).await {
                Ok(Some(event)) => {
                    let position = stream.position();
                    self.on_event(&mut buffers, event, &mut metadata, position)
                        .await?;
                }
                Ok(None) => {}
                Err(e) if e.is_retriable() => {
                    warn!(error = %e, "binlog stream unavailable, backing off");
                    tokio::time::sleep(Duration::from_millis(
                        self.config.settings.max_wait_time_when_mysql_unavailable,
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }

            let settings = &self.config.settings;
            if watch.elapsed().as_millis() as u64 > max_flush_time
                || buffers.check_thresholds(
                    settings.max_rows_in_buffer,
                    settings.max_bytes_in_buffer,
                    settings.max_rows_in_buffers,
                    settings.max_bytes_in_buffers,
                )
            {
                watch = Instant::now();
                if !buffers.is_empty() {
                    self.flush_buffers(&mut buffers, &mut metadata, stream.position())
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Establish metadata and a binlog stream, retrying until success or
    /// cancellation. Connection loss backs off; everything else is logged
    /// and retried immediately.
    async fn prepare_synchronized(
        &self,
        mysql_version: &str,
    ) -> Option<(MaterializeMetadata, Box<dyn BinlogStream>)> {
        let ddl_prefix = self.config.ddl_prefix();
        while !self.is_cancelled() {
            self.set_state(SyncState::Snapshotting);
            let attempt = async {
                let metadata = snapshot::prepare_snapshot(
                    self.pool.as_ref(),
                    self.destination.as_ref(),
                    &self.config.database_name,
                    &self.config.mysql_database_name,
                    mysql_version,
                    &ddl_prefix,
                    || self.is_cancelled(),
                )
                .await?;

                let position = metadata.position();
                let stream = self
                    .binlog
                    .start_dump(
                        next_server_id(),
                        &self.config.mysql_database_name,
                        &position,
                    )
                    .await?;
                Ok::<_, SyncError>((metadata, stream))
            };

            match attempt.await {
                Ok(prepared) => return Some(prepared),
                Err(SyncError::Cancelled) => {}
                Err(e) => {
                    warn!(error = %e, "snapshot attempt failed, will retry");
                    if e.is_retriable() {
                        tokio::time::sleep(Duration::from_millis(
                            self.config.settings.max_wait_time_when_mysql_unavailable,
                        ))
                        .await;
                    }
                }
            }
        }
        None
    }

    async fn on_event(
        &self,
        buffers: &mut Buffers,
        event: BinlogEvent,
        metadata: &mut MaterializeMetadata,
        position: BinlogPosition,
    ) -> Result<()> {
        match event {
            BinlogEvent::WriteRows(rows_event) => {
                let (block_rows, block_bytes, written_bytes) = {
                    let (block, _) = buffers
                        .table_buffer(self.destination.as_ref(), &rows_event.table)
                        .await?;
                    let written =
                        translate::append_write_rows(&rows_event.rows, block, &mut metadata.version)?;
                    (block.rows(), block.bytes(), written)
                };
                buffers.add(block_rows, block_bytes, rows_event.rows.len(), written_bytes);
            }
            BinlogEvent::UpdateRows(rows_event) => {
                let (block_rows, block_bytes, written_bytes) = {
                    let (block, sorting_columns_index) = buffers
                        .table_buffer(self.destination.as_ref(), &rows_event.table)
                        .await?;
                    let written = translate::append_update_rows(
                        &rows_event.rows,
                        block,
                        &mut metadata.version,
                        sorting_columns_index,
                    )?;
                    (block.rows(), block.bytes(), written)
                };
                buffers.add(block_rows, block_bytes, rows_event.rows.len(), written_bytes);
            }
            BinlogEvent::DeleteRows(rows_event) => {
                let (block_rows, block_bytes, written_bytes) = {
                    let (block, _) = buffers
                        .table_buffer(self.destination.as_ref(), &rows_event.table)
                        .await?;
                    let written =
                        translate::append_delete_rows(&rows_event.rows, block, &mut metadata.version)?;
                    (block.rows(), block.bytes(), written)
                };
                buffers.add(block_rows, block_bytes, rows_event.rows.len(), written_bytes);
            }
            BinlogEvent::Query(query_event) => {
                // Make the pre-DDL state durable before the schema moves.
                self.flush_buffers(buffers, metadata, position).await?;

                let event_database = if query_event.schema == self.config.mysql_database_name {
                    self.config.database_name.clone()
                } else {
                    // Statements for other schemas go through with an empty
                    // target; the destination's executor decides.
                    String::new()
                };
                let query = format!("{}{}", self.config.ddl_prefix(), query_event.query);
                match self
                    .destination
                    .execute(&query, &event_database, SYNC_STEP_COMMENT)
                    .await
                {
                    Ok(()) => {}
                    Err(SyncError::Syntax(message)) => {
                        // Replication may fail on later events anyway, but an
                        // untranslatable statement alone does not stop it.
                        warn!(error = %message, "skipping DDL the destination cannot parse");
                    }
                    Err(e) => return Err(e),
                }
            }
            BinlogEvent::Heartbeat => {}
            BinlogEvent::Unknown(description) => {
                debug!(event = %description, "skip binlog event");
            }
        }
        Ok(())
    }

    async fn flush_buffers(
        &self,
        buffers: &mut Buffers,
        metadata: &mut MaterializeMetadata,
        position: BinlogPosition,
    ) -> Result<()> {
        metadata
            .transaction(&position, buffers.commit(self.destination.as_ref()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{ColumnData, ColumnKind, ColumnSchema};
    use crate::destination::MemoryDestination;
    use crate::event::{QueryEventData, RowsEventData};
    use crate::testing::{wait_until, ScriptedBinlog, ScriptedPool};
    use crate::value::Field;
    use tempfile::TempDir;

    fn users_schema() -> Vec<ColumnSchema> {
        vec![
            ColumnSchema::new("id", ColumnKind::UInt64),
            ColumnSchema::new("v", ColumnKind::String),
            ColumnSchema::new("_sign", ColumnKind::Int8),
            ColumnSchema::new("_version", ColumnKind::UInt64),
        ]
    }

    fn row(id: u64, v: &str) -> Vec<Field> {
        vec![Field::UInt64(id), Field::from(v)]
    }

    fn write_event(table: &str, rows: Vec<Vec<Field>>) -> BinlogEvent {
        BinlogEvent::WriteRows(RowsEventData {
            table: table.to_string(),
            rows,
        })
    }

    fn healthy_pool() -> ScriptedPool {
        ScriptedPool::new()
            .on(
                "SHOW VARIABLES",
                vec![
                    vec![Field::from("log_bin"), Field::from("ON")],
                    vec![Field::from("binlog_format"), Field::from("ROW")],
                    vec![Field::from("binlog_row_image"), Field::from("FULL")],
                    vec![
                        Field::from("default_authentication_plugin"),
                        Field::from("mysql_native_password"),
                    ],
                ],
            )
            .on("SELECT version()", vec![vec![Field::from("8.0.36")]])
    }

    /// Destination with a live `users` table and metadata already durable at
    /// version 10, so the worker resumes straight into streaming.
    async fn resumable_fixture(dir: &TempDir) -> MemoryDestination {
        let destination = MemoryDestination::new(dir.path());
        destination.define_table("users", users_schema(), vec!["id"]);
        destination.make_live("shop_m", "users");

        let position = BinlogPosition::new("mysql-bin.000009", 990, "");
        let mut metadata = MaterializeMetadata::bootstrap(
            dir.path().join(".metadata"),
            "shop",
            "8.0.36",
            &position,
        );
        metadata.version = 10;
        metadata
            .transaction(&position, async { Ok(()) })
            .await
            .unwrap();
        destination
    }

    fn fast_settings() -> SyncSettings {
        SyncSettings::default()
            .with_max_flush_data_time(30)
            .with_max_wait_time_when_mysql_unavailable(10)
    }

    fn supervisor(
        destination: &Arc<MemoryDestination>,
        binlog: &ScriptedBinlog,
    ) -> SyncSupervisor {
        SyncSupervisor::new(
            SyncConfig::new("shop_m", "shop").with_settings(fast_settings()),
            Arc::new(healthy_pool()),
            Arc::new(binlog.clone()),
            Arc::clone(destination) as Arc<dyn Destination>,
        )
    }

    #[tokio::test]
    async fn test_streams_events_and_advances_metadata() {
        let dir = TempDir::new().unwrap();
        let destination = Arc::new(resumable_fixture(&dir).await);

        let binlog = ScriptedBinlog::new("mysql-bin.000009", 990);
        binlog.push(write_event("users", vec![row(1, "a")]));
        binlog.push(BinlogEvent::UpdateRows(RowsEventData {
            table: "users".to_string(),
            rows: vec![row(1, "a"), row(2, "a")],
        }));
        binlog.push(BinlogEvent::Heartbeat);

        let mut supervisor = supervisor(&destination, &binlog);
        supervisor.start().await.unwrap();

        let flushed = wait_until(Duration::from_secs(2), || {
            !destination.written_blocks("shop_m", "users").is_empty()
        })
        .await;
        assert!(flushed, "worker never flushed");
        assert_eq!(supervisor.state(), SyncState::Streaming);

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SyncState::Cancelled);

        // One insert (version 11) plus a key-moving update (-1/+1, both 12).
        let blocks = destination.written_blocks("shop_m", "users");
        let mut versions = Vec::new();
        let mut signs = Vec::new();
        for block in &blocks {
            match &block.column(3).data {
                ColumnData::UInt64(values) => versions.extend_from_slice(values),
                other => panic!("unexpected storage: {other:?}"),
            }
            match &block.column(2).data {
                ColumnData::Int8(values) => signs.extend_from_slice(values),
                other => panic!("unexpected storage: {other:?}"),
            }
        }
        assert_eq!(versions, vec![11, 12, 12]);
        assert_eq!(signs, vec![1, -1, 1]);

        // The durable position moved past the resume point; the dump started
        // from the durable position.
        let metadata = MaterializeMetadata::load(&dir.path().join(".metadata"))
            .await
            .unwrap()
            .unwrap();
        assert!(metadata.binlog_offset > 990);
        assert_eq!(metadata.version, 12);
        assert_eq!(binlog.dump_requests(), vec![("shop".to_string(), 990)]);
    }

    #[tokio::test]
    async fn test_ddl_flushes_then_forwards_with_routing() {
        let dir = TempDir::new().unwrap();
        let destination = Arc::new(resumable_fixture(&dir).await);

        let binlog = ScriptedBinlog::new("mysql-bin.000009", 990);
        binlog.push(write_event("users", vec![row(5, "x")]));
        binlog.push(BinlogEvent::Query(QueryEventData {
            schema: "shop".to_string(),
            query: "ALTER TABLE t ADD COLUMN w INT".to_string(),
        }));
        binlog.push(BinlogEvent::Query(QueryEventData {
            schema: "elsewhere".to_string(),
            query: "ALTER TABLE other DROP COLUMN q".to_string(),
        }));

        let mut supervisor = supervisor(&destination, &binlog);
        supervisor.start().await.unwrap();

        let forwarded = wait_until(Duration::from_secs(2), || {
            destination
                .executed_queries()
                .iter()
                .filter(|q| q.comment == SYNC_STEP_COMMENT)
                .count()
                >= 2
        })
        .await;
        assert!(forwarded, "DDL was never forwarded");
        supervisor.stop().await;

        // The buffered insert flushed before the DDL went through.
        assert_eq!(destination.written_blocks("shop_m", "users").len(), 1);

        let queries = destination.executed_queries();
        let own_schema = queries
            .iter()
            .find(|q| q.query.contains("ADD COLUMN w"))
            .unwrap();
        assert!(own_schema.query.starts_with("EXTERNAL DDL FROM MySQL("));
        assert_eq!(own_schema.database, "shop_m");

        let foreign_schema = queries
            .iter()
            .find(|q| q.query.contains("DROP COLUMN q"))
            .unwrap();
        assert_eq!(foreign_schema.database, "");

        // The DDL flush advanced the durable position to the DDL's event.
        let metadata = MaterializeMetadata::load(&dir.path().join(".metadata"))
            .await
            .unwrap()
            .unwrap();
        assert!(metadata.binlog_offset > 990);
    }

    #[tokio::test]
    async fn test_unparseable_ddl_is_skipped() {
        let dir = TempDir::new().unwrap();
        let destination = Arc::new(resumable_fixture(&dir).await);
        destination.reject_as_syntax_error("UNPARSEABLE");

        let binlog = ScriptedBinlog::new("mysql-bin.000009", 990);
        binlog.push(BinlogEvent::Query(QueryEventData {
            schema: "shop".to_string(),
            query: "CREATE UNPARSEABLE THING".to_string(),
        }));
        binlog.push(write_event("users", vec![row(9, "alive")]));

        let mut supervisor = supervisor(&destination, &binlog);
        supervisor.start().await.unwrap();

        let survived = wait_until(Duration::from_secs(2), || {
            !destination.written_blocks("shop_m", "users").is_empty()
        })
        .await;
        assert!(survived, "replication died on a syntax error");
        assert_eq!(supervisor.state(), SyncState::Streaming);
        supervisor.stop().await;
        assert!(destination.published_errors().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_error_is_published_and_worker_stops() {
        let dir = TempDir::new().unwrap();
        let destination = Arc::new(resumable_fixture(&dir).await);

        let binlog = ScriptedBinlog::new("mysql-bin.000009", 990);
        binlog.push(write_event("ghost", vec![row(1, "a")]));

        let mut supervisor = supervisor(&destination, &binlog);
        supervisor.start().await.unwrap();

        let failed = wait_until(Duration::from_secs(2), || {
            supervisor.state() == SyncState::Failed
        })
        .await;
        assert!(failed, "worker did not fail");

        let errors = destination.published_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ghost"));
        supervisor.stop().await;
        // A failed worker stays failed; stop() does not rewrite history.
        assert_eq!(supervisor.state(), SyncState::Failed);
    }

    #[tokio::test]
    async fn test_unavailable_source_keeps_retrying_until_stopped() {
        let dir = TempDir::new().unwrap();
        let destination = Arc::new(MemoryDestination::new(dir.path()));

        let binlog = ScriptedBinlog::new("mysql-bin.000001", 4);
        let mut supervisor = SyncSupervisor::new(
            SyncConfig::new("shop_m", "shop").with_settings(fast_settings()),
            Arc::new(healthy_pool().fail_on("SHOW MASTER STATUS")),
            Arc::new(binlog.clone()),
            Arc::clone(&destination) as Arc<dyn Destination>,
        );
        supervisor.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.state(), SyncState::Snapshotting);
        assert!(destination.published_errors().is_empty());

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SyncState::Cancelled);
    }

    #[tokio::test]
    async fn test_misconfigured_source_never_starts_worker() {
        let dir = TempDir::new().unwrap();
        let destination = Arc::new(MemoryDestination::new(dir.path()));

        let pool = ScriptedPool::new()
            .on(
                "SHOW VARIABLES",
                vec![vec![Field::from("log_bin"), Field::from("ON")]],
            )
            .on("SELECT version()", vec![vec![Field::from("8.0.36")]]);

        let binlog = ScriptedBinlog::new("mysql-bin.000001", 4);
        let mut supervisor = SyncSupervisor::new(
            SyncConfig::new("shop_m", "shop"),
            Arc::new(pool),
            Arc::new(binlog.clone()),
            Arc::clone(&destination) as Arc<dyn Destination>,
        );

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SyncError::IllegalSourceVariable { .. }));
        assert_eq!(supervisor.state(), SyncState::Failed);
        assert!(binlog.dump_requests().is_empty());
    }

    #[test]
    fn test_ddl_prefix_quotes_identifiers() {
        let config = SyncConfig::new("shop_m", "shop");
        assert_eq!(
            config.ddl_prefix(),
            "EXTERNAL DDL FROM MySQL(`shop_m`, `shop`) "
        );
    }
}
