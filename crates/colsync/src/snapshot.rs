//! Initial snapshot and handover
//!
//! The snapshot coordinator produces the metadata a binlog dump can start
//! from. On a first bootstrap it opens one consistent-snapshot transaction
//! and, inside it, reads the binlog position, the GTID set and the table
//! list, so all three observe the same point in the log. Stale destination
//! tables are dropped, translated CREATE statements executed and the full
//! table contents streamed — all wrapped in the metadata transaction, so
//! either every step becomes durable or none does. On later starts the
//! durable metadata short-circuits the whole dance.

use std::time::Instant;

use tracing::{info, warn};

use crate::block::TRAILER_COLUMNS;
use crate::destination::{BlockSink, CountingSink, Destination};
use crate::error::{Result, SyncError};
use crate::event::BinlogPosition;
use crate::metadata::MaterializeMetadata;
use crate::source::{SourceConnection, SourcePool};
use crate::translate::write_fields_to_column;
use crate::value::Field;

/// Marker attached to every snapshot-phase destination query.
pub(crate) const DUMP_STEP_COMMENT: &str = "colsync step 1: dump source data";

/// Rows per block while streaming a table dump.
const DUMP_BLOCK_ROWS: usize = 65_505;

/// Quote an identifier for a source-side query.
pub(crate) fn back_quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// Establish the replication metadata, dumping the source if needed.
///
/// `is_cancelled` is polled between tables and between blocks; cancellation
/// aborts with [`SyncError::Cancelled`] before the metadata transaction
/// commits, so the next attempt starts from scratch.
pub async fn prepare_snapshot(
    pool: &dyn SourcePool,
    destination: &dyn Destination,
    database_name: &str,
    mysql_database_name: &str,
    mysql_server_version: &str,
    ddl_prefix: &str,
    is_cancelled: impl Fn() -> bool + Send + Sync,
) -> Result<MaterializeMetadata> {
    let metadata_path = destination.metadata_path().join(".metadata");
    if let Some(metadata) = MaterializeMetadata::load(&metadata_path).await? {
        info!(
            position = %metadata.position(),
            version = metadata.version,
            "resuming from durable metadata, no dump needed"
        );
        return Ok(metadata);
    }

    let mut connection = pool.acquire().await?;
    let mut opened_transaction = false;

    let result = snapshot_under_transaction(
        &mut *connection,
        &mut opened_transaction,
        destination,
        database_name,
        mysql_database_name,
        mysql_server_version,
        ddl_prefix,
        &metadata_path,
        &is_cancelled,
    )
    .await;

    if result.is_err() && opened_transaction {
        if let Err(rollback_error) = connection.execute("ROLLBACK").await {
            warn!(error = %rollback_error, "rollback after failed snapshot also failed");
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn snapshot_under_transaction(
    connection: &mut dyn SourceConnection,
    opened_transaction: &mut bool,
    destination: &dyn Destination,
    database_name: &str,
    mysql_database_name: &str,
    mysql_server_version: &str,
    ddl_prefix: &str,
    metadata_path: &std::path::Path,
    is_cancelled: &(impl Fn() -> bool + Send + Sync),
) -> Result<MaterializeMetadata> {
    connection
        .execute("START TRANSACTION WITH CONSISTENT SNAPSHOT")
        .await?;
    *opened_transaction = true;

    let position = fetch_master_status(connection).await?;
    let need_dumping_tables = fetch_tables_with_ddl(connection, mysql_database_name).await?;
    info!(
        position = %position,
        tables = need_dumping_tables.len(),
        "opened consistent snapshot"
    );

    let mut metadata = MaterializeMetadata::bootstrap(
        metadata_path,
        mysql_database_name,
        mysql_server_version,
        &position,
    );

    if !need_dumping_tables.is_empty() {
        metadata
            .transaction(&position, async {
                clean_outdated_tables(destination, database_name).await?;
                dump_tables(
                    connection,
                    destination,
                    &need_dumping_tables,
                    database_name,
                    mysql_database_name,
                    ddl_prefix,
                    is_cancelled,
                )
                .await
            })
            .await?;
    }

    connection.execute("COMMIT").await?;
    *opened_transaction = false;

    Ok(metadata)
}

/// Read the binlog position inside the open snapshot transaction.
async fn fetch_master_status(connection: &mut dyn SourceConnection) -> Result<BinlogPosition> {
    let rows = connection.query_rows("SHOW MASTER STATUS").await?;
    let row = rows.first().ok_or_else(|| {
        SyncError::source_unavailable(
            "SHOW MASTER STATUS returned no rows; is binary logging enabled?",
        )
    })?;

    let file = row
        .first()
        .and_then(Field::to_text)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| {
            SyncError::source_unavailable("SHOW MASTER STATUS returned an empty binlog file name")
        })?;
    let offset = row
        .get(1)
        .and_then(Field::to_u64)
        .ok_or_else(|| SyncError::logical("SHOW MASTER STATUS carries no binlog offset"))?;
    let gtid_set = row.get(4).and_then(Field::to_text).unwrap_or_default();

    Ok(BinlogPosition::new(file, offset, gtid_set))
}

/// Enumerate the source tables and capture their CREATE statements, all
/// inside the snapshot transaction.
async fn fetch_tables_with_ddl(
    connection: &mut dyn SourceConnection,
    mysql_database_name: &str,
) -> Result<Vec<(String, String)>> {
    let list_query = format!(
        "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
         WHERE TABLE_SCHEMA = '{}' AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
        mysql_database_name.replace('\'', "''")
    );
    let rows = connection.query_rows(&list_query).await?;

    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        let table_name = row
            .first()
            .and_then(Field::to_text)
            .ok_or_else(|| SyncError::logical("table enumeration returned a nameless row"))?;

        let show_create = format!(
            "SHOW CREATE TABLE {}.{}",
            back_quote(mysql_database_name),
            back_quote(&table_name)
        );
        let create_rows = connection.query_rows(&show_create).await?;
        let create_query = create_rows
            .first()
            .and_then(|r| r.get(1))
            .and_then(Field::to_text)
            .ok_or_else(|| {
                SyncError::logical(format!("SHOW CREATE TABLE {table_name} returned no DDL"))
            })?;

        tables.push((table_name, create_query));
    }
    Ok(tables)
}

/// Drop every pre-existing table in the destination database.
async fn clean_outdated_tables(destination: &dyn Destination, database_name: &str) -> Result<()> {
    for table_name in destination.list_tables(database_name).await? {
        let drop_query = format!(
            "DROP TABLE {}.{}",
            back_quote(database_name),
            back_quote(&table_name)
        );
        destination
            .execute(&drop_query, database_name, DUMP_STEP_COMMENT)
            .await?;
    }
    Ok(())
}

/// Create each destination table from its translated DDL and stream the full
/// source contents through an insert pipeline.
async fn dump_tables(
    connection: &mut dyn SourceConnection,
    destination: &dyn Destination,
    tables: &[(String, String)],
    database_name: &str,
    mysql_database_name: &str,
    ddl_prefix: &str,
    is_cancelled: &(impl Fn() -> bool + Send + Sync),
) -> Result<()> {
    for (table_name, create_query) in tables {
        if is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let create = format!("{ddl_prefix}{create_query}");
        destination
            .execute(&create, database_name, DUMP_STEP_COMMENT)
            .await?;

        let meta = destination.table_meta(database_name, table_name).await?;
        let header = meta
            .sample_block
            .head_columns(meta.sample_block.column_count() - TRAILER_COLUMNS);

        let select = format!(
            "SELECT * FROM {}.{}",
            back_quote(mysql_database_name),
            back_quote(table_name)
        );
        let rows = connection.query_rows(&select).await?;

        let mut out = CountingSink::new(
            destination
                .insert_pipeline(database_name, table_name, false)
                .await?,
        );

        let watch = Instant::now();
        for chunk in rows.chunks(DUMP_BLOCK_ROWS) {
            if is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let mut block = header.clone_empty();
            for column_index in 0..block.column_count() {
                write_fields_to_column(block.column_mut(column_index), chunk, column_index, None)?;
            }
            out.write(&block).await?;
        }

        let elapsed = watch.elapsed().as_secs_f64().max(f64::EPSILON);
        info!(
            table = %table_name,
            rows = out.written_rows(),
            bytes = out.written_bytes(),
            elapsed_sec = format!("{elapsed:.3}"),
            rows_per_sec = (out.written_rows() as f64 / elapsed) as u64,
            "dumped source table"
        );
    }
    Ok(())
}
