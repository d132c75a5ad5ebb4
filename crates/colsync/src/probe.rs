//! Source health probe
//!
//! Materialization only works against a server that writes full row images
//! to its binary log. The probe checks the four governing variables in one
//! filter query and captures the server version for the metadata record.

use tracing::info;

use crate::error::{Result, SyncError};
use crate::source::SourcePool;
use crate::value::Field;

/// Filter query matching exactly the four required variable settings.
///
/// A correctly configured server returns four rows; every missing row is a
/// missing or misconfigured variable.
pub const CHECK_VARIABLES_QUERY: &str = "SHOW VARIABLES WHERE \
     (Variable_name = 'log_bin' AND upper(Value) = 'ON') \
     OR (Variable_name = 'binlog_format' AND upper(Value) = 'ROW') \
     OR (Variable_name = 'binlog_row_image' AND upper(Value) = 'FULL') \
     OR (Variable_name = 'default_authentication_plugin' AND upper(Value) = 'MYSQL_NATIVE_PASSWORD');";

const REQUIREMENTS: [(&str, &str); 4] = [
    ("log_bin", "log_bin = 'ON'"),
    ("binlog_format", "binlog_format = 'ROW'"),
    ("binlog_row_image", "binlog_row_image = 'FULL'"),
    (
        "default_authentication_plugin",
        "default_authentication_plugin = 'mysql_native_password'",
    ),
];

/// Validate the source configuration and return its server version string.
///
/// Fails with [`SyncError::IllegalSourceVariable`] naming every unmet
/// requirement; connection problems surface as [`SyncError::SourceUnavailable`].
pub async fn check_source_and_get_version(pool: &dyn SourcePool) -> Result<String> {
    let mut connection = pool.acquire().await?;

    let variables = connection.query_rows(CHECK_VARIABLES_QUERY).await?;
    if variables.len() != REQUIREMENTS.len() {
        let mut missing: Vec<(&str, &str)> = REQUIREMENTS.to_vec();
        for row in &variables {
            if let Some(name) = row.first().and_then(Field::to_text) {
                missing.retain(|(variable, _)| *variable != name);
            }
        }
        return Err(SyncError::IllegalSourceVariable {
            missing: missing
                .into_iter()
                .map(|(_, requirement)| requirement.to_string())
                .collect(),
        });
    }

    let version_rows = connection.query_rows("SELECT version();").await?;
    let version = version_rows
        .first()
        .and_then(|row| row.first())
        .and_then(Field::to_text)
        .ok_or_else(|| SyncError::logical("cannot read the source server version"))?;

    info!(version = %version, "source server validated");
    Ok(version)
}
