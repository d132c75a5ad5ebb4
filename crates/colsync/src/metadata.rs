//! Durable replication metadata
//!
//! One JSON file per materialized database records the binlog position and
//! the last `_version` handed out. The file is only rewritten through
//! [`MaterializeMetadata::transaction`], which runs a body to completion and
//! persists the new position atomically (temp file + rename) only if the
//! body succeeded. A crash between data application and the rename replays
//! events from the previous durable position; the version counter keeps the
//! replay idempotent at the collapse layer.

use std::future::Future;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::Result;
use crate::event::BinlogPosition;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataRecord {
    binlog_file: String,
    binlog_offset: u64,
    executed_gtid_set: String,
    version: u64,
    source_database_name: String,
    source_server_version: String,
}

/// In-memory replication state with its durable backing file.
#[derive(Debug)]
pub struct MaterializeMetadata {
    path: PathBuf,
    pub binlog_file: String,
    pub binlog_offset: u64,
    pub executed_gtid_set: String,
    /// Last `_version` handed out; strictly increases across the lifetime of
    /// the materialized database.
    pub version: u64,
    pub source_database_name: String,
    pub source_server_version: String,
}

impl MaterializeMetadata {
    /// Load the record from `path`, or `None` if no bootstrap happened yet.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: MetadataRecord = serde_json::from_str(&content)?;
        debug!(
            position = %format!("{}:{}", record.binlog_file, record.binlog_offset),
            version = record.version,
            "loaded replication metadata"
        );
        Ok(Some(Self {
            path: path.to_path_buf(),
            binlog_file: record.binlog_file,
            binlog_offset: record.binlog_offset,
            executed_gtid_set: record.executed_gtid_set,
            version: record.version,
            source_database_name: record.source_database_name,
            source_server_version: record.source_server_version,
        }))
    }

    /// Fresh state for a first bootstrap. Nothing is written until the first
    /// successful [`transaction`](Self::transaction).
    pub fn bootstrap(
        path: impl Into<PathBuf>,
        source_database_name: impl Into<String>,
        source_server_version: impl Into<String>,
        position: &BinlogPosition,
    ) -> Self {
        Self {
            path: path.into(),
            binlog_file: position.file.clone(),
            binlog_offset: position.offset,
            executed_gtid_set: position.gtid_set.clone(),
            version: 0,
            source_database_name: source_database_name.into(),
            source_server_version: source_server_version.into(),
        }
    }

    /// The recorded binlog position.
    pub fn position(&self) -> BinlogPosition {
        BinlogPosition::new(
            self.binlog_file.clone(),
            self.binlog_offset,
            self.executed_gtid_set.clone(),
        )
    }

    /// Run `body` to completion; persist `position` (and the current version
    /// counter) only if it returned normally.
    ///
    /// On error the durable record is untouched, so the next start replays
    /// from the previous position.
    pub async fn transaction<T, F>(&mut self, position: &BinlogPosition, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        let value = body.await?;

        self.binlog_file = position.file.clone();
        self.binlog_offset = position.offset;
        self.executed_gtid_set = position.gtid_set.clone();
        self.persist().await?;

        Ok(value)
    }

    async fn persist(&self) -> Result<()> {
        let record = MetadataRecord {
            binlog_file: self.binlog_file.clone(),
            binlog_offset: self.binlog_offset,
            executed_gtid_set: self.executed_gtid_set.clone(),
            version: self.version,
            source_database_name: self.source_database_name.clone(),
            source_server_version: self.source_server_version.clone(),
        };
        let content = serde_json::to_string_pretty(&record)?;

        // Temp file + rename keeps the record intact across a crash mid-write.
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(
            position = %format!("{}:{}", self.binlog_file, self.binlog_offset),
            version = self.version,
            "persisted replication metadata"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use tempfile::TempDir;

    fn position(offset: u64) -> BinlogPosition {
        BinlogPosition::new("mysql-bin.000007", offset, "uuid:1-20")
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_none() {
        let dir = TempDir::new().unwrap();
        let loaded = MaterializeMetadata::load(&dir.path().join(".metadata"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_transaction_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".metadata");

        {
            let mut metadata =
                MaterializeMetadata::bootstrap(&path, "shop", "8.0.36", &position(154));
            metadata.version = 42;
            metadata
                .transaction(&position(700), async { Ok(()) })
                .await
                .unwrap();
        }

        let loaded = MaterializeMetadata::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.binlog_file, "mysql-bin.000007");
        assert_eq!(loaded.binlog_offset, 700);
        assert_eq!(loaded.executed_gtid_set, "uuid:1-20");
        assert_eq!(loaded.version, 42);
        assert_eq!(loaded.source_database_name, "shop");
        assert_eq!(loaded.source_server_version, "8.0.36");
    }

    #[tokio::test]
    async fn test_failed_body_leaves_record_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".metadata");

        let mut metadata = MaterializeMetadata::bootstrap(&path, "shop", "8.0.36", &position(154));
        metadata
            .transaction(&position(154), async { Ok(()) })
            .await
            .unwrap();

        let result: Result<()> = metadata
            .transaction(&position(900), async {
                Err(SyncError::destination("pipeline broke"))
            })
            .await;
        assert!(result.is_err());

        let loaded = MaterializeMetadata::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.binlog_offset, 154);
    }

    #[tokio::test]
    async fn test_persist_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".metadata");

        let mut metadata = MaterializeMetadata::bootstrap(&path, "shop", "8.0.36", &position(4));
        metadata
            .transaction(&position(4), async { Ok(()) })
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_bootstrap_writes_nothing_by_itself() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".metadata");
        let _ = MaterializeMetadata::bootstrap(&path, "shop", "8.0.36", &position(4));
        assert!(!path.exists());
    }
}
