//! Source-side seams: query connections and the binlog dump stream
//!
//! The engine talks to MySQL through two channels. Plain query connections
//! ([`SourcePool`] / [`SourceConnection`]) serve the health probe and the
//! snapshot transaction; [`MySqlSourcePool`] is the `mysql_async`-backed
//! implementation. The binlog dump stream ([`BinlogClient`] /
//! [`BinlogStream`]) yields typed events and is supplied by the embedding
//! server, which owns the replication wire protocol.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::*;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::event::{BinlogEvent, BinlogPosition};
use crate::value::Field;

/// A pooled query connection to the source.
#[async_trait]
pub trait SourceConnection: Send {
    /// Execute a statement, discarding any result set.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Run a query and collect the full result set as rows of [`Field`]s.
    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Field>>>;
}

/// A pool of query connections to the source.
#[async_trait]
pub trait SourcePool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>>;
}

/// A live binlog dump stream yielding typed events.
#[async_trait]
pub trait BinlogStream: Send {
    /// Wait up to `timeout` for the next event.
    ///
    /// Returns `Ok(None)` on timeout so the caller's flush clock keeps
    /// running against an idle source.
    async fn read_event(&mut self, timeout: Duration) -> Result<Option<BinlogEvent>>;

    /// Position after the last event handed out (the replay point).
    fn position(&self) -> BinlogPosition;
}

/// Opens binlog dump streams.
#[async_trait]
pub trait BinlogClient: Send + Sync {
    /// Start a dump from `position`, registering under `server_id`.
    async fn start_dump(
        &self,
        server_id: u32,
        database: &str,
        position: &BinlogPosition,
    ) -> Result<Box<dyn BinlogStream>>;
}

/// Process-wide server-id allocator.
///
/// Seeded once from entropy, then handed out sequentially so a reconnect
/// storm cannot collide with ids issued earlier in the same process.
static SERVER_ID_COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(rand::random()));

/// Allocate a 32-bit replication server id. Never returns 0 (reserved).
pub fn next_server_id() -> u32 {
    loop {
        let id = SERVER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// `mysql_async`-backed [`SourcePool`].
pub struct MySqlSourcePool {
    pool: mysql_async::Pool,
}

impl MySqlSourcePool {
    /// Build a pool for the given source.
    ///
    /// Credentials are URL-encoded and the assembled URL is dropped right
    /// after pool creation so it cannot reach logs.
    pub fn new(host: &str, port: u16, user: &str, password: &str, database: &str) -> Self {
        let encoded_user = url::form_urlencoded::byte_serialize(user.as_bytes()).collect::<String>();
        let encoded_password =
            url::form_urlencoded::byte_serialize(password.as_bytes()).collect::<String>();
        let pool = {
            let url = format!(
                "mysql://{}:{}@{}:{}/{}",
                encoded_user, encoded_password, host, port, database
            );
            mysql_async::Pool::new(url.as_str())
        };
        Self { pool }
    }

    pub fn from_pool(pool: mysql_async::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourcePool for MySqlSourcePool {
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>> {
        let conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| SyncError::source_unavailable(e.to_string()))?;
        Ok(Box::new(MySqlSourceConnection { conn }))
    }
}

struct MySqlSourceConnection {
    conn: mysql_async::Conn,
}

#[async_trait]
impl SourceConnection for MySqlSourceConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.conn
            .query_drop(sql)
            .await
            .map_err(|e| SyncError::source_unavailable(e.to_string()))
    }

    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Field>>> {
        let rows: Vec<mysql_async::Row> = self
            .conn
            .query(sql)
            .await
            .map_err(|e| SyncError::source_unavailable(e.to_string()))?;
        debug!(rows = rows.len(), "source query returned");
        Ok(rows
            .into_iter()
            .map(|row| row.unwrap().into_iter().map(value_to_field).collect())
            .collect())
    }
}

/// Map a `mysql_async` value onto the engine's field tags.
///
/// Integers keep their 64-bit wire representation under the `UInt64` tag;
/// the `Int64` tag is reserved for the binlog decoder's INT24 images.
fn value_to_field(value: mysql_async::Value) -> Field {
    use mysql_async::Value;
    match value {
        Value::NULL => Field::Null,
        Value::Int(v) => Field::UInt64(v as u64),
        Value::UInt(v) => Field::UInt64(v),
        Value::Float(v) => Field::Float64(f64::from(v)),
        Value::Double(v) => Field::Float64(v),
        Value::Bytes(bytes) => Field::Bytes(bytes),
        Value::Date(year, month, day, hour, minute, second, micros) => Field::Bytes(
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                year, month, day, hour, minute, second, micros
            )
            .into_bytes(),
        ),
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            let hours = u32::from(hours) + days * 24;
            Field::Bytes(
                format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, minutes, seconds, micros)
                    .into_bytes(),
            )
        }
    }
}
