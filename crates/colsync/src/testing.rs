//! Scripted source fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Result, SyncError};
use crate::event::{BinlogEvent, BinlogPosition};
use crate::source::{BinlogClient, BinlogStream, SourceConnection, SourcePool};
use crate::value::Field;

/// Poll `condition` every few milliseconds until it holds or `timeout` runs out.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Default)]
struct ScriptedPoolState {
    /// (substring marker, result rows), matched in insertion order.
    rules: Vec<(String, Vec<Vec<Field>>)>,
    /// Statements and queries, in execution order.
    executed: Vec<String>,
    fail_marker: Option<String>,
    unreachable: bool,
}

/// A [`SourcePool`] answering queries from a substring-matched script.
#[derive(Clone, Default)]
pub(crate) struct ScriptedPool {
    state: Arc<Mutex<ScriptedPoolState>>,
}

impl ScriptedPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pool whose `acquire` always fails.
    pub fn unreachable() -> Self {
        let pool = Self::new();
        pool.state.lock().unwrap().unreachable = true;
        pool
    }

    /// Answer queries containing `marker` with `rows`.
    pub fn on(self, marker: &str, rows: Vec<Vec<Field>>) -> Self {
        self.state
            .lock()
            .unwrap()
            .rules
            .push((marker.to_string(), rows));
        self
    }

    /// Fail queries containing `marker` with a source-unavailable error.
    pub fn fail_on(self, marker: &str) -> Self {
        self.state.lock().unwrap().fail_marker = Some(marker.to_string());
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }
}

#[async_trait]
impl SourcePool for ScriptedPool {
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>> {
        if self.state.lock().unwrap().unreachable {
            return Err(SyncError::source_unavailable("scripted pool is unreachable"));
        }
        Ok(Box::new(ScriptedConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedConnection {
    state: Arc<Mutex<ScriptedPoolState>>,
}

impl ScriptedConnection {
    fn record_and_check(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(sql.to_string());
        if let Some(marker) = &state.fail_marker {
            if sql.contains(marker.as_str()) {
                return Err(SyncError::source_unavailable(format!(
                    "scripted failure on: {sql}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceConnection for ScriptedConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.record_and_check(sql)
    }

    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Vec<Field>>> {
        self.record_and_check(sql)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .rules
            .iter()
            .find(|(marker, _)| sql.contains(marker.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

/// A [`BinlogClient`] handing out streams over a shared event queue.
#[derive(Clone)]
pub(crate) struct ScriptedBinlog {
    file: String,
    offset: Arc<AtomicU64>,
    events: Arc<Mutex<VecDeque<BinlogEvent>>>,
    dump_requests: Arc<Mutex<Vec<(String, u64)>>>,
}

impl ScriptedBinlog {
    pub fn new(file: &str, start_offset: u64) -> Self {
        Self {
            file: file.to_string(),
            offset: Arc::new(AtomicU64::new(start_offset)),
            events: Arc::new(Mutex::new(VecDeque::new())),
            dump_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, event: BinlogEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    /// `(database, start_offset)` of every dump opened so far.
    pub fn dump_requests(&self) -> Vec<(String, u64)> {
        self.dump_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BinlogClient for ScriptedBinlog {
    async fn start_dump(
        &self,
        server_id: u32,
        database: &str,
        position: &BinlogPosition,
    ) -> Result<Box<dyn BinlogStream>> {
        assert_ne!(server_id, 0, "server id 0 is reserved");
        self.dump_requests
            .lock()
            .unwrap()
            .push((database.to_string(), position.offset));
        Ok(Box::new(ScriptedStream {
            file: self.file.clone(),
            offset: Arc::clone(&self.offset),
            events: Arc::clone(&self.events),
        }))
    }
}

struct ScriptedStream {
    file: String,
    offset: Arc<AtomicU64>,
    events: Arc<Mutex<VecDeque<BinlogEvent>>>,
}

#[async_trait]
impl BinlogStream for ScriptedStream {
    async fn read_event(&mut self, timeout: Duration) -> Result<Option<BinlogEvent>> {
        let event = self.events.lock().unwrap().pop_front();
        match event {
            Some(event) => {
                self.offset.fetch_add(23, Ordering::SeqCst);
                Ok(Some(event))
            }
            None => {
                tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
                Ok(None)
            }
        }
    }

    fn position(&self) -> BinlogPosition {
        BinlogPosition::new(self.file.clone(), self.offset.load(Ordering::SeqCst), "")
    }
}
