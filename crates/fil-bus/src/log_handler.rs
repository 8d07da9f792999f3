use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One entry in the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonic sequence number; the query index.
    pub seq: u64,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    pub project_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// LogQuery
// ---------------------------------------------------------------------------

/// Conjunctive filter over the retained log.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub min_level: Option<LogLevel>,
    pub component: Option<String>,
    pub project_id: Option<Uuid>,
    /// Only records with `seq >= since_seq`.
    pub since_seq: Option<u64>,
}

impl LogQuery {
    fn matches(&self, record: &LogRecord) -> bool {
        if let Some(min) = self.min_level {
            if record.level < min {
                return false;
            }
        }
        if let Some(ref component) = self.component {
            if record.component != *component {
                return false;
            }
        }
        if let Some(project) = self.project_id {
            if record.project_id != Some(project) {
                return false;
            }
        }
        if let Some(since) = self.since_seq {
            if record.seq < since {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// LogHandler
// ---------------------------------------------------------------------------

/// Indexed append-only log with bounded retention and tail subscribers.
///
/// Tail subscribers share the bus drop semantics: a bounded channel per
/// subscriber, overflow drops the record for that subscriber only.
#[derive(Clone)]
pub struct LogHandler {
    inner: Arc<LogInner>,
}

struct LogInner {
    records: Mutex<LogBuffer>,
    tails: RwLock<HashMap<Uuid, flume::Sender<LogRecord>>>,
    tail_buffer: usize,
}

struct LogBuffer {
    records: VecDeque<LogRecord>,
    next_seq: u64,
    capacity: usize,
}

impl LogHandler {
    pub fn new(capacity: usize, tail_buffer: usize) -> Self {
        Self {
            inner: Arc::new(LogInner {
                records: Mutex::new(LogBuffer {
                    records: VecDeque::with_capacity(capacity),
                    next_seq: 0,
                    capacity,
                }),
                tails: RwLock::new(HashMap::new()),
                tail_buffer,
            }),
        }
    }

    /// Append a record, assign its sequence number and fan it out to tails.
    pub fn append(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
        project_id: Option<Uuid>,
    ) -> u64 {
        let record = {
            let mut buf = self
                .inner
                .records
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let record = LogRecord {
                seq: buf.next_seq,
                level,
                component: component.into(),
                message: message.into(),
                project_id,
                timestamp: Utc::now(),
            };
            buf.next_seq += 1;
            if buf.records.len() == buf.capacity {
                buf.records.pop_front();
            }
            buf.records.push_back(record.clone());
            record
        };

        let mut disconnected = Vec::new();
        {
            let tails = self.inner.tails.read().unwrap_or_else(|e| e.into_inner());
            for (id, tx) in tails.iter() {
                match tx.try_send(record.clone()) {
                    Ok(()) | Err(flume::TrySendError::Full(_)) => {}
                    Err(flume::TrySendError::Disconnected(_)) => disconnected.push(*id),
                }
            }
        }
        if !disconnected.is_empty() {
            let mut tails = self.inner.tails.write().unwrap_or_else(|e| e.into_inner());
            for id in disconnected {
                tails.remove(&id);
            }
        }

        record.seq
    }

    /// Query retained records oldest-first, capped at `limit`.
    pub fn query(&self, query: &LogQuery, limit: usize) -> Vec<LogRecord> {
        let buf = self
            .inner
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        buf.records
            .iter()
            .filter(|r| query.matches(r))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Subscribe to records appended from now on.
    pub fn tail(&self) -> (Uuid, flume::Receiver<LogRecord>) {
        let (tx, rx) = flume::bounded(self.inner.tail_buffer);
        let id = Uuid::new_v4();
        self.inner
            .tails
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        (id, rx)
    }

    pub fn untail(&self, id: Uuid) {
        self.inner
            .tails
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new(4096, 64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
