//! Append-only message traffic log, one JSON record per line.
//!
//! Writes are best-effort: a failed append is logged and the record dropped.
//! Reads scan the whole file; there is no rotation.

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::notifier::{Notifier, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// What produced an outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SendSource {
    Auto,
    SendTest,
    Batch,
}

impl SendSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendSource::Auto => "auto",
            SendSource::SendTest => "send-test",
            SendSource::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Epoch milliseconds.
    pub ts: i64,
    #[serde(default)]
    pub iso: String,
    #[serde(rename = "type")]
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, alias = "to")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SendSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventRecord {
    fn now(direction: Direction) -> Self {
        let mut record = Self {
            ts: 0,
            iso: String::new(),
            direction,
            agent: None,
            number: None,
            name: None,
            text: None,
            msg_type: None,
            template: None,
            source: None,
            ok: None,
            error: None,
        };
        record.set_timestamp(Utc::now().timestamp_millis());
        record
    }

    pub fn inbound(
        agent: &str,
        number: &str,
        name: Option<String>,
        text: &str,
        msg_type: &str,
    ) -> Self {
        Self {
            agent: Some(agent.to_string()),
            number: Some(number.to_string()),
            name,
            text: Some(text.to_string()),
            msg_type: Some(msg_type.to_string()),
            ..Self::now(Direction::In)
        }
    }

    pub fn sent(agent: &str, to: &str, text: &str, source: SendSource) -> Self {
        Self {
            agent: Some(agent.to_string()),
            number: Some(to.to_string()),
            text: Some(text.to_string()),
            source: Some(source),
            ok: Some(true),
            ..Self::now(Direction::Out)
        }
    }

    pub fn send_failed(
        agent: &str,
        to: Option<&str>,
        text: Option<&str>,
        source: SendSource,
        error: impl Into<String>,
    ) -> Self {
        Self {
            agent: Some(agent.to_string()),
            number: to.map(str::to_string),
            text: text.map(str::to_string),
            source: Some(source),
            ok: Some(false),
            error: Some(error.into()),
            ..Self::now(Direction::Out)
        }
    }

    pub fn with_template(mut self, template: Option<String>) -> Self {
        self.template = template;
        self
    }

    pub fn with_timestamp(mut self, ts: i64) -> Self {
        self.set_timestamp(ts);
        self
    }

    fn set_timestamp(&mut self, ts: i64) {
        self.ts = ts;
        self.iso = Utc
            .timestamp_millis_opt(ts)
            .single()
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();
    }

    pub fn is_failed_send(&self) -> bool {
        self.direction == Direction::Out && self.ok != Some(true)
    }
}

/// Pulses on the log-update channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPulse {
    /// Sent once on subscribe.
    Init { last_ts: i64 },
    /// A record was appended.
    New { ts: i64 },
}

impl LogPulse {
    pub fn name(&self) -> &'static str {
        match self {
            LogPulse::Init { .. } => "init",
            LogPulse::New { .. } => "new",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            LogPulse::Init { last_ts } => serde_json::json!({ "lastTs": last_ts }),
            LogPulse::New { ts } => serde_json::json!({ "ts": ts }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub total: usize,
    pub sent: usize,
    pub received: usize,
    pub failed: usize,
    pub unique_numbers: usize,
    pub last_ts: Option<i64>,
}

impl LogStats {
    pub fn from_records(records: &[EventRecord]) -> Self {
        let unique: HashSet<&str> = records
            .iter()
            .filter_map(|r| r.number.as_deref())
            .filter(|n| !n.is_empty())
            .collect();
        Self {
            total: records.len(),
            sent: records.iter().filter(|r| r.direction == Direction::Out).count(),
            received: records.iter().filter(|r| r.direction == Direction::In).count(),
            failed: records.iter().filter(|r| r.is_failed_send()).count(),
            unique_numbers: unique.len(),
            last_ts: records.last().map(|r| r.ts),
        }
    }
}

pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
    last_ts: AtomicI64,
    updates: Notifier<LogPulse>,
}

impl EventLog {
    /// Open (or lazily create) the log at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let log = Self {
            path,
            write_lock: Mutex::new(()),
            last_ts: AtomicI64::new(0),
            updates: Notifier::new(),
        };
        if let Some(last) = log.tail(1, 0).await.last() {
            log.last_ts.store(last.ts, Ordering::Relaxed);
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_ts(&self) -> i64 {
        self.last_ts.load(Ordering::Relaxed)
    }

    /// Subscribe to append notifications.
    pub fn subscribe(&self) -> Subscription<LogPulse> {
        self.updates.subscribe(LogPulse::Init {
            last_ts: self.last_ts(),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.updates.subscriber_count()
    }

    pub async fn append(&self, record: &EventRecord) {
        let mut line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Could not serialize event record: {}", e);
                return;
            }
        };
        line.push('\n');

        let result = {
            let _guard = self.write_lock.lock().await;
            self.write_line(line.as_bytes()).await
        };

        match result {
            Ok(()) => {
                debug!("Logged {:?} event for {:?}", record.direction, record.number);
                self.last_ts.fetch_max(record.ts, Ordering::Relaxed);
                self.updates.broadcast(LogPulse::New { ts: record.ts });
            }
            Err(e) => warn!("Could not write event log {}: {}", self.path.display(), e),
        }
    }

    async fn write_line(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await
    }

    /// The newest `limit` records with `ts >= since`, in file order.
    ///
    /// Lines that are not valid JSON (or not valid UTF-8) are skipped.
    /// Concurrent sessions may write lines slightly out of timestamp order,
    /// so older records are filtered out rather than ending the scan.
    /// `since == 0` disables the age filter.
    pub async fn tail(&self, limit: usize, since: i64) -> Vec<EventRecord> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Could not read event log {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        let lines = content
            .split(|b| *b == b'\n')
            .rev()
            .filter(|l| !l.iter().all(u8::is_ascii_whitespace));
        for line in lines {
            if out.len() >= limit {
                break;
            }
            let Ok(record) = serde_json::from_slice::<EventRecord>(line) else {
                continue;
            };
            if since > 0 && record.ts < since {
                continue;
            }
            out.push(record);
        }
        out.reverse();
        out
    }

    pub async fn stats(&self, window: usize) -> LogStats {
        LogStats::from_records(&self.tail(window, 0).await)
    }

    /// Remove every record. Clearing an already empty log is not an error.
    pub async fn clear(&self) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}
