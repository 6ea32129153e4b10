//! Log collection and streaming
//!
//! The collector attaches to a container's multiplexed log stream, splits it
//! into stdout/stderr entries, classifies severity, keeps a bounded
//! per-container ring buffer, and fans entries out to subscribers over a
//! broadcast channel. A subscriber that falls behind loses its oldest queued
//! entries (counted per subscription); the producer never blocks and the
//! ring buffer fills regardless of subscriber state.

mod frame;

pub use frame::{DecodedFrame, FrameDecoder, StreamKind};

use crate::{CoreError, Result};
use debughost_provider::LogStream;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Heuristic severity of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

/// Classify a message by substring, highest severity first
pub fn classify_level(message: &str) -> LogLevel {
    let lower = message.to_lowercase();
    if lower.contains("error") || lower.contains("fatal") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("debug") || lower.contains("trace") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// One collected log line
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub container_name: String,
    /// Milliseconds since epoch; the engine's timestamp when present,
    /// local wall clock otherwise
    pub timestamp_ms: i64,
    pub stream: StreamKind,
    pub level: LogLevel,
    pub message: String,
    pub raw: String,
}

/// Composable filter over buffered entries
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub stream: Option<StreamKind>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    /// Case-insensitive regex matched against the message
    pub search: Option<String>,
    /// Return only the most recent N matches
    pub limit: Option<usize>,
}

struct ContainerLogs {
    buffer: Mutex<VecDeque<LogEntry>>,
    /// Present while collecting; dropped on stop so subscriptions end
    sender: Mutex<Option<broadcast::Sender<LogEntry>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerLogs {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            sender: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn push(&self, entry: LogEntry, capacity: usize) {
        {
            let mut buffer = self.buffer.lock().expect("log buffer lock poisoned");
            buffer.push_back(entry.clone());
            while buffer.len() > capacity {
                buffer.pop_front();
            }
        }
        if let Some(sender) = self.sender.lock().expect("log sender lock poisoned").as_ref() {
            // No receivers is fine; the buffer is the source of truth
            let _ = sender.send(entry);
        }
    }
}

/// Collects and streams logs for all supervised containers
pub struct LogCollector {
    containers: Mutex<HashMap<String, Arc<ContainerLogs>>>,
    buffer_capacity: usize,
    subscriber_capacity: usize,
}

impl LogCollector {
    pub fn new(buffer_capacity: usize, subscriber_capacity: usize) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            buffer_capacity,
            subscriber_capacity,
        }
    }

    /// Attach to a container's log stream. Idempotent: a container already
    /// being collected keeps its existing reader.
    pub fn attach(&self, container_name: &str, stream: LogStream) {
        let entry = self.entry(container_name);

        let mut task = entry.task.lock().expect("log task lock poisoned");
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            tracing::debug!(container = container_name, "already collecting");
            return;
        }

        let (tx, _) = broadcast::channel(self.subscriber_capacity);
        *entry.sender.lock().expect("log sender lock poisoned") = Some(tx);

        let reader_entry = Arc::clone(&entry);
        let name = container_name.to_string();
        let capacity = self.buffer_capacity;
        *task = Some(tokio::spawn(async move {
            read_stream(stream, reader_entry, name, capacity).await;
        }));
    }

    /// Stop collecting for a container. The ring buffer stays queryable;
    /// live subscriptions observe end-of-stream.
    pub fn stop(&self, container_name: &str) {
        let Some(entry) = self.lookup(container_name) else {
            return;
        };
        if let Some(task) = entry.task.lock().expect("log task lock poisoned").take() {
            task.abort();
        }
        entry
            .sender
            .lock()
            .expect("log sender lock poisoned")
            .take();
        tracing::debug!(container = container_name, "log collection stopped");
    }

    /// Copy out buffered entries matching a filter
    pub fn buffered(&self, container_name: &str, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let search = filter
            .search
            .as_deref()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| CoreError::Validation(format!("invalid search regex: {}", e)))
            })
            .transpose()?;

        let Some(entry) = self.lookup(container_name) else {
            return Ok(Vec::new());
        };

        let buffer = entry.buffer.lock().expect("log buffer lock poisoned");
        let mut matches: Vec<LogEntry> = buffer
            .iter()
            .filter(|e| filter.level.map_or(true, |l| e.level == l))
            .filter(|e| filter.stream.map_or(true, |s| e.stream == s))
            .filter(|e| filter.since_ms.map_or(true, |t| e.timestamp_ms >= t))
            .filter(|e| filter.until_ms.map_or(true, |t| e.timestamp_ms <= t))
            .filter(|e| search.as_ref().map_or(true, |re| re.is_match(&e.message)))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            if matches.len() > limit {
                matches.drain(..matches.len() - limit);
            }
        }
        Ok(matches)
    }

    /// Subscribe to new entries for a container being collected
    pub fn subscribe(&self, container_name: &str) -> Result<LogSubscription> {
        let entry = self
            .lookup(container_name)
            .ok_or_else(|| CoreError::InvalidState(format!("not collecting {}", container_name)))?;
        let sender = entry.sender.lock().expect("log sender lock poisoned");
        let sender = sender
            .as_ref()
            .ok_or_else(|| CoreError::InvalidState(format!("not collecting {}", container_name)))?;
        Ok(LogSubscription {
            rx: sender.subscribe(),
            dropped: 0,
        })
    }

    /// Empty a container's ring buffer
    pub fn clear(&self, container_name: &str) {
        if let Some(entry) = self.lookup(container_name) {
            entry
                .buffer
                .lock()
                .expect("log buffer lock poisoned")
                .clear();
        }
    }

    /// Drop all state for a container (used when its project is removed)
    pub fn remove(&self, container_name: &str) {
        self.stop(container_name);
        self.containers
            .lock()
            .expect("log containers lock poisoned")
            .remove(container_name);
    }

    /// Whether a reader task is currently attached
    pub fn is_collecting(&self, container_name: &str) -> bool {
        self.lookup(container_name)
            .map(|e| {
                e.task
                    .lock()
                    .expect("log task lock poisoned")
                    .as_ref()
                    .map(|t| !t.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn entry(&self, container_name: &str) -> Arc<ContainerLogs> {
        let mut containers = self
            .containers
            .lock()
            .expect("log containers lock poisoned");
        Arc::clone(
            containers
                .entry(container_name.to_string())
                .or_insert_with(|| Arc::new(ContainerLogs::new())),
        )
    }

    fn lookup(&self, container_name: &str) -> Option<Arc<ContainerLogs>> {
        self.containers
            .lock()
            .expect("log containers lock poisoned")
            .get(container_name)
            .cloned()
    }
}

/// Live feed of one container's entries with per-subscription drop
/// accounting. The producer never blocks on this queue; overflow evicts the
/// subscription's oldest entries and bumps the counter.
pub struct LogSubscription {
    rx: broadcast::Receiver<LogEntry>,
    dropped: u64,
}

impl LogSubscription {
    /// Next entry, or `None` once collection stops
    pub async fn next(&mut self) -> Option<LogEntry> {
        loop {
            match self.rx.recv().await {
                Ok(entry) => return Some(entry),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Entries this subscription lost to queue overflow
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

async fn read_stream(
    stream: LogStream,
    entry: Arc<ContainerLogs>,
    container_name: String,
    capacity: usize,
) {
    let mut reader = stream.stream;
    let mut decoder = FrameDecoder::new();
    let mut partial: HashMap<StreamKind, Vec<u8>> = HashMap::new();
    let mut chunk = [0u8; 4096];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for frame in decoder.push(&chunk[..n]) {
                    let pending = partial.entry(frame.stream).or_default();
                    pending.extend_from_slice(&frame.payload);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        emit_line(&entry, &container_name, frame.stream, &line, capacity);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(container = %container_name, "log stream read failed: {}", e);
                break;
            }
        }
    }

    // Force out a frame truncated by the stream ending, then flush
    // unterminated line tails
    if let Some(frame) = decoder.finish() {
        partial
            .entry(frame.stream)
            .or_default()
            .extend_from_slice(&frame.payload);
    }
    for (stream, pending) in partial {
        if !pending.is_empty() {
            emit_line(&entry, &container_name, stream, &pending, capacity);
        }
    }
    entry
        .sender
        .lock()
        .expect("log sender lock poisoned")
        .take();
    tracing::debug!(container = %container_name, "log stream ended");
}

fn emit_line(
    entry: &ContainerLogs,
    container_name: &str,
    stream: StreamKind,
    line: &[u8],
    capacity: usize,
) {
    let raw = String::from_utf8_lossy(line)
        .trim_end_matches(['\n', '\r'])
        .to_string();
    let (timestamp_ms, message) = split_timestamp(&raw);

    entry.push(
        LogEntry {
            container_name: container_name.to_string(),
            timestamp_ms,
            stream,
            level: classify_level(message),
            message: message.to_string(),
            raw: raw.clone(),
        },
        capacity,
    );
}

/// If the line opens with an RFC-3339 timestamp followed by a space, use it
/// and strip it from the message; otherwise stamp with the wall clock.
fn split_timestamp(raw: &str) -> (i64, &str) {
    if let Some(space) = raw.find(' ') {
        let token = &raw[..space];
        if token.len() >= 20 {
            if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(token) {
                return (ts.timestamp_millis(), raw[space + 1..].trim_start());
            }
        }
    }
    (chrono::Utc::now().timestamp_millis(), raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry_named(collector: &LogCollector, name: &str) -> Arc<ContainerLogs> {
        collector.entry(name)
    }

    fn push_line(collector: &LogCollector, name: &str, stream: StreamKind, line: &str) {
        let entry = entry_named(collector, name);
        emit_line(
            &entry,
            name,
            stream,
            line.as_bytes(),
            collector.buffer_capacity,
        );
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn framed(stream_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![stream_id, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_classify_level() {
        assert_eq!(classify_level("Unhandled ERROR in handler"), LogLevel::Error);
        assert_eq!(classify_level("fatal: out of memory"), LogLevel::Error);
        assert_eq!(classify_level("Warning: deprecated API"), LogLevel::Warn);
        assert_eq!(classify_level("debug: cache miss"), LogLevel::Debug);
        assert_eq!(classify_level("trace span opened"), LogLevel::Debug);
        assert_eq!(classify_level("listening on :3000"), LogLevel::Info);
        // error outranks warn when both appear
        assert_eq!(classify_level("warning: error ahead"), LogLevel::Error);
    }

    #[test]
    fn test_split_timestamp() {
        let (ts, msg) = split_timestamp("2024-01-15T10:30:00.123456Z Server started");
        assert_eq!(msg, "Server started");
        let expected = chrono::DateTime::parse_from_rfc3339("2024-01-15T10:30:00.123456Z")
            .unwrap()
            .timestamp_millis();
        assert_eq!(ts, expected);

        let before = chrono::Utc::now().timestamp_millis();
        let (ts, msg) = split_timestamp("no timestamp here");
        assert_eq!(msg, "no timestamp here");
        assert!(ts >= before);
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let collector = LogCollector::new(5, 8);
        for i in 0..7 {
            push_line(&collector, "c1", StreamKind::Stdout, &format!("line {}", i));
        }

        let entries = collector.buffered("c1", &LogFilter::default()).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].message, "line 2");
        assert_eq!(entries[4].message, "line 6");

        // limit == capacity still returns the newest entries
        let limited = collector
            .buffered(
                "c1",
                &LogFilter {
                    limit: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(limited.len(), 5);
    }

    #[tokio::test]
    async fn test_filters_compose() {
        let collector = LogCollector::new(100, 8);
        push_line(&collector, "c1", StreamKind::Stdout, "info: ready");
        push_line(&collector, "c1", StreamKind::Stderr, "ERROR: boom");
        push_line(&collector, "c1", StreamKind::Stderr, "warn: slow request");
        push_line(&collector, "c1", StreamKind::Stdout, "GET /health 200");

        let errors = collector
            .buffered(
                "c1",
                &LogFilter {
                    level: Some(LogLevel::Error),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "ERROR: boom");

        let stderr = collector
            .buffered(
                "c1",
                &LogFilter {
                    stream: Some(StreamKind::Stderr),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(stderr.len(), 2);

        let searched = collector
            .buffered(
                "c1",
                &LogFilter {
                    search: Some("get /HEALTH".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(searched.len(), 1);

        let limited = collector
            .buffered(
                "c1",
                &LogFilter {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].message, "GET /health 200");
    }

    #[tokio::test]
    async fn test_invalid_search_regex_is_validation_error() {
        let collector = LogCollector::new(10, 8);
        push_line(&collector, "c1", StreamKind::Stdout, "x");
        let err = collector
            .buffered(
                "c1",
                &LogFilter {
                    search: Some("([".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_attach_demuxes_streams() {
        let collector = LogCollector::new(100, 8);
        let (mut writer, reader) = tokio::io::duplex(256);
        collector.attach(
            "c1",
            LogStream {
                stream: Box::pin(reader),
            },
        );

        let mut bytes = framed(1, b"hello");
        bytes.extend_from_slice(&framed(2, b"world\n"));
        tokio::io::AsyncWriteExt::write_all(&mut writer, &bytes)
            .await
            .unwrap();
        drop(writer);

        wait_for(|| {
            collector
                .buffered("c1", &LogFilter::default())
                .unwrap()
                .len()
                == 2
        })
        .await;

        let entries = collector.buffered("c1", &LogFilter::default()).unwrap();
        // stderr line completes first; the unterminated stdout payload
        // flushes at end of stream
        let stdout: Vec<_> = entries
            .iter()
            .filter(|e| e.stream == StreamKind::Stdout)
            .collect();
        let stderr: Vec<_> = entries
            .iter()
            .filter(|e| e.stream == StreamKind::Stderr)
            .collect();
        assert_eq!(stdout.len(), 1);
        assert_eq!(stdout[0].message, "hello");
        assert_eq!(stderr.len(), 1);
        assert_eq!(stderr[0].message, "world");
    }

    #[tokio::test]
    async fn test_stream_ending_mid_frame_keeps_partial_payload() {
        let collector = LogCollector::new(100, 8);
        let (mut writer, reader) = tokio::io::duplex(256);
        collector.attach(
            "c1",
            LogStream {
                stream: Box::pin(reader),
            },
        );

        // Frame promises 32 bytes of stderr but the container dies after 12
        let mut bytes = vec![2, 0, 0, 0, 0, 0, 0, 32];
        bytes.extend_from_slice(b"partial line");
        tokio::io::AsyncWriteExt::write_all(&mut writer, &bytes)
            .await
            .unwrap();
        drop(writer);

        wait_for(|| {
            !collector
                .buffered("c1", &LogFilter::default())
                .unwrap()
                .is_empty()
        })
        .await;

        let entries = collector.buffered("c1", &LogFilter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stream, StreamKind::Stderr);
        assert_eq!(entries[0].message, "partial line");
    }

    #[tokio::test]
    async fn test_subscription_receives_and_ends() {
        let collector = LogCollector::new(100, 8);
        let (mut writer, reader) = tokio::io::duplex(256);
        collector.attach(
            "c1",
            LogStream {
                stream: Box::pin(reader),
            },
        );

        let mut sub = collector.subscribe("c1").unwrap();

        tokio::io::AsyncWriteExt::write_all(&mut writer, &framed(1, b"one\n"))
            .await
            .unwrap();
        let entry = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.message, "one");

        // End of stream closes the subscription
        drop(writer);
        let end = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_not_producer() {
        let collector = LogCollector::new(100, 4);
        let (_writer, reader) = tokio::io::duplex(64);
        collector.attach(
            "c1",
            LogStream {
                stream: Box::pin(reader),
            },
        );
        let mut sub = collector.subscribe("c1").unwrap();

        // Subscriber not reading while 10 entries arrive
        for i in 0..10 {
            push_line(&collector, "c1", StreamKind::Stdout, &format!("m{}", i));
        }

        // Buffer kept everything
        assert_eq!(
            collector.buffered("c1", &LogFilter::default()).unwrap().len(),
            10
        );

        // Subscription lost the oldest and counted them
        let first = sub.next().await.unwrap();
        assert!(sub.dropped() > 0);
        assert_ne!(first.message, "m0");

        // A fresh subscriber is unaffected going forward
        let mut fresh = collector.subscribe("c1").unwrap();
        push_line(&collector, "c1", StreamKind::Stdout, "after");
        let entry = tokio::time::timeout(Duration::from_secs(2), fresh.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.message, "after");
        assert_eq!(fresh.dropped(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_requires_collection() {
        let collector = LogCollector::new(10, 8);
        assert!(collector.subscribe("ghost").is_err());
    }

    #[tokio::test]
    async fn test_stop_ends_subscription_keeps_buffer() {
        let collector = LogCollector::new(10, 8);
        let (_writer, reader) = tokio::io::duplex(64);
        collector.attach(
            "c1",
            LogStream {
                stream: Box::pin(reader),
            },
        );
        push_line(&collector, "c1", StreamKind::Stdout, "kept");
        let mut sub = collector.subscribe("c1").unwrap();

        collector.stop("c1");
        assert!(!collector.is_collecting("c1"));

        let end = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap();
        assert!(end.is_none());

        // History survives the stop
        assert_eq!(
            collector.buffered("c1", &LogFilter::default()).unwrap().len(),
            1
        );

        collector.clear("c1");
        assert!(collector
            .buffered("c1", &LogFilter::default())
            .unwrap()
            .is_empty());
    }
}
