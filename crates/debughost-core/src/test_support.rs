//! Test support utilities for debughost-core
//!
//! Provides a configurable MockEngine for unit testing the ProjectManager
//! without a real container engine.

use async_trait::async_trait;
use debughost_provider::*;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncRead;

/// Records which methods were called on the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Create {
        image: String,
        name: Option<String>,
    },
    Start {
        id: String,
    },
    Stop {
        id: String,
        grace: Option<u32>,
    },
    Remove {
        id: String,
        force: bool,
    },
    Inspect {
        id: String,
    },
    AttachLogs {
        id: String,
    },
    EnsureNetwork {
        name: String,
    },
    ImagePresent {
        image: String,
    },
    Ping,
}

impl MockCall {
    /// Variant name, for order assertions
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "Create",
            Self::Start { .. } => "Start",
            Self::Stop { .. } => "Stop",
            Self::Remove { .. } => "Remove",
            Self::Inspect { .. } => "Inspect",
            Self::AttachLogs { .. } => "AttachLogs",
            Self::EnsureNetwork { .. } => "EnsureNetwork",
            Self::ImagePresent { .. } => "ImagePresent",
            Self::Ping => "Ping",
        }
    }
}

/// Configurable mock container engine
pub struct MockEngine {
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    /// Result for create calls
    pub create_result: Arc<Mutex<Result<ContainerId>>>,
    /// Sleep inserted before create returns, to widen operation windows
    pub create_delay_ms: Arc<Mutex<u64>>,
    /// Result for start calls
    pub start_result: Arc<Mutex<Result<()>>>,
    /// Result for stop calls
    pub stop_result: Arc<Mutex<Result<()>>>,
    /// Result for remove calls
    pub remove_result: Arc<Mutex<Result<()>>>,
    /// Result for inspect calls
    pub inspect_result: Arc<Mutex<Result<ContainerDetails>>>,
    /// Per-call inspect response queue. Popped before falling back to
    /// inspect_result.
    pub inspect_responses: Arc<Mutex<Vec<Result<ContainerDetails>>>>,
    /// Result for image_present calls
    pub image_present_result: Arc<Mutex<Result<bool>>>,
    /// Result for ensure_network calls
    pub ensure_network_result: Arc<Mutex<Result<()>>>,
    /// Bytes served by attach_logs, already framed. The stream stays open
    /// after the bytes drain, like a followed container stream.
    pub log_bytes: Arc<Mutex<Vec<u8>>>,
}

impl MockEngine {
    /// Create a mock with default success results and a running container
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            create_result: Arc::new(Mutex::new(Ok(ContainerId::new("mock_container_id")))),
            create_delay_ms: Arc::new(Mutex::new(0)),
            start_result: Arc::new(Mutex::new(Ok(()))),
            stop_result: Arc::new(Mutex::new(Ok(()))),
            remove_result: Arc::new(Mutex::new(Ok(()))),
            inspect_result: Arc::new(Mutex::new(Ok(mock_details(
                "mock_container_id",
                ContainerStatus::Running,
            )))),
            inspect_responses: Arc::new(Mutex::new(Vec::new())),
            image_present_result: Arc::new(Mutex::new(Ok(true))),
            ensure_network_result: Arc::new(Mutex::new(Ok(()))),
            log_bytes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Count calls matching a predicate
    pub fn call_count<F: Fn(&MockCall) -> bool>(&self, filter: F) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| filter(c)).count()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper to clone a Result<T> out of a shared slot
fn clone_result<T: Clone>(slot: &Arc<Mutex<Result<T>>>) -> Result<T> {
    let guard = slot.lock().unwrap();
    match &*guard {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(clone_engine_error(e)),
    }
}

/// Clone an EngineError (thiserror types don't implement Clone)
pub fn clone_engine_error(e: &EngineError) -> EngineError {
    match e {
        EngineError::ConnectionError(s) => EngineError::ConnectionError(s.clone()),
        EngineError::NotFound(s) => EngineError::NotFound(s.clone()),
        EngineError::NetworkConflict(s) => EngineError::NetworkConflict(s.clone()),
        EngineError::NameConflict(s) => EngineError::NameConflict(s.clone()),
        EngineError::RuntimeError(s) => EngineError::RuntimeError(s.clone()),
        EngineError::IoError(_) => EngineError::RuntimeError("IO error (cloned)".into()),
        EngineError::Timeout => EngineError::Timeout,
        EngineError::Cancelled => EngineError::Cancelled,
    }
}

/// Create mock ContainerDetails
pub fn mock_details(id: &str, status: ContainerStatus) -> ContainerDetails {
    ContainerDetails {
        id: ContainerId::new(id),
        name: "mock_container".to_string(),
        image: "debughost/node:latest".to_string(),
        status,
        started_at: Some(0),
        finished_at: None,
        exit_code: None,
    }
}

/// Reader that serves scripted bytes then stays open, like a follow stream
struct ScriptedReader {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if self.pos < self.data.len() {
            let remaining = &self.data[self.pos..];
            let to_copy = std::cmp::min(remaining.len(), buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return std::task::Poll::Ready(Ok(()));
        }
        // Never signals EOF; the follow stream outlives the test
        std::task::Poll::Pending
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn create(&self, config: &CreateContainerConfig) -> Result<ContainerId> {
        self.record(MockCall::Create {
            image: config.image.clone(),
            name: config.name.clone(),
        });
        let delay = *self.create_delay_ms.lock().unwrap();
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        clone_result(&self.create_result)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.record(MockCall::Start { id: id.0.clone() });
        clone_result(&self.start_result)
    }

    async fn stop(&self, id: &ContainerId, grace_secs: Option<u32>) -> Result<()> {
        self.record(MockCall::Stop {
            id: id.0.clone(),
            grace: grace_secs,
        });
        clone_result(&self.stop_result)
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<()> {
        self.record(MockCall::Remove {
            id: id.0.clone(),
            force,
        });
        clone_result(&self.remove_result)
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerDetails> {
        self.record(MockCall::Inspect { id: id.0.clone() });
        // Pop from queue if available, otherwise fall back to the slot
        let mut queue = self.inspect_responses.lock().unwrap();
        if !queue.is_empty() {
            return match queue.remove(0) {
                Ok(v) => Ok(v),
                Err(e) => Err(clone_engine_error(&e)),
            };
        }
        drop(queue);
        clone_result(&self.inspect_result)
    }

    async fn attach_logs(&self, id: &ContainerId, _config: &LogAttachConfig) -> Result<LogStream> {
        self.record(MockCall::AttachLogs { id: id.0.clone() });
        let data = self.log_bytes.lock().unwrap().clone();
        Ok(LogStream {
            stream: Box::pin(ScriptedReader { data, pos: 0 }),
        })
    }

    async fn ensure_network(&self, spec: &NetworkSpec) -> Result<()> {
        self.record(MockCall::EnsureNetwork {
            name: spec.name.clone(),
        });
        clone_result(&self.ensure_network_result)
    }

    async fn image_present(&self, image: &str) -> Result<bool> {
        self.record(MockCall::ImagePresent {
            image: image.to_string(),
        });
        clone_result(&self.image_present_result)
    }

    async fn ping(&self) -> Result<()> {
        self.record(MockCall::Ping);
        Ok(())
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            version: "mock-1.0".to_string(),
            api_version: "mock".to_string(),
            os: "test".to_string(),
            arch: "test".to_string(),
        }
    }
}
