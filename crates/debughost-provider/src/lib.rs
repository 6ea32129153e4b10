//! Container engine trait and implementations for debug-host
//!
//! This crate provides an abstraction over the container engine (Docker via
//! its socket) with the capability surface the supervisor core consumes.

mod docker;
mod error;
mod types;

pub use docker::DockerEngine;
pub use error::*;
pub use types::*;

use async_trait::async_trait;

/// Trait for container engines
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container from an image
    async fn create(&self, config: &CreateContainerConfig) -> Result<ContainerId>;

    /// Start a container
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Stop a container, waiting up to `grace_secs` before the engine kills it
    async fn stop(&self, id: &ContainerId, grace_secs: Option<u32>) -> Result<()>;

    /// Remove a container
    async fn remove(&self, id: &ContainerId, force: bool) -> Result<()>;

    /// Get detailed information about a container
    async fn inspect(&self, id: &ContainerId) -> Result<ContainerDetails>;

    /// Attach to a container's log stream.
    ///
    /// The returned byte stream carries the engine's multiplexed framing:
    /// an 8-byte header (stream id, 3 reserved bytes, big-endian u32 payload
    /// length) before each payload.
    async fn attach_logs(&self, id: &ContainerId, config: &LogAttachConfig) -> Result<LogStream>;

    /// Create the bridge network if absent; verify its subnet if present
    async fn ensure_network(&self, spec: &NetworkSpec) -> Result<()>;

    /// Whether an image is available locally
    async fn image_present(&self, image: &str) -> Result<bool>;

    /// Check if the engine is available/connected
    async fn ping(&self) -> Result<()>;

    /// Get engine information
    fn info(&self) -> EngineInfo;
}

/// Connect to the engine configured in the global config
pub async fn connect_engine(
    config: &debughost_config::GlobalConfig,
) -> Result<Box<dyn ContainerEngine>> {
    let engine = DockerEngine::new(&config.engine.socket).await?;
    Ok(Box::new(engine))
}
