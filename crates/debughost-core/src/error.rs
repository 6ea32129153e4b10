//! Error types for debughost-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] debughost_config::ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] debughost_provider::EngineError),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Invalid workspace: {0}")]
    InvalidWorkspace(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Workspace already registered: {0}")]
    DuplicateWorkspace(String),

    #[error("Port {port} conflict: {detail}")]
    PortConflict { port: u16, detail: String },

    #[error("No port available in the {tech} range")]
    NoPortAvailable { tech: String },

    #[error("Operation {operation} already in progress for project {project_id}")]
    OperationInProgress {
        project_id: String,
        operation: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Image not available: {0}")]
    ImageUnavailable(String),

    #[error("Startup timed out after {timeout_secs}s")]
    StartupTimeout { timeout_secs: u64 },

    #[error("Stop timed out after {grace_secs}s")]
    StopTimeout { grace_secs: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store corrupted: {0}")]
    StoreCorrupted(String),

    #[error("{operation} failed for project {project_id}: {source}")]
    Operation {
        project_id: String,
        operation: String,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    /// Attach the project and operation an error surfaced from
    pub fn in_operation(self, operation: &str, project_id: &str) -> Self {
        match self {
            // Already annotated, keep the innermost context
            CoreError::Operation { .. } => self,
            other => CoreError::Operation {
                project_id: project_id.to_string(),
                operation: operation.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Stable machine-readable code for the front door
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Engine(debughost_provider::EngineError::NetworkConflict(_)) => {
                "NETWORK_CONFLICT"
            }
            CoreError::Engine(_) => "ENGINE_ERROR",
            CoreError::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            CoreError::InvalidWorkspace(_) => "INVALID_WORKSPACE",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::DuplicateWorkspace(_) => "DUPLICATE_WORKSPACE",
            CoreError::PortConflict { .. } => "PORT_CONFLICT",
            CoreError::NoPortAvailable { .. } => "NO_PORT_AVAILABLE",
            CoreError::OperationInProgress { .. } => "OPERATION_IN_PROGRESS",
            CoreError::InvalidState(_) => "INVALID_STATE",
            CoreError::ImageUnavailable(_) => "IMAGE_UNAVAILABLE",
            CoreError::StartupTimeout { .. } => "STARTUP_TIMEOUT",
            CoreError::StopTimeout { .. } => "STOP_TIMEOUT",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::Json(_) => "DECODE_ERROR",
            CoreError::StoreCorrupted(_) => "STORE_CORRUPTED",
            CoreError::Operation { source, .. } => source.code(),
        }
    }

    /// Actionable hints the front door may show alongside the message
    pub fn guidance(&self) -> &'static [&'static str] {
        match self {
            CoreError::PortConflict { .. } => {
                &["port already held; retry without a preferred port to use the tech default"]
            }
            CoreError::NoPortAvailable { .. } => {
                &["stop or remove idle projects to release ports in this range"]
            }
            CoreError::OperationInProgress { .. } => {
                &["wait for the in-flight operation to finish and retry"]
            }
            CoreError::DuplicateWorkspace(_) => {
                &["the workspace is already registered; remove the existing project first"]
            }
            CoreError::ImageUnavailable(_) => &["pull or build the stack image and retry"],
            CoreError::Operation { source, .. } => source.guidance(),
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
