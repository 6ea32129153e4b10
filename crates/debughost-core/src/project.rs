//! Project records
//!
//! A project is a registered workspace with a detected tech stack, assigned
//! ports, and (while running) a container handle. Records persist to
//! `projects.json`.

use crate::TechDetection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Supervisor-level project status (distinct from the engine's container
/// status, which `status()` reconciles against)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Error,
}

impl ProjectStatus {
    /// Terminal states a project rests in between operations
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// States in which a container handle must be recorded
    pub fn has_container(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Stopping | Self::Restarting
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Restarting => write!(f, "restarting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Latest health verdict recorded for a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Ports assigned to a project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortAssignment {
    /// The published dev-server port. Set on first start, kept across
    /// restarts while the allocation holds.
    pub primary: Option<u16>,
    /// Any additional ports allocated for the project
    #[serde(default)]
    pub allocated: Vec<u16>,
}

/// A registered project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Stable opaque identifier, generated at registration
    pub project_id: String,
    pub name: String,
    pub workspace_path: PathBuf,
    /// Ranked detections from the workspace scan
    pub detected_tech: Vec<TechDetection>,
    pub primary_tech: String,
    #[serde(default)]
    pub ports: PortAssignment,
    pub status: ProjectStatus,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_operation_time: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub health_status: HealthState,
}

impl Project {
    pub fn new(
        name: String,
        workspace_path: PathBuf,
        detected_tech: Vec<TechDetection>,
        primary_tech: String,
    ) -> Self {
        Self {
            project_id: uuid::Uuid::new_v4().to_string(),
            name,
            workspace_path,
            detected_tech,
            primary_tech,
            ports: PortAssignment::default(),
            status: ProjectStatus::Stopped,
            container_id: None,
            container_name: None,
            registered_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_operation_time: None,
            last_health_check: None,
            last_error: None,
            health_status: HealthState::Unknown,
        }
    }

    /// Whether a start operation may begin from the current status
    pub fn can_start(&self) -> bool {
        self.status.is_terminal()
    }

    /// URL of the dev server while a primary port is assigned
    pub fn access_url(&self) -> Option<String> {
        self.ports
            .primary
            .map(|port| format!("http://localhost:{}", port))
    }

    /// Milliseconds since the container started, for a running project
    pub fn uptime_ms(&self) -> Option<i64> {
        if self.status != ProjectStatus::Running {
            return None;
        }
        self.started_at
            .map(|t| (Utc::now() - t).num_milliseconds().max(0))
    }

    /// Short display ID
    pub fn short_id(&self) -> &str {
        if self.project_id.len() > 8 {
            &self.project_id[..8]
        } else {
            &self.project_id
        }
    }
}

/// Persisted document shape of `projects.json`. Ordered map so an
/// unchanged document rewrites byte-identically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectsDoc {
    pub projects: BTreeMap<String, Project>,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn make_project(name: &str, status: ProjectStatus) -> Project {
        let mut p = Project::new(
            name.to_string(),
            PathBuf::from(format!("/ws/{}", name)),
            Vec::new(),
            "nodejs".to_string(),
        );
        p.status = status;
        p
    }

    #[test]
    fn test_new_project_defaults() {
        let p = Project::new(
            "web".to_string(),
            PathBuf::from("/ws/web"),
            Vec::new(),
            "react".to_string(),
        );
        assert_eq!(p.status, ProjectStatus::Stopped);
        assert!(p.ports.primary.is_none());
        assert!(p.container_id.is_none());
        assert_eq!(p.health_status, HealthState::Unknown);
        assert!(p.can_start());
    }

    #[test]
    fn test_status_predicates() {
        assert!(ProjectStatus::Stopped.is_terminal());
        assert!(ProjectStatus::Error.is_terminal());
        assert!(!ProjectStatus::Running.is_terminal());

        assert!(ProjectStatus::Starting.has_container());
        assert!(ProjectStatus::Running.has_container());
        assert!(ProjectStatus::Stopping.has_container());
        assert!(ProjectStatus::Restarting.has_container());
        assert!(!ProjectStatus::Stopped.has_container());
        assert!(!ProjectStatus::Error.has_container());
    }

    #[test]
    fn test_access_url() {
        let mut p = make_project("web", ProjectStatus::Running);
        assert!(p.access_url().is_none());
        p.ports.primary = Some(3000);
        assert_eq!(p.access_url().as_deref(), Some("http://localhost:3000"));
    }

    #[test]
    fn test_uptime_only_while_running() {
        let mut p = make_project("web", ProjectStatus::Running);
        p.started_at = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(p.uptime_ms().unwrap() >= 4_000);

        p.status = ProjectStatus::Stopped;
        assert!(p.uptime_ms().is_none());
    }

    #[test]
    fn test_serde_round_trip_keeps_status_spelling() {
        let p = make_project("web", ProjectStatus::Restarting);
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"restarting\""));
        let back: Project = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, ProjectStatus::Restarting);
    }
}
