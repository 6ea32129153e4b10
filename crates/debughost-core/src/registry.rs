//! Project registry
//!
//! Authoritative holder of project records. Mutations persist through the
//! atomic store under the registry's write lock; reads clone out of a
//! snapshot and never block writers for long.

use crate::{store, CoreError, Project, ProjectStatus, ProjectsDoc, Result, ScanResult};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Fields a merge-patch may never touch
const IMMUTABLE_FIELDS: &[&str] = &["project_id", "workspace_path", "registered_at"];

/// Optional filters for [`ProjectRegistry::list`]
#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
    pub tech: Option<String>,
}

/// Registry of all registered projects
pub struct ProjectRegistry {
    inner: RwLock<ProjectsDoc>,
    path: PathBuf,
}

impl ProjectRegistry {
    /// Open the registry backed by `path`, loading any persisted document
    pub fn open(path: PathBuf) -> Result<Self> {
        let doc: ProjectsDoc = store::read(&path)?;
        Ok(Self {
            inner: RwLock::new(doc),
            path,
        })
    }

    /// Register a scanned workspace as a new project.
    ///
    /// The explicit name wins over the manifest name, which wins over the
    /// workspace directory name.
    pub async fn register(
        &self,
        workspace_path: PathBuf,
        name: Option<String>,
        scan: &ScanResult,
    ) -> Result<Project> {
        let name = name
            .or_else(|| scan.metadata.name.clone())
            .or_else(|| {
                workspace_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .ok_or_else(|| CoreError::Validation("project name could not be derived".into()))?;

        let mut doc = self.inner.write().await;

        if doc
            .projects
            .values()
            .any(|p| p.workspace_path == workspace_path)
        {
            return Err(CoreError::DuplicateWorkspace(
                workspace_path.display().to_string(),
            ));
        }

        let project = Project::new(
            name,
            workspace_path,
            scan.technologies.clone(),
            scan.primary_tech.clone(),
        );
        doc.projects
            .insert(project.project_id.clone(), project.clone());
        self.persist(&doc)?;

        tracing::info!(
            project_id = %project.project_id,
            name = %project.name,
            tech = %project.primary_tech,
            "registered project"
        );
        Ok(project)
    }

    /// Get a project by ID
    pub async fn get(&self, project_id: &str) -> Option<Project> {
        let doc = self.inner.read().await;
        doc.projects.get(project_id).cloned()
    }

    /// Get a project by ID or fail with `ProjectNotFound`
    pub async fn require(&self, project_id: &str) -> Result<Project> {
        self.get(project_id)
            .await
            .ok_or_else(|| CoreError::ProjectNotFound(project_id.to_string()))
    }

    /// Find a project by workspace path
    pub async fn find_by_workspace(&self, path: &Path) -> Option<Project> {
        let doc = self.inner.read().await;
        doc.projects
            .values()
            .find(|p| p.workspace_path == path)
            .cloned()
    }

    /// List projects, optionally filtered by status and primary tech
    pub async fn list(&self, filter: &ProjectFilter) -> Vec<Project> {
        let doc = self.inner.read().await;
        let mut projects: Vec<Project> = doc
            .projects
            .values()
            .filter(|p| filter.status.map_or(true, |s| p.status == s))
            .filter(|p| {
                filter
                    .tech
                    .as_deref()
                    .map_or(true, |t| p.primary_tech == t)
            })
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        projects
    }

    /// Apply a merge-patch to a project.
    ///
    /// Patches naming an immutable field are rejected outright; a patch
    /// value of the wrong shape fails deserialization of the merged
    /// document and leaves the record untouched.
    pub async fn update(&self, project_id: &str, patch: Value) -> Result<Project> {
        let Some(patch_map) = patch.as_object() else {
            return Err(CoreError::Validation("patch must be a JSON object".into()));
        };
        for field in IMMUTABLE_FIELDS {
            if patch_map.contains_key(*field) {
                return Err(CoreError::Validation(format!(
                    "field '{}' is immutable",
                    field
                )));
            }
        }

        let mut doc = self.inner.write().await;
        let project = doc
            .projects
            .get(project_id)
            .ok_or_else(|| CoreError::ProjectNotFound(project_id.to_string()))?;

        let mut merged = serde_json::to_value(project)?;
        if let Some(target) = merged.as_object_mut() {
            for (key, value) in patch_map {
                target.insert(key.clone(), value.clone());
            }
        }
        let updated: Project = serde_json::from_value(merged)
            .map_err(|e| CoreError::Validation(format!("invalid patch: {}", e)))?;

        doc.projects.insert(project_id.to_string(), updated.clone());
        self.persist(&doc)?;
        Ok(updated)
    }

    /// Mutate a project in place and persist. Used by the lifecycle manager
    /// for status transitions.
    pub async fn mutate<F>(&self, project_id: &str, f: F) -> Result<Project>
    where
        F: FnOnce(&mut Project),
    {
        let mut doc = self.inner.write().await;
        let project = doc
            .projects
            .get_mut(project_id)
            .ok_or_else(|| CoreError::ProjectNotFound(project_id.to_string()))?;
        f(project);
        project.last_operation_time = Some(chrono::Utc::now());
        let snapshot = project.clone();
        self.persist(&doc)?;
        Ok(snapshot)
    }

    /// Remove a project. Only terminal-status projects can be removed.
    pub async fn remove(&self, project_id: &str) -> Result<Project> {
        let mut doc = self.inner.write().await;
        let project = doc
            .projects
            .get(project_id)
            .ok_or_else(|| CoreError::ProjectNotFound(project_id.to_string()))?;

        if !project.status.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "project cannot be removed while {}",
                project.status
            )));
        }

        let removed = doc
            .projects
            .remove(project_id)
            .expect("checked presence above");
        self.persist(&doc)?;
        tracing::info!(project_id, name = %removed.name, "removed project");
        Ok(removed)
    }

    fn persist(&self, doc: &ProjectsDoc) -> Result<()> {
        store::write(&self.path, doc)
    }
}
