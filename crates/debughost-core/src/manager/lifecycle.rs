//! Lifecycle operations for ProjectManager: start, stop, restart

use super::{Operation, ProjectManager};
use crate::{CoreError, HealthState, Project, ProjectStatus, Result, WatchSpec};
use chrono::Utc;
use debughost_provider::{
    ContainerId, CreateContainerConfig, EngineError, LogAttachConfig, MountConfig, MountType,
    PortConfig,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Grace period used for the stop half of a restart, in seconds
const RESTART_STOP_GRACE_SECS: u32 = 5;

/// Caller options for `start`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Explicit port request; conflicts surface instead of substituting
    pub preferred_port: Option<u16>,
    /// Environment overrides merged over the stack template's
    pub env: HashMap<String, String>,
}

/// Caller options for `stop`
#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// Remove immediately instead of waiting out the grace period
    pub force: bool,
    /// Override of the stack's graceful stop window, in seconds
    pub grace_secs: Option<u32>,
}

/// Successful start payload
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub project_id: String,
    pub container_id: String,
    pub container_name: String,
    pub ports: crate::PortAssignment,
    pub access_url: String,
    pub elapsed_ms: u64,
}

/// Successful stop payload
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub project_id: String,
    pub elapsed_ms: u64,
}

impl ProjectManager {
    /// Start a project's container.
    ///
    /// Fails fast with `OperationInProgress` when another lifecycle
    /// operation holds the project. On failure the partial container is
    /// cleaned up, ports are released, and the project lands in `error`.
    pub async fn start(&self, project_id: &str, opts: StartOptions) -> Result<StartOutcome> {
        let _guard = self.acquire_op(project_id, Operation::Starting)?;

        let project = self
            .registry()
            .require(project_id)
            .await
            .map_err(|e| e.in_operation("start", project_id))?;
        if !project.can_start() {
            return Err(CoreError::InvalidState(format!(
                "project cannot start while {}",
                project.status
            ))
            .in_operation("start", project_id));
        }

        self.count_start();
        match self.start_inner(&project, &opts).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail_start(project_id, &e).await;
                Err(e.in_operation("start", project_id))
            }
        }
    }

    /// Stop a project's container. A project with no recorded container is
    /// a no-op success.
    pub async fn stop(&self, project_id: &str, opts: StopOptions) -> Result<StopOutcome> {
        let _guard = self.acquire_op(project_id, Operation::Stopping)?;

        let project = self
            .registry()
            .require(project_id)
            .await
            .map_err(|e| e.in_operation("stop", project_id))?;

        self.count_stop();
        self.stop_inner(&project, &opts)
            .await
            .map_err(|e| e.in_operation("stop", project_id))
    }

    /// Stop (short grace) then start, atomically with respect to other
    /// operations on the project. A stop failure does not abort the start.
    pub async fn restart(&self, project_id: &str, opts: StartOptions) -> Result<StartOutcome> {
        let _guard = self.acquire_op(project_id, Operation::Restarting)?;

        let project = self
            .registry()
            .require(project_id)
            .await
            .map_err(|e| e.in_operation("restart", project_id))?;

        self.count_restart();
        self.registry()
            .mutate(project_id, |p| p.status = ProjectStatus::Restarting)
            .await
            .map_err(|e| e.in_operation("restart", project_id))?;

        if project.container_id.is_some() {
            let stop_opts = StopOptions {
                force: false,
                grace_secs: Some(RESTART_STOP_GRACE_SECS),
            };
            if let Err(e) = self.stop_inner(&project, &stop_opts).await {
                tracing::warn!(project_id, "stop during restart failed, starting anyway: {}", e);
            }
        }

        let project = self
            .registry()
            .require(project_id)
            .await
            .map_err(|e| e.in_operation("restart", project_id))?;
        match self.start_inner(&project, &opts).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail_start(project_id, &e).await;
                Err(e.in_operation("restart", project_id))
            }
        }
    }

    async fn start_inner(&self, project: &Project, opts: &StartOptions) -> Result<StartOutcome> {
        let started = Instant::now();
        let project_id = project.project_id.as_str();
        let tech = project.primary_tech.as_str();

        let template = self
            .config()
            .stacks
            .template_for(tech)
            .cloned()
            .ok_or_else(|| {
                CoreError::Validation(format!("no container template for tech '{}'", tech))
            })?;

        if !self.engine().image_present(&template.image).await? {
            return Err(CoreError::ImageUnavailable(template.image.clone()));
        }

        let port = self.resolve_port(project, opts)?;
        let container_name = format!("dh-{}-{}", slug(&project.name), project.short_id());

        self.registry()
            .mutate(project_id, |p| {
                p.status = ProjectStatus::Starting;
                p.container_name = Some(container_name.clone());
                p.ports.primary = Some(port);
                p.last_error = None;
            })
            .await?;

        let create_config = self.build_container_config(project, &template, port, &container_name, opts);
        let container_id = match self.engine().create(&create_config).await {
            Ok(id) => id,
            Err(EngineError::NameConflict(_)) => {
                // A previous run left a container under this name behind
                tracing::warn!(container = %container_name, "removing stale container before create");
                let _ = self
                    .engine()
                    .remove(&ContainerId::new(&container_name), true)
                    .await;
                self.engine().create(&create_config).await?
            }
            Err(e) => return Err(e.into()),
        };

        self.registry()
            .mutate(project_id, |p| {
                p.container_id = Some(container_id.0.clone());
            })
            .await?;

        self.engine().start(&container_id).await?;

        match self
            .engine()
            .attach_logs(
                &container_id,
                &LogAttachConfig {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    tail: Some(self.config().logs.attach_tail),
                    timestamps: true,
                    since: None,
                },
            )
            .await
        {
            Ok(stream) => self.collector().attach(&container_name, stream),
            Err(e) => tracing::warn!(container = %container_name, "log attach failed: {}", e),
        }

        self.wait_ready(&container_id, tech, template.startup_timeout_secs)
            .await?;

        self.monitor().watch(
            &container_id.0,
            WatchSpec {
                project_id: project_id.to_string(),
                port,
                probe_path: template.probe_path.clone(),
            },
        );
        self.bus().open_route(project_id, &container_name);

        let updated = self
            .registry()
            .mutate(project_id, |p| {
                p.status = ProjectStatus::Running;
                p.started_at = Some(Utc::now());
                p.stopped_at = None;
                p.health_status = HealthState::Unknown;
            })
            .await?;

        let access_url = format!("http://localhost:{}", port);
        tracing::info!(
            project_id,
            container = %container_name,
            port,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "project started"
        );

        Ok(StartOutcome {
            project_id: project_id.to_string(),
            container_id: container_id.0,
            container_name,
            ports: updated.ports,
            access_url,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn stop_inner(&self, project: &Project, opts: &StopOptions) -> Result<StopOutcome> {
        let started = Instant::now();
        let project_id = project.project_id.as_str();

        let Some(container_id) = project.container_id.clone() else {
            tracing::debug!(project_id, "stop with no recorded container is a no-op");
            return Ok(StopOutcome {
                project_id: project_id.to_string(),
                elapsed_ms: 0,
            });
        };

        self.registry()
            .mutate(project_id, |p| p.status = ProjectStatus::Stopping)
            .await?;

        // Quiesce observers before touching the container
        self.monitor().unwatch(&container_id);
        if let Some(ref container_name) = project.container_name {
            self.collector().stop(container_name);
        }
        self.bus().close_route(project_id);

        let cid = ContainerId::new(&container_id);
        if opts.force {
            self.engine().remove(&cid, true).await?;
        } else {
            let grace = opts.grace_secs.unwrap_or_else(|| {
                self.config()
                    .stacks
                    .template_for(&project.primary_tech)
                    .map(|t| t.stop_grace_secs)
                    .unwrap_or(10)
            });
            if let Err(e) = self.engine().stop(&cid, Some(grace)).await {
                if !e.is_not_found() {
                    tracing::warn!(
                        project_id,
                        grace,
                        "graceful stop failed, escalating to forced removal: {}",
                        e
                    );
                }
            }
            if let Err(e) = self.engine().remove(&cid, true).await {
                if !e.is_not_found() {
                    tracing::warn!(project_id, "container removal failed: {}", e);
                }
            }
        }

        self.ports().release_for_project(project_id)?;

        self.registry()
            .mutate(project_id, |p| {
                p.status = ProjectStatus::Stopped;
                p.container_id = None;
                p.stopped_at = Some(Utc::now());
                p.health_status = HealthState::Unknown;
            })
            .await?;

        tracing::info!(
            project_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "project stopped"
        );
        Ok(StopOutcome {
            project_id: project_id.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Reuse the held primary port when possible, otherwise allocate.
    /// The record's prior primary is tried as an implicit preference; its
    /// conflict falls back to the range. An explicit preference conflicts
    /// loudly.
    fn resolve_port(&self, project: &Project, opts: &StartOptions) -> Result<u16> {
        let range = self.config().stacks.range_for(&project.primary_tech);
        let project_id = project.project_id.as_str();

        if opts.preferred_port.is_none() {
            if let Some(port) = project.ports.primary {
                if self.ports().is_held_by(port, project_id) {
                    return Ok(port);
                }
            }
        }

        let preferred = opts.preferred_port.or(project.ports.primary);
        match self
            .ports()
            .allocate(project_id, &project.primary_tech, range, preferred)
        {
            Ok(port) => Ok(port),
            Err(CoreError::PortConflict { .. })
                if opts.preferred_port.is_none() && project.ports.primary.is_some() =>
            {
                self.ports()
                    .allocate(project_id, &project.primary_tech, range, None)
            }
            Err(e) => Err(e),
        }
    }

    fn build_container_config(
        &self,
        project: &Project,
        template: &debughost_config::StackTemplate,
        port: u16,
        container_name: &str,
        opts: &StartOptions,
    ) -> CreateContainerConfig {
        let mut env = HashMap::from([
            ("NODE_ENV".to_string(), "development".to_string()),
            ("DEBUG".to_string(), "*".to_string()),
            ("PROJECT_NAME".to_string(), project.name.clone()),
            ("PROJECT_ID".to_string(), project.project_id.clone()),
            ("PRIMARY_TECH".to_string(), project.primary_tech.clone()),
            ("PORT".to_string(), port.to_string()),
        ]);
        env.extend(opts.env.clone());

        CreateContainerConfig {
            image: template.image.clone(),
            name: Some(container_name.to_string()),
            cmd: None,
            env,
            mounts: vec![MountConfig {
                mount_type: MountType::Bind,
                source: project.workspace_path.display().to_string(),
                target: "/workspace".to_string(),
                read_only: false,
            }],
            ports: vec![PortConfig {
                host_port: Some(port),
                container_port: port,
                protocol: "tcp".to_string(),
            }],
            labels: HashMap::from([
                ("debug-host".to_string(), "true".to_string()),
                ("debug-host.project".to_string(), project.project_id.clone()),
            ]),
            network: Some(self.config().network.name.clone()),
            tty: false,
        }
    }

    /// Wait until the engine reports the container running, then let
    /// non-static stacks settle. Bounded overall by the tech's startup
    /// timeout.
    async fn wait_ready(&self, id: &ContainerId, tech: &str, timeout_secs: u64) -> Result<()> {
        let settle = if tech == "static" {
            Duration::ZERO
        } else {
            Duration::from_secs(self.config().health.settle_secs)
        };

        let readiness = async {
            loop {
                let details = self.engine().inspect(id).await?;
                match details.status {
                    debughost_provider::ContainerStatus::Running => break,
                    debughost_provider::ContainerStatus::Exited
                    | debughost_provider::ContainerStatus::Dead => {
                        return Err(CoreError::Engine(EngineError::RuntimeError(format!(
                            "container exited during startup (exit code {:?})",
                            details.exit_code
                        ))));
                    }
                    _ => tokio::time::sleep(Duration::from_millis(250)).await,
                }
            }
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            Ok(())
        };

        match tokio::time::timeout(Duration::from_secs(timeout_secs), readiness).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::StartupTimeout { timeout_secs }),
        }
    }

    /// Best-effort cleanup after a failed start: tear down observers,
    /// remove any partially created container, release ports, record the
    /// error state.
    async fn fail_start(&self, project_id: &str, error: &CoreError) {
        let Some(project) = self.registry().get(project_id).await else {
            return;
        };

        if let Some(ref container_id) = project.container_id {
            self.monitor().unwatch(container_id);
            if let Err(e) = self
                .engine()
                .remove(&ContainerId::new(container_id), true)
                .await
            {
                if !e.is_not_found() {
                    tracing::warn!(project_id, "startup cleanup could not remove container: {}", e);
                }
            }
        }
        if let Some(ref container_name) = project.container_name {
            self.collector().stop(container_name);
        }
        self.bus().close_route(project_id);

        if let Err(e) = self.ports().release_for_project(project_id) {
            tracing::warn!(project_id, "startup cleanup could not release ports: {}", e);
        }

        let message = error.to_string();
        let _ = self
            .registry()
            .mutate(project_id, |p| {
                p.status = ProjectStatus::Error;
                p.container_id = None;
                p.last_error = Some(message.clone());
                p.health_status = HealthState::Unknown;
            })
            .await;
    }
}

/// Container-name-safe slug of a project name
fn slug(name: &str) -> String {
    let mut out: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_string()
}
