//! Project lifecycle manager - coordinates all runtime state mutations
//!
//! The manager is the only component that changes a project's runtime state.
//! It enforces at-most-one in-flight operation per project through RAII
//! operation guards, wires containers into the log collector, health
//! monitor, and subscription bus, and drives monitor-reported recoveries.

mod lifecycle;

pub use lifecycle::{StartOptions, StartOutcome, StopOptions, StopOutcome};

use crate::{
    CoreError, HealthEvent, HealthMonitor, HealthState, LogCollector, LogEntry, LogFilter,
    PortRegistry, PortUsage, Project, ProjectFilter, ProjectRegistry, ProjectStatus,
    ProjectSubscription, Result, ScanResult, SubscriptionBus, WorkspaceScanner,
};
use chrono::Utc;
use debughost_config::GlobalConfig;
use debughost_provider::{ContainerEngine, ContainerId, NetworkSpec};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Exclusive per-project operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Starting,
    Stopping,
    Restarting,
    Removing,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Stopping => write!(f, "stopping"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
        }
    }
}

/// Operation counters reported by [`ProjectManager::metrics`]
#[derive(Debug, Default)]
struct Metrics {
    starts: AtomicU64,
    stops: AtomicU64,
    restarts: AtomicU64,
    auto_restarts: AtomicU64,
}

/// Snapshot of the manager's operation counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub starts: u64,
    pub stops: u64,
    pub restarts: u64,
    pub auto_restarts: u64,
}

/// Full status report for one project
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project_id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub primary_tech: String,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub ports: crate::PortAssignment,
    pub health: Option<crate::HealthSnapshot>,
    pub uptime_ms: Option<i64>,
    pub access_url: Option<String>,
    pub last_error: Option<String>,
}

/// RAII guard releasing the per-project operation slot on drop
pub(crate) struct OpGuard {
    locks: Arc<Mutex<HashMap<String, Operation>>>,
    project_id: String,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.locks
            .lock()
            .expect("operation locks poisoned")
            .remove(&self.project_id);
    }
}

/// The supervisor core: registries, engine, log/health plumbing, and the
/// lifecycle operations tying them together
pub struct ProjectManager {
    engine: Box<dyn ContainerEngine>,
    registry: ProjectRegistry,
    ports: PortRegistry,
    scanner: WorkspaceScanner,
    collector: Arc<LogCollector>,
    monitor: HealthMonitor,
    bus: SubscriptionBus,
    config: GlobalConfig,
    op_locks: Arc<Mutex<HashMap<String, Operation>>>,
    restart_attempts: Mutex<HashMap<String, Instant>>,
    metrics: Metrics,
    shutting_down: AtomicBool,
}

impl ProjectManager {
    /// Build the supervisor against a connected engine. Ensures the bridge
    /// network, loads persisted registries, reconciles orphaned records, and
    /// starts the auto-recovery loop.
    pub async fn new(engine: Box<dyn ContainerEngine>, config: GlobalConfig) -> Result<Arc<Self>> {
        let registry = ProjectRegistry::open(config.projects_path()?)?;
        let ports = PortRegistry::open(config.ports_path()?, config.ports.recycle_quarantine_secs)?;
        Self::assemble(engine, config, registry, ports).await
    }

    /// Assemble from explicit parts, for tests that need isolated stores
    pub async fn with_parts(
        engine: Box<dyn ContainerEngine>,
        config: GlobalConfig,
        registry: ProjectRegistry,
        ports: PortRegistry,
    ) -> Result<Arc<Self>> {
        Self::assemble(engine, config, registry, ports).await
    }

    async fn assemble(
        engine: Box<dyn ContainerEngine>,
        config: GlobalConfig,
        registry: ProjectRegistry,
        ports: PortRegistry,
    ) -> Result<Arc<Self>> {
        engine
            .ensure_network(&NetworkSpec {
                name: config.network.name.clone(),
                subnet: config.network.subnet.clone(),
                gateway: config.network.gateway.clone(),
                labels: HashMap::from([("debug-host".to_string(), "true".to_string())]),
            })
            .await?;

        let collector = Arc::new(LogCollector::new(
            config.logs.buffer_capacity,
            config.logs.subscriber_capacity,
        ));
        let monitor = HealthMonitor::new(config.health.clone());
        let bus = SubscriptionBus::new(Arc::clone(&collector), monitor.event_channel());
        let scanner = WorkspaceScanner::new(config.stacks.clone());

        let manager = Arc::new(Self {
            engine,
            registry,
            ports,
            scanner,
            collector,
            monitor,
            bus,
            config,
            op_locks: Arc::new(Mutex::new(HashMap::new())),
            restart_attempts: Mutex::new(HashMap::new()),
            metrics: Metrics::default(),
            shutting_down: AtomicBool::new(false),
        });

        manager.reconcile_all().await;
        Self::spawn_recovery_loop(&manager);
        Ok(manager)
    }

    /// Scan a workspace directory without registering it
    pub fn scan_workspace(&self, path: &Path) -> Result<ScanResult> {
        self.scanner.scan(path)
    }

    /// Register a workspace as a new project
    pub async fn register(
        &self,
        workspace_path: impl Into<std::path::PathBuf>,
        name: Option<String>,
    ) -> Result<Project> {
        let workspace_path = workspace_path.into();
        let scan = self.scanner.scan(&workspace_path)?;
        self.registry.register(workspace_path, name, &scan).await
    }

    /// Get a project by ID
    pub async fn get(&self, project_id: &str) -> Option<Project> {
        self.registry.get(project_id).await
    }

    /// List projects, optionally filtered
    pub async fn list(&self, filter: &ProjectFilter) -> Vec<Project> {
        self.registry.list(filter).await
    }

    /// Merge-patch mutable project fields
    pub async fn update(&self, project_id: &str, patch: serde_json::Value) -> Result<Project> {
        self.registry.update(project_id, patch).await
    }

    /// Remove a project in a terminal state, releasing its resources
    pub async fn remove(&self, project_id: &str) -> Result<Project> {
        let _guard = self.acquire_op(project_id, Operation::Removing)?;

        let removed = self
            .registry
            .remove(project_id)
            .await
            .map_err(|e| e.in_operation("remove", project_id))?;

        self.ports.release_for_project(project_id)?;
        if let Some(ref container_name) = removed.container_name {
            self.collector.remove(container_name);
        }
        self.restart_attempts
            .lock()
            .expect("restart attempts lock poisoned")
            .remove(project_id);
        Ok(removed)
    }

    /// Remove every project resting in a terminal state. Failures are
    /// logged per project; the sweep continues. Returns removed IDs.
    pub async fn clear_inactive(&self) -> Vec<String> {
        let mut removed = Vec::new();
        for status in [ProjectStatus::Stopped, ProjectStatus::Error] {
            let projects = self
                .registry
                .list(&ProjectFilter {
                    status: Some(status),
                    ..Default::default()
                })
                .await;
            for project in projects {
                match self.remove(&project.project_id).await {
                    Ok(_) => removed.push(project.project_id),
                    Err(e) => {
                        tracing::warn!(
                            project_id = %project.project_id,
                            "clear_inactive skipped project: {}",
                            e
                        );
                    }
                }
            }
        }
        removed
    }

    /// Reconciled status report for one project
    pub async fn status(&self, project_id: &str) -> Result<StatusReport> {
        let mut project = self.registry.require(project_id).await?;

        if let Some(container_id) = project.container_id.clone() {
            match self.engine.inspect(&ContainerId::new(&container_id)).await {
                Ok(details) if details.is_running() => {}
                Ok(_) | Err(debughost_provider::EngineError::NotFound(_)) => {
                    // The engine no longer backs this record
                    project = self.reconcile_lost_container(&project).await?;
                }
                Err(e) => {
                    tracing::warn!(project_id, "status inspect failed, reporting persisted state: {}", e);
                }
            }
        }

        let health = project
            .container_id
            .as_deref()
            .and_then(|cid| self.monitor.snapshot(cid));

        Ok(StatusReport {
            project_id: project.project_id.clone(),
            name: project.name.clone(),
            status: project.status,
            primary_tech: project.primary_tech.clone(),
            container_id: project.container_id.clone(),
            container_name: project.container_name.clone(),
            ports: project.ports.clone(),
            health,
            uptime_ms: project.uptime_ms(),
            access_url: if project.status == ProjectStatus::Running {
                project.access_url()
            } else {
                None
            },
            last_error: project.last_error.clone(),
        })
    }

    /// Buffered log history for a project's container
    pub fn project_logs(&self, project: &Project, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        match project.container_name.as_deref() {
            Some(name) => self.collector.buffered(name, filter),
            None => Ok(Vec::new()),
        }
    }

    /// Buffered log history by project ID
    pub async fn logs(&self, project_id: &str, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let project = self.registry.require(project_id).await?;
        self.project_logs(&project, filter)
    }

    /// Open a live push stream of a running project's logs and health
    pub async fn subscribe(&self, project_id: &str) -> Result<ProjectSubscription> {
        self.registry.require(project_id).await?;
        self.bus.subscribe(project_id)
    }

    /// Port occupancy for one tech's range
    pub fn port_usage(&self, tech: &str) -> PortUsage {
        self.ports.usage(self.config.stacks.range_for(tech))
    }

    /// Operation counters
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            starts: self.metrics.starts.load(Ordering::Relaxed),
            stops: self.metrics.stops.load(Ordering::Relaxed),
            restarts: self.metrics.restarts.load(Ordering::Relaxed),
            auto_restarts: self.metrics.auto_restarts.load(Ordering::Relaxed),
        }
    }

    /// Orderly service shutdown: health probing stops first so no restart
    /// fires mid-drain, then in-flight operations get up to 30 seconds.
    /// Containers are left running; the service is restartable.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.monitor.stop_all();

        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let pending: Vec<(String, Operation)> = {
                let locks = self.op_locks.lock().expect("operation locks poisoned");
                locks.iter().map(|(k, v)| (k.clone(), *v)).collect()
            };
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                for (project_id, op) in pending {
                    tracing::warn!(project_id = %project_id, operation = %op, "operation still in flight at shutdown");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::info!("supervisor shut down");
    }

    pub(crate) fn acquire_op(&self, project_id: &str, op: Operation) -> Result<OpGuard> {
        let mut locks = self.op_locks.lock().expect("operation locks poisoned");
        if let Some(existing) = locks.get(project_id) {
            return Err(CoreError::OperationInProgress {
                project_id: project_id.to_string(),
                operation: existing.to_string(),
            });
        }
        locks.insert(project_id.to_string(), op);
        Ok(OpGuard {
            locks: Arc::clone(&self.op_locks),
            project_id: project_id.to_string(),
        })
    }

    /// Reconcile every persisted record against the engine. Re-adopts
    /// containers that are still running, corrects the rest to stopped.
    async fn reconcile_all(&self) {
        let projects = self.registry.list(&ProjectFilter::default()).await;
        for project in projects {
            if project.container_id.is_none() && !project.status.has_container() {
                continue;
            }
            let Some(container_id) = project.container_id.clone() else {
                // Status claims a container but none is recorded
                let _ = self
                    .registry
                    .mutate(&project.project_id, |p| {
                        p.status = ProjectStatus::Stopped;
                        p.health_status = HealthState::Unknown;
                    })
                    .await;
                continue;
            };

            match self.engine.inspect(&ContainerId::new(&container_id)).await {
                Ok(details) if details.is_running() => {
                    tracing::info!(
                        project_id = %project.project_id,
                        container = %container_id,
                        "re-adopting running container"
                    );
                    self.adopt_running(&project, &container_id).await;
                }
                _ => {
                    let _ = self.reconcile_lost_container(&project).await;
                }
            }
        }
    }

    /// Re-attach logs, health, and routing for a container that survived a
    /// service restart
    async fn adopt_running(&self, project: &Project, container_id: &str) {
        let container_name = project
            .container_name
            .clone()
            .unwrap_or_else(|| container_id.to_string());

        if let Ok(stream) = self
            .engine
            .attach_logs(
                &ContainerId::new(container_id),
                &debughost_provider::LogAttachConfig {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    tail: Some(self.config.logs.attach_tail),
                    timestamps: true,
                    since: None,
                },
            )
            .await
        {
            self.collector.attach(&container_name, stream);
        }

        if let Some(port) = project.ports.primary {
            let probe_path = self
                .config
                .stacks
                .template_for(&project.primary_tech)
                .map(|t| t.probe_path.clone())
                .unwrap_or_else(|| "/".to_string());
            self.monitor.watch(
                container_id,
                crate::WatchSpec {
                    project_id: project.project_id.clone(),
                    port,
                    probe_path,
                },
            );
        }
        self.bus.open_route(&project.project_id, &container_name);

        let _ = self
            .registry
            .mutate(&project.project_id, |p| {
                p.status = ProjectStatus::Running;
            })
            .await;
    }

    /// Correct a record whose container the engine no longer reports
    async fn reconcile_lost_container(&self, project: &Project) -> Result<Project> {
        tracing::info!(
            project_id = %project.project_id,
            "container gone from engine, reconciling to stopped"
        );
        if let Some(ref container_id) = project.container_id {
            self.monitor.unwatch(container_id);
        }
        if let Some(ref container_name) = project.container_name {
            self.collector.stop(container_name);
        }
        self.bus.close_route(&project.project_id);
        self.ports.release_for_project(&project.project_id)?;

        self.registry
            .mutate(&project.project_id, |p| {
                p.status = ProjectStatus::Stopped;
                p.container_id = None;
                p.stopped_at = Some(Utc::now());
                p.health_status = HealthState::Unknown;
            })
            .await
    }

    fn spawn_recovery_loop(manager: &Arc<Self>) {
        let mut events = manager.monitor.events();
        let weak = Arc::downgrade(manager);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.handle_health_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "health event loop lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_health_event(&self, event: HealthEvent) {
        match event {
            HealthEvent::Recovered { project_id, .. } => {
                let _ = self
                    .registry
                    .mutate(&project_id, |p| {
                        p.health_status = HealthState::Healthy;
                        p.last_health_check = Some(Utc::now());
                    })
                    .await;
            }
            HealthEvent::Unhealthy { project_id, .. } => {
                let _ = self
                    .registry
                    .mutate(&project_id, |p| {
                        p.health_status = HealthState::Unhealthy;
                        p.last_health_check = Some(Utc::now());
                    })
                    .await;

                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }

                let cooldown = Duration::from_secs(self.config.health.restart_cooldown_secs);
                {
                    let mut attempts = self
                        .restart_attempts
                        .lock()
                        .expect("restart attempts lock poisoned");
                    if let Some(last) = attempts.get(&project_id) {
                        if last.elapsed() < cooldown {
                            tracing::debug!(
                                project_id = %project_id,
                                "unhealthy within restart cooldown, recording only"
                            );
                            return;
                        }
                    }
                    // One attempt per window, whatever its outcome
                    attempts.insert(project_id.clone(), Instant::now());
                }

                tracing::warn!(project_id = %project_id, "unhealthy threshold crossed, restarting");
                match self.restart(&project_id, StartOptions::default()).await {
                    Ok(_) => {
                        self.metrics.auto_restarts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(CoreError::OperationInProgress { .. }) => {
                        // Never queued behind a live operation
                        tracing::debug!(project_id = %project_id, "restart dropped, operation in flight");
                    }
                    Err(e) => {
                        tracing::error!(project_id = %project_id, "monitor-driven restart failed: {}", e);
                    }
                }
            }
        }
    }

    pub(crate) fn engine(&self) -> &dyn ContainerEngine {
        self.engine.as_ref()
    }

    pub(crate) fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    pub(crate) fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub(crate) fn collector(&self) -> &LogCollector {
        &self.collector
    }

    pub(crate) fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub(crate) fn bus(&self) -> &SubscriptionBus {
        &self.bus
    }

    pub(crate) fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub(crate) fn count_start(&self) {
        self.metrics.starts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_stop(&self) {
        self.metrics.stops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_restart(&self) {
        self.metrics.restarts.fetch_add(1, Ordering::Relaxed);
    }
}
