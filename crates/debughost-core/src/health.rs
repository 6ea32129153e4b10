//! Health monitoring
//!
//! Each watched container gets its own probe task hitting the stack's HTTP
//! probe path on the project's published port. A pure threshold tracker
//! turns probe outcomes into unhealthy/recovered transitions; events go out
//! on a broadcast channel the lifecycle manager and subscription bus both
//! consume. The monitor holds no reference back into the manager.

use chrono::{DateTime, Utc};
use debughost_config::HealthConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Point-in-time health of one container
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub container_id: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl HealthSnapshot {
    fn new(container_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            healthy: true,
            consecutive_failures: 0,
            last_checked_at: None,
            last_error: None,
        }
    }
}

/// Threshold crossings emitted by the monitor
#[derive(Debug, Clone)]
pub enum HealthEvent {
    Unhealthy {
        container_id: String,
        project_id: String,
        snapshot: HealthSnapshot,
    },
    Recovered {
        container_id: String,
        project_id: String,
        snapshot: HealthSnapshot,
    },
}

impl HealthEvent {
    pub fn project_id(&self) -> &str {
        match self {
            Self::Unhealthy { project_id, .. } | Self::Recovered { project_id, .. } => project_id,
        }
    }

    pub fn snapshot(&self) -> &HealthSnapshot {
        match self {
            Self::Unhealthy { snapshot, .. } | Self::Recovered { snapshot, .. } => snapshot,
        }
    }
}

/// What to probe for one container
#[derive(Debug, Clone)]
pub struct WatchSpec {
    pub project_id: String,
    pub port: u16,
    pub probe_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    BecameUnhealthy,
    Recovered,
}

/// Consecutive-outcome threshold state machine. Pure so the probe loop
/// stays trivially testable.
#[derive(Debug)]
struct HealthTracker {
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy: bool,
}

impl HealthTracker {
    fn new(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            unhealthy_threshold,
            healthy_threshold,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy: false,
        }
    }

    fn record_success(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        if self.unhealthy && self.consecutive_successes >= self.healthy_threshold {
            self.unhealthy = false;
            return Some(Transition::Recovered);
        }
        None
    }

    fn record_failure(&mut self) -> Option<Transition> {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        if !self.unhealthy && self.consecutive_failures >= self.unhealthy_threshold {
            self.unhealthy = true;
            return Some(Transition::BecameUnhealthy);
        }
        None
    }
}

struct Watch {
    task: JoinHandle<()>,
    snapshot: Arc<Mutex<HealthSnapshot>>,
}

/// Periodic readiness/liveness checker for supervised containers
pub struct HealthMonitor {
    config: HealthConfig,
    client: reqwest::Client,
    watches: Mutex<HashMap<String, Watch>>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_secs))
            .build()
            .unwrap_or_default();
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            client,
            watches: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to unhealthy/recovered transitions
    pub fn events(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Sender half of the event channel, for wiring the subscription bus
    pub fn event_channel(&self) -> broadcast::Sender<HealthEvent> {
        self.events.clone()
    }

    /// Begin probing a container. Replaces any existing watch for the id.
    pub fn watch(&self, container_id: &str, spec: WatchSpec) {
        let snapshot = Arc::new(Mutex::new(HealthSnapshot::new(container_id)));
        let task = tokio::spawn(probe_loop(
            self.client.clone(),
            self.config.clone(),
            container_id.to_string(),
            spec,
            Arc::clone(&snapshot),
            self.events.clone(),
        ));

        let mut watches = self.watches.lock().expect("health watches lock poisoned");
        if let Some(previous) = watches.insert(container_id.to_string(), Watch { task, snapshot }) {
            previous.task.abort();
        }
    }

    /// Stop probing a container
    pub fn unwatch(&self, container_id: &str) {
        let mut watches = self.watches.lock().expect("health watches lock poisoned");
        if let Some(watch) = watches.remove(container_id) {
            watch.task.abort();
            tracing::debug!(container = container_id, "health watch stopped");
        }
    }

    /// Latest snapshot for a watched container
    pub fn snapshot(&self, container_id: &str) -> Option<HealthSnapshot> {
        let watches = self.watches.lock().expect("health watches lock poisoned");
        watches.get(container_id).map(|w| {
            w.snapshot
                .lock()
                .expect("health snapshot lock poisoned")
                .clone()
        })
    }

    /// Stop every watch. Called first during service shutdown so no restart
    /// fires while operations drain.
    pub fn stop_all(&self) {
        let mut watches = self.watches.lock().expect("health watches lock poisoned");
        for (_, watch) in watches.drain() {
            watch.task.abort();
        }
    }

    /// Number of active watches
    pub fn watch_count(&self) -> usize {
        self.watches.lock().expect("health watches lock poisoned").len()
    }
}

async fn probe_loop(
    client: reqwest::Client,
    config: HealthConfig,
    container_id: String,
    spec: WatchSpec,
    snapshot: Arc<Mutex<HealthSnapshot>>,
    events: broadcast::Sender<HealthEvent>,
) {
    let url = format!("http://127.0.0.1:{}{}", spec.port, spec.probe_path);
    let mut tracker = HealthTracker::new(config.unhealthy_threshold, config.healthy_threshold);
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let outcome = match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("status {}", response.status())),
            Err(e) => Err(e.to_string()),
        };

        let event = apply_probe(&mut tracker, &snapshot, &container_id, &spec, outcome);
        if let Some(event) = event {
            match &event {
                HealthEvent::Unhealthy { snapshot, .. } => tracing::warn!(
                    container = %container_id,
                    project = %spec.project_id,
                    failures = snapshot.consecutive_failures,
                    "container unhealthy"
                ),
                HealthEvent::Recovered { .. } => tracing::info!(
                    container = %container_id,
                    project = %spec.project_id,
                    "container recovered"
                ),
            }
            let _ = events.send(event);
        }
    }
}

/// Fold one probe outcome into the tracker and snapshot, returning the
/// transition event when a threshold is crossed
fn apply_probe(
    tracker: &mut HealthTracker,
    snapshot: &Arc<Mutex<HealthSnapshot>>,
    container_id: &str,
    spec: &WatchSpec,
    outcome: std::result::Result<(), String>,
) -> Option<HealthEvent> {
    let transition = match &outcome {
        Ok(()) => tracker.record_success(),
        Err(_) => tracker.record_failure(),
    };

    let current = {
        let mut snap = snapshot.lock().expect("health snapshot lock poisoned");
        snap.healthy = !tracker.unhealthy;
        snap.consecutive_failures = tracker.consecutive_failures;
        snap.last_checked_at = Some(Utc::now());
        snap.last_error = outcome.err();
        snap.clone()
    };

    transition.map(|t| match t {
        Transition::BecameUnhealthy => HealthEvent::Unhealthy {
            container_id: container_id.to_string(),
            project_id: spec.project_id.clone(),
            snapshot: current,
        },
        Transition::Recovered => HealthEvent::Recovered {
            container_id: container_id.to_string(),
            project_id: spec.project_id.clone(),
            snapshot: current,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WatchSpec {
        WatchSpec {
            project_id: "p-1".to_string(),
            port: 3000,
            probe_path: "/health".to_string(),
        }
    }

    #[test]
    fn test_two_failures_then_success_emits_nothing() {
        let mut tracker = HealthTracker::new(3, 1);
        assert!(tracker.record_failure().is_none());
        assert!(tracker.record_failure().is_none());
        assert!(tracker.record_success().is_none());
        assert_eq!(tracker.consecutive_failures, 0);
    }

    #[test]
    fn test_threshold_crossing_fires_once() {
        let mut tracker = HealthTracker::new(3, 1);
        assert!(tracker.record_failure().is_none());
        assert!(tracker.record_failure().is_none());
        assert_eq!(
            tracker.record_failure(),
            Some(Transition::BecameUnhealthy)
        );
        // Further failures stay silent
        assert!(tracker.record_failure().is_none());
        assert!(tracker.record_failure().is_none());
    }

    #[test]
    fn test_recovery_after_unhealthy() {
        let mut tracker = HealthTracker::new(3, 1);
        for _ in 0..3 {
            tracker.record_failure();
        }
        assert_eq!(tracker.record_success(), Some(Transition::Recovered));
        // A healthy container succeeding again is not a new recovery
        assert!(tracker.record_success().is_none());
    }

    #[test]
    fn test_higher_healthy_threshold() {
        let mut tracker = HealthTracker::new(2, 3);
        tracker.record_failure();
        tracker.record_failure();
        assert!(tracker.unhealthy);

        assert!(tracker.record_success().is_none());
        assert!(tracker.record_success().is_none());
        assert_eq!(tracker.record_success(), Some(Transition::Recovered));
    }

    #[test]
    fn test_apply_probe_updates_snapshot() {
        let mut tracker = HealthTracker::new(2, 1);
        let snapshot = Arc::new(Mutex::new(HealthSnapshot::new("c-1")));

        let event = apply_probe(
            &mut tracker,
            &snapshot,
            "c-1",
            &spec(),
            Err("connection refused".to_string()),
        );
        assert!(event.is_none());
        {
            let snap = snapshot.lock().unwrap();
            assert!(snap.healthy);
            assert_eq!(snap.consecutive_failures, 1);
            assert_eq!(snap.last_error.as_deref(), Some("connection refused"));
            assert!(snap.last_checked_at.is_some());
        }

        let event = apply_probe(
            &mut tracker,
            &snapshot,
            "c-1",
            &spec(),
            Err("timeout".to_string()),
        );
        match event {
            Some(HealthEvent::Unhealthy {
                project_id,
                snapshot,
                ..
            }) => {
                assert_eq!(project_id, "p-1");
                assert!(!snapshot.healthy);
                assert_eq!(snapshot.consecutive_failures, 2);
            }
            other => panic!("expected Unhealthy, got {:?}", other),
        }

        let event = apply_probe(&mut tracker, &snapshot, "c-1", &spec(), Ok(()));
        assert!(matches!(event, Some(HealthEvent::Recovered { .. })));
        assert!(snapshot.lock().unwrap().healthy);
    }

    #[tokio::test]
    async fn test_watch_unwatch_bookkeeping() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        monitor.watch("c-1", spec());
        assert_eq!(monitor.watch_count(), 1);
        assert!(monitor.snapshot("c-1").is_some());
        assert!(monitor.snapshot("c-2").is_none());

        monitor.unwatch("c-1");
        assert_eq!(monitor.watch_count(), 0);
        assert!(monitor.snapshot("c-1").is_none());
    }

    #[tokio::test]
    async fn test_stop_all_clears_watches() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        monitor.watch("c-1", spec());
        monitor.watch(
            "c-2",
            WatchSpec {
                project_id: "p-2".to_string(),
                port: 3001,
                probe_path: "/".to_string(),
            },
        );
        assert_eq!(monitor.watch_count(), 2);
        monitor.stop_all();
        assert_eq!(monitor.watch_count(), 0);
    }
}
