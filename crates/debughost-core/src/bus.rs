//! Push-stream subscription bus
//!
//! Bridges the log collector and health monitor to one-way client streams.
//! Each subscription merges a project's log entries and health transitions
//! into a single typed event sequence with its own drop accounting. Routes
//! are opened when a project starts and closed when it stops; closing ends
//! live subscriptions through the collector's end-of-stream.

use crate::{CoreError, HealthEvent, LogCollector, LogEntry, LogSubscription, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// One event pushed to a subscriber
#[derive(Debug, Clone)]
pub enum PushEvent {
    Log(LogEntry),
    Health(HealthEvent),
}

/// Maps projects to their containers and hands out merged subscriptions
pub struct SubscriptionBus {
    collector: Arc<LogCollector>,
    health_events: broadcast::Sender<HealthEvent>,
    routes: Mutex<HashMap<String, String>>,
}

impl SubscriptionBus {
    pub fn new(
        collector: Arc<LogCollector>,
        health_events: broadcast::Sender<HealthEvent>,
    ) -> Self {
        Self {
            collector,
            health_events,
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Make a running project's container subscribable
    pub fn open_route(&self, project_id: &str, container_name: &str) {
        self.routes
            .lock()
            .expect("bus routes lock poisoned")
            .insert(project_id.to_string(), container_name.to_string());
    }

    /// Drop a project's route. Live subscriptions end when the collector
    /// stops the container's stream.
    pub fn close_route(&self, project_id: &str) {
        self.routes
            .lock()
            .expect("bus routes lock poisoned")
            .remove(project_id);
    }

    /// Open a push stream for a project
    pub fn subscribe(&self, project_id: &str) -> Result<ProjectSubscription> {
        let container_name = self
            .routes
            .lock()
            .expect("bus routes lock poisoned")
            .get(project_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::InvalidState(format!("project {} is not streaming", project_id))
            })?;

        let logs = self.collector.subscribe(&container_name)?;
        Ok(ProjectSubscription {
            project_id: project_id.to_string(),
            logs,
            health: self.health_events.subscribe(),
            health_open: true,
            health_dropped: 0,
        })
    }

    /// Number of open routes
    pub fn route_count(&self) -> usize {
        self.routes.lock().expect("bus routes lock poisoned").len()
    }
}

/// A single consumer's merged feed of log and health events
pub struct ProjectSubscription {
    project_id: String,
    logs: LogSubscription,
    health: broadcast::Receiver<HealthEvent>,
    health_open: bool,
    health_dropped: u64,
}

impl ProjectSubscription {
    /// Next event, or `None` once the project's stream has ended
    pub async fn next(&mut self) -> Option<PushEvent> {
        loop {
            if !self.health_open {
                return self.logs.next().await.map(PushEvent::Log);
            }

            tokio::select! {
                log = self.logs.next() => {
                    // End of the log stream ends the subscription
                    return log.map(PushEvent::Log);
                }
                health = self.health.recv() => match health {
                    Ok(event) if event.project_id() == self.project_id => {
                        return Some(PushEvent::Health(event));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.health_dropped += n;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.health_open = false;
                    }
                },
            }
        }
    }

    /// Log entries this subscription lost to queue overflow
    pub fn logs_dropped(&self) -> u64 {
        self.logs.dropped()
    }

    /// Health events this subscription lost to queue overflow
    pub fn health_dropped(&self) -> u64 {
        self.health_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HealthSnapshot;
    use debughost_provider::LogStream;
    use std::time::Duration;

    fn framed(stream_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![stream_id, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn health_event(project_id: &str) -> HealthEvent {
        HealthEvent::Unhealthy {
            container_id: "c-1".to_string(),
            project_id: project_id.to_string(),
            snapshot: HealthSnapshot {
                container_id: "c-1".to_string(),
                healthy: false,
                consecutive_failures: 3,
                last_checked_at: None,
                last_error: Some("refused".to_string()),
            },
        }
    }

    fn bus_with_attached() -> (
        Arc<LogCollector>,
        broadcast::Sender<HealthEvent>,
        SubscriptionBus,
        tokio::io::DuplexStream,
    ) {
        let collector = Arc::new(LogCollector::new(100, 16));
        let (writer, reader) = tokio::io::duplex(256);
        collector.attach(
            "dh-web",
            LogStream {
                stream: Box::pin(reader),
            },
        );
        let (health_tx, _) = broadcast::channel(16);
        let bus = SubscriptionBus::new(Arc::clone(&collector), health_tx.clone());
        bus.open_route("p-1", "dh-web");
        (collector, health_tx, bus, writer)
    }

    #[tokio::test]
    async fn test_subscription_merges_logs_and_health() {
        let (_collector, health_tx, bus, mut writer) = bus_with_attached();
        let mut sub = bus.subscribe("p-1").unwrap();

        tokio::io::AsyncWriteExt::write_all(&mut writer, &framed(1, b"ready\n"))
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        match event {
            PushEvent::Log(entry) => assert_eq!(entry.message, "ready"),
            other => panic!("expected log event, got {:?}", other),
        }

        health_tx.send(health_event("p-1")).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            PushEvent::Health(HealthEvent::Unhealthy { .. })
        ));
    }

    #[tokio::test]
    async fn test_other_projects_health_filtered_out() {
        let (_collector, health_tx, bus, mut writer) = bus_with_attached();
        let mut sub = bus.subscribe("p-1").unwrap();

        health_tx.send(health_event("p-other")).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut writer, &framed(1, b"after\n"))
            .await
            .unwrap();

        // The foreign health event is skipped; the log entry comes through
        let event = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        match event {
            PushEvent::Log(entry) => assert_eq!(entry.message, "after"),
            other => panic!("expected log event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_unrouted_project_fails() {
        let collector = Arc::new(LogCollector::new(10, 8));
        let (health_tx, _) = broadcast::channel(16);
        let bus = SubscriptionBus::new(collector, health_tx);
        assert!(bus.subscribe("ghost").is_err());
    }

    #[tokio::test]
    async fn test_stop_ends_subscription() {
        let (collector, _health_tx, bus, _writer) = bus_with_attached();
        let mut sub = bus.subscribe("p-1").unwrap();

        collector.stop("dh-web");
        bus.close_route("p-1");

        let end = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap();
        assert!(end.is_none());
        assert!(bus.subscribe("p-1").is_err());
        assert_eq!(bus.route_count(), 0);
    }
}
