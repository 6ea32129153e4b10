//! Port registry: allocation, conflict detection, and recycling of TCP ports
//! within per-tech ranges.
//!
//! Released ports sit in a quarantine window before reuse so the prior
//! socket can drain out of TIME_WAIT. The allocation table persists to
//! `ports.json` after every mutation.

use crate::{store, CoreError, Result};
use chrono::{DateTime, Utc};
use debughost_config::PortRange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

const HISTORY_CAP: usize = 256;

/// Allocation lifecycle of a single port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortStatus {
    InUse,
    Recycling,
    Free,
}

/// A single port's allocation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
    pub project_id: String,
    pub tech: String,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub status: PortStatus,
}

/// One line of the allocation history tail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortEvent {
    pub port: u16,
    pub project_id: String,
    pub tech: String,
    pub action: String,
    pub at: DateTime<Utc>,
}

/// Persisted document shape of `ports.json`. Ordered map so an unchanged
/// document rewrites byte-identically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortsDoc {
    pub allocations: BTreeMap<u16, PortAllocation>,
    pub history: Vec<PortEvent>,
}

/// Occupancy summary for one tech range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortUsage {
    pub allocated: usize,
    pub free: usize,
    pub total: usize,
}

/// Registry of port allocations across all projects
pub struct PortRegistry {
    inner: Mutex<PortsDoc>,
    path: PathBuf,
    quarantine: Duration,
    bind_probe: bool,
}

impl PortRegistry {
    /// Open the registry backed by `path`, loading any persisted table
    pub fn open(path: PathBuf, quarantine_secs: u64) -> Result<Self> {
        Self::with_settings(path, Duration::from_secs(quarantine_secs), true)
    }

    /// Open with explicit quarantine and bind-probe settings
    pub fn with_settings(path: PathBuf, quarantine: Duration, bind_probe: bool) -> Result<Self> {
        let doc: PortsDoc = store::read(&path)?;
        Ok(Self {
            inner: Mutex::new(doc),
            path,
            quarantine,
            bind_probe,
        })
    }

    /// Allocate a port for a project within its tech's range.
    ///
    /// A preferred port inside the range that is held (by the registry or by
    /// an external socket) is an explicit `PortConflict`; the caller decides
    /// whether to retry with the range default. A preferred port outside the
    /// range is ignored. Without a usable preference, the lowest free port
    /// in the range wins.
    pub fn allocate(
        &self,
        project_id: &str,
        tech: &str,
        range: PortRange,
        preferred: Option<u16>,
    ) -> Result<u16> {
        let mut doc = self.inner.lock().expect("port registry lock poisoned");
        self.promote_expired(&mut doc);

        if let Some(port) = preferred {
            if range.contains(port) {
                if self.held(&doc, port) {
                    return Err(CoreError::PortConflict {
                        port,
                        detail: "already allocated".to_string(),
                    });
                }
                if !self.bindable(port) {
                    return Err(CoreError::PortConflict {
                        port,
                        detail: "held by another process".to_string(),
                    });
                }
                self.take(&mut doc, port, project_id, tech)?;
                return Ok(port);
            }
            tracing::debug!(
                port,
                tech,
                "preferred port outside the tech range, picking lowest free"
            );
        }

        for port in range.iter() {
            if self.held(&doc, port) || !self.bindable(port) {
                continue;
            }
            self.take(&mut doc, port, project_id, tech)?;
            return Ok(port);
        }

        Err(CoreError::NoPortAvailable {
            tech: tech.to_string(),
        })
    }

    /// Release a port into the recycling quarantine. Unknown or already
    /// released ports are a no-op.
    pub fn release(&self, port: u16) -> Result<()> {
        let mut doc = self.inner.lock().expect("port registry lock poisoned");
        let Some(alloc) = doc.allocations.get_mut(&port) else {
            return Ok(());
        };
        if alloc.status != PortStatus::InUse {
            return Ok(());
        }

        alloc.status = PortStatus::Recycling;
        alloc.released_at = Some(Utc::now());
        let (project_id, tech) = (alloc.project_id.clone(), alloc.tech.clone());
        push_history(&mut doc, port, &project_id, &tech, "released");
        self.persist(&doc)
    }

    /// Release every port held by a project; returns the released ports
    pub fn release_for_project(&self, project_id: &str) -> Result<Vec<u16>> {
        let mut doc = self.inner.lock().expect("port registry lock poisoned");
        let now = Utc::now();
        let mut released = Vec::new();

        let ports: Vec<u16> = doc
            .allocations
            .values()
            .filter(|a| a.project_id == project_id && a.status == PortStatus::InUse)
            .map(|a| a.port)
            .collect();

        for port in ports {
            if let Some(alloc) = doc.allocations.get_mut(&port) {
                alloc.status = PortStatus::Recycling;
                alloc.released_at = Some(now);
                let tech = alloc.tech.clone();
                push_history(&mut doc, port, project_id, &tech, "released");
                released.push(port);
            }
        }

        if !released.is_empty() {
            self.persist(&doc)?;
        }
        Ok(released)
    }

    /// Whether the registry considers a port available
    pub fn is_free(&self, port: u16) -> bool {
        let mut doc = self.inner.lock().expect("port registry lock poisoned");
        self.promote_expired(&mut doc);
        !self.held(&doc, port)
    }

    /// Whether a port is recorded as in-use by the given project
    pub fn is_held_by(&self, port: u16, project_id: &str) -> bool {
        let doc = self.inner.lock().expect("port registry lock poisoned");
        doc.allocations
            .get(&port)
            .map(|a| a.status == PortStatus::InUse && a.project_id == project_id)
            .unwrap_or(false)
    }

    /// Occupancy of one tech range
    pub fn usage(&self, range: PortRange) -> PortUsage {
        let mut doc = self.inner.lock().expect("port registry lock poisoned");
        self.promote_expired(&mut doc);

        let allocated = doc
            .allocations
            .values()
            .filter(|a| range.contains(a.port) && a.status != PortStatus::Free)
            .count();
        let total = range.size();

        PortUsage {
            allocated,
            free: total - allocated,
            total,
        }
    }

    /// Copy of the current allocation table
    pub fn snapshot(&self) -> Vec<PortAllocation> {
        let doc = self.inner.lock().expect("port registry lock poisoned");
        doc.allocations.values().cloned().collect()
    }

    /// Newest-first copy of the allocation history tail
    pub fn history(&self) -> Vec<PortEvent> {
        let doc = self.inner.lock().expect("port registry lock poisoned");
        let mut events = doc.history.clone();
        events.reverse();
        events
    }

    fn take(&self, doc: &mut PortsDoc, port: u16, project_id: &str, tech: &str) -> Result<()> {
        doc.allocations.insert(
            port,
            PortAllocation {
                port,
                project_id: project_id.to_string(),
                tech: tech.to_string(),
                allocated_at: Utc::now(),
                released_at: None,
                status: PortStatus::InUse,
            },
        );
        push_history(doc, port, project_id, tech, "allocated");
        self.persist(doc)
    }

    fn held(&self, doc: &PortsDoc, port: u16) -> bool {
        doc.allocations
            .get(&port)
            .map(|a| a.status != PortStatus::Free)
            .unwrap_or(false)
    }

    fn bindable(&self, port: u16) -> bool {
        if !self.bind_probe {
            return true;
        }
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Flip recycling entries whose quarantine has elapsed to free.
    /// Promotion happens lazily on the next observation; there is no reaper.
    fn promote_expired(&self, doc: &mut PortsDoc) {
        let now = Utc::now();
        let quarantine =
            chrono::Duration::from_std(self.quarantine).unwrap_or(chrono::Duration::zero());
        for alloc in doc.allocations.values_mut() {
            if alloc.status != PortStatus::Recycling {
                continue;
            }
            if let Some(released) = alloc.released_at {
                if released + quarantine <= now {
                    alloc.status = PortStatus::Free;
                }
            }
        }
    }

    fn persist(&self, doc: &PortsDoc) -> Result<()> {
        store::write(&self.path, doc)
    }
}

fn push_history(doc: &mut PortsDoc, port: u16, project_id: &str, tech: &str, action: &str) {
    doc.history.push(PortEvent {
        port,
        project_id: project_id.to_string(),
        tech: tech.to_string(),
        action: action.to_string(),
        at: Utc::now(),
    });
    if doc.history.len() > HISTORY_CAP {
        let excess = doc.history.len() - HISTORY_CAP;
        doc.history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(quarantine: Duration) -> (tempfile::TempDir, PortRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ports.json");
        let reg = PortRegistry::with_settings(path, quarantine, false).unwrap();
        (tmp, reg)
    }

    fn small_range() -> PortRange {
        PortRange::new(3000, 3004, Some(3000))
    }

    #[test]
    fn test_allocate_preferred_when_free() {
        let (_tmp, reg) = registry(Duration::ZERO);
        let port = reg
            .allocate("p-1", "nodejs", small_range(), Some(3002))
            .unwrap();
        assert_eq!(port, 3002);
        assert!(!reg.is_free(3002));
    }

    #[test]
    fn test_allocate_lowest_without_preference() {
        let (_tmp, reg) = registry(Duration::ZERO);
        assert_eq!(
            reg.allocate("p-1", "nodejs", small_range(), None).unwrap(),
            3000
        );
        assert_eq!(
            reg.allocate("p-2", "nodejs", small_range(), None).unwrap(),
            3001
        );
    }

    #[test]
    fn test_preferred_held_is_conflict_not_substitution() {
        let (_tmp, reg) = registry(Duration::ZERO);
        reg.allocate("p-1", "nodejs", small_range(), Some(3000))
            .unwrap();

        let err = reg
            .allocate("p-2", "nodejs", small_range(), Some(3000))
            .unwrap_err();
        assert!(matches!(err, CoreError::PortConflict { port: 3000, .. }));
        // The conflicting request allocated nothing
        assert!(reg.is_free(3001));
    }

    #[test]
    fn test_preferred_outside_range_falls_back_to_lowest() {
        let (_tmp, reg) = registry(Duration::ZERO);
        let port = reg
            .allocate("p-1", "nodejs", small_range(), Some(9000))
            .unwrap();
        assert_eq!(port, 3000);
    }

    #[test]
    fn test_range_exhaustion() {
        let (_tmp, reg) = registry(Duration::from_secs(30));
        let range = PortRange::new(3000, 3001, Some(3000));

        reg.allocate("p-1", "nodejs", range, None).unwrap();
        // Exactly one port left: it is returned
        assert_eq!(reg.allocate("p-2", "nodejs", range, None).unwrap(), 3001);
        // The next allocation in the same range fails
        let err = reg.allocate("p-3", "nodejs", range, None).unwrap_err();
        assert!(matches!(err, CoreError::NoPortAvailable { .. }));
    }

    #[test]
    fn test_release_quarantines_before_reuse() {
        let (_tmp, reg) = registry(Duration::from_secs(30));
        let range = PortRange::new(3000, 3000, Some(3000));

        // An end == start range holds a single port
        reg.allocate("p-1", "nodejs", range, None).unwrap();
        reg.release(3000).unwrap();

        // Still quarantined
        assert!(!reg.is_free(3000));
        let err = reg.allocate("p-2", "nodejs", range, None).unwrap_err();
        assert!(matches!(err, CoreError::NoPortAvailable { .. }));
    }

    #[test]
    fn test_zero_quarantine_recycles_immediately() {
        let (_tmp, reg) = registry(Duration::ZERO);
        reg.allocate("p-1", "nodejs", small_range(), Some(3000))
            .unwrap();
        reg.release(3000).unwrap();

        assert!(reg.is_free(3000));
        let port = reg
            .allocate("p-2", "nodejs", small_range(), Some(3000))
            .unwrap();
        assert_eq!(port, 3000);
    }

    #[test]
    fn test_release_unknown_port_is_noop() {
        let (_tmp, reg) = registry(Duration::ZERO);
        reg.release(4321).unwrap();
    }

    #[test]
    fn test_release_for_project() {
        let (_tmp, reg) = registry(Duration::ZERO);
        reg.allocate("p-1", "nodejs", small_range(), Some(3000))
            .unwrap();
        reg.allocate("p-1", "nodejs", small_range(), Some(3001))
            .unwrap();
        reg.allocate("p-2", "nodejs", small_range(), Some(3002))
            .unwrap();

        let mut released = reg.release_for_project("p-1").unwrap();
        released.sort_unstable();
        assert_eq!(released, vec![3000, 3001]);
        assert!(!reg.is_free(3002));
    }

    #[test]
    fn test_usage_sums_to_range_size() {
        let (_tmp, reg) = registry(Duration::from_secs(30));
        let range = small_range();
        reg.allocate("p-1", "nodejs", range, None).unwrap();
        reg.allocate("p-2", "nodejs", range, None).unwrap();
        reg.release(3000).unwrap();

        let usage = reg.usage(range);
        assert_eq!(usage.total, 5);
        // One in use plus one still quarantined
        assert_eq!(usage.allocated, 2);
        assert_eq!(usage.free, 3);
        assert_eq!(usage.allocated + usage.free, usage.total);
    }

    #[test]
    fn test_externally_held_preferred_port_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ports.json");
        let reg = PortRegistry::with_settings(path, Duration::ZERO, true).unwrap();

        // Hold a port at the OS level
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let held = listener.local_addr().unwrap().port();
        let range = PortRange::new(held, held, None);

        let err = reg.allocate("p-1", "nodejs", range, Some(held)).unwrap_err();
        assert!(matches!(err, CoreError::PortConflict { .. }));
        assert!(reg.is_free(held), "registry made no allocation");
    }

    #[test]
    fn test_persistence_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ports.json");

        {
            let reg =
                PortRegistry::with_settings(path.clone(), Duration::from_secs(30), false).unwrap();
            reg.allocate("p-1", "nodejs", small_range(), Some(3003))
                .unwrap();
        }

        let reloaded =
            PortRegistry::with_settings(path, Duration::from_secs(30), false).unwrap();
        assert!(!reloaded.is_free(3003));
        assert!(reloaded.is_held_by(3003, "p-1"));
        let history = reloaded.history();
        assert_eq!(history[0].action, "allocated");
    }
}
