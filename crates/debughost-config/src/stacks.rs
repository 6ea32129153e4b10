//! Per-tech port ranges and container stack templates
//!
//! Every recognized tech label maps to a port range it may allocate from and
//! a container template (image, health probe path, lifecycle timeouts).
//! Framework labels (`react`, `vue`, `angular`) run on the nodejs template;
//! `angular` keeps its own conventional port range.

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Tech label for a workspace with no recognizable stack
pub const TECH_UNKNOWN: &str = "unknown";

/// Wide fallback range used for unrecognized techs
pub const FALLBACK_RANGE: PortRange = PortRange {
    start: 3000,
    end: 9999,
    default_port: None,
};

/// An inclusive range of host ports a tech allocates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    /// Preferred first pick inside the range, if the tech has one
    #[serde(default)]
    pub default_port: Option<u16>,
}

impl PortRange {
    pub fn new(start: u16, end: u16, default_port: Option<u16>) -> Self {
        Self {
            start,
            end,
            default_port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports in the range
    pub fn size(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Container template for one tech stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackTemplate {
    /// Image to run for this stack
    pub image: String,
    /// HTTP path probed for readiness and liveness
    pub probe_path: String,
    /// Ceiling on how long `start` waits for readiness, in seconds
    pub startup_timeout_secs: u64,
    /// Graceful stop window before forced removal, in seconds
    pub stop_grace_secs: u32,
}

/// Port ranges and templates for all recognized techs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StacksConfig {
    pub ranges: HashMap<String, PortRange>,
    pub templates: HashMap<String, StackTemplate>,
}

impl Default for StacksConfig {
    fn default() -> Self {
        let mut ranges = HashMap::new();
        ranges.insert("system".to_string(), PortRange::new(2601, 2699, None));
        ranges.insert("nodejs".to_string(), PortRange::new(3000, 3999, Some(3000)));
        ranges.insert("static".to_string(), PortRange::new(4000, 4999, Some(4000)));
        ranges.insert(
            "angular".to_string(),
            PortRange::new(4200, 4299, Some(4200)),
        );
        ranges.insert("python".to_string(), PortRange::new(5000, 5999, Some(5000)));
        ranges.insert("php".to_string(), PortRange::new(8080, 8980, Some(8080)));

        let mut templates = HashMap::new();
        templates.insert(
            "nodejs".to_string(),
            StackTemplate {
                image: "debughost/node:latest".to_string(),
                probe_path: "/health".to_string(),
                startup_timeout_secs: 30,
                stop_grace_secs: 10,
            },
        );
        templates.insert(
            "python".to_string(),
            StackTemplate {
                image: "debughost/python:latest".to_string(),
                probe_path: "/health".to_string(),
                startup_timeout_secs: 45,
                stop_grace_secs: 15,
            },
        );
        templates.insert(
            "php".to_string(),
            StackTemplate {
                image: "debughost/php:latest".to_string(),
                probe_path: "/health.php".to_string(),
                startup_timeout_secs: 30,
                stop_grace_secs: 10,
            },
        );
        templates.insert(
            "static".to_string(),
            StackTemplate {
                image: "debughost/static:latest".to_string(),
                probe_path: "/".to_string(),
                startup_timeout_secs: 15,
                stop_grace_secs: 5,
            },
        );

        Self { ranges, templates }
    }
}

impl StacksConfig {
    /// Port range for a tech label, falling back to the wide default
    pub fn range_for(&self, tech: &str) -> PortRange {
        self.ranges
            .get(range_key(tech))
            .copied()
            .unwrap_or(FALLBACK_RANGE)
    }

    /// Container template for a tech label, falling back to nodejs
    pub fn template_for(&self, tech: &str) -> Option<&StackTemplate> {
        self.templates
            .get(template_key(tech))
            .or_else(|| self.templates.get("nodejs"))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (tech, range) in &self.ranges {
            if range.start > range.end {
                return Err(ConfigError::Invalid(format!(
                    "port range for '{}' is inverted: {}",
                    tech, range
                )));
            }
            if range.start < 1024 {
                return Err(ConfigError::Invalid(format!(
                    "port range for '{}' starts below 1024",
                    tech
                )));
            }
            if let Some(d) = range.default_port {
                if !range.contains(d) {
                    return Err(ConfigError::Invalid(format!(
                        "default port {} for '{}' lies outside {}",
                        d, tech, range
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Range lookup key for a tech label. Frameworks that serve on the
/// conventional node dev port share the nodejs range; angular keeps its own.
pub fn range_key(tech: &str) -> &str {
    match tech {
        "react" | "vue" => "nodejs",
        other => other,
    }
}

/// Template lookup key for a tech label. All JavaScript-family frameworks
/// run on the nodejs image.
pub fn template_key(tech: &str) -> &str {
    match tech {
        "react" | "vue" | "angular" => "nodejs",
        other => other,
    }
}
