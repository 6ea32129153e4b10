//! Workspace scanner and tech detection
//!
//! Inspects the top level of a workspace directory (no recursion) against a
//! declarative pattern table and returns ranked tech detections with the
//! evidence that produced them. Package manifests boost framework scores via
//! their declared dependency names.

use crate::{CoreError, Result};
use debughost_config::{PortRange, StacksConfig, TECH_UNKNOWN};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Match weights relative to a tech's base weight
const FILE_FRACTION: f64 = 1.0;
const DIR_FRACTION: f64 = 0.5;
const EXTENSION_FRACTION: f64 = 0.3;
const DEPENDENCY_FRACTION: f64 = 1.0;

const MAX_CONFIDENCE: f64 = 100.0;

struct TechPattern {
    tech: &'static str,
    weight: f64,
    files: &'static [&'static str],
    dirs: &'static [&'static str],
    extensions: &'static [&'static str],
    dependencies: &'static [&'static str],
}

static PATTERNS: &[TechPattern] = &[
    TechPattern {
        tech: "nodejs",
        weight: 30.0,
        files: &["package.json", "package-lock.json", "yarn.lock", "pnpm-lock.yaml"],
        dirs: &["node_modules"],
        extensions: &[".js", ".mjs", ".cjs", ".ts"],
        dependencies: &["express", "koa", "fastify", "hapi"],
    },
    TechPattern {
        tech: "react",
        weight: 40.0,
        files: &[],
        dirs: &[],
        extensions: &[".jsx", ".tsx"],
        dependencies: &["react", "react-dom", "next"],
    },
    TechPattern {
        tech: "vue",
        weight: 40.0,
        files: &["vue.config.js"],
        dirs: &[],
        extensions: &[".vue"],
        dependencies: &["vue", "nuxt"],
    },
    TechPattern {
        tech: "angular",
        weight: 40.0,
        files: &["angular.json"],
        dirs: &[],
        extensions: &[],
        dependencies: &["@angular/core", "@angular/cli"],
    },
    TechPattern {
        tech: "python",
        weight: 35.0,
        files: &["requirements.txt", "pyproject.toml", "setup.py", "Pipfile", "manage.py"],
        dirs: &["venv", ".venv", "__pycache__"],
        extensions: &[".py"],
        dependencies: &[],
    },
    TechPattern {
        tech: "php",
        weight: 35.0,
        files: &["composer.json", "index.php"],
        dirs: &["vendor"],
        extensions: &[".php"],
        dependencies: &[],
    },
    TechPattern {
        tech: "static",
        weight: 20.0,
        files: &["index.html"],
        dirs: &[],
        extensions: &[".html", ".css"],
        dependencies: &[],
    },
    TechPattern {
        tech: "docker",
        weight: 25.0,
        files: &["Dockerfile", "docker-compose.yml", "compose.yaml"],
        dirs: &[],
        extensions: &[],
        dependencies: &[],
    },
];

/// One ranked detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechDetection {
    pub tech: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

/// Manifest metadata pulled from package.json / pyproject.toml
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkspaceMetadata {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
}

/// Result of scanning one workspace directory
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub technologies: Vec<TechDetection>,
    pub metadata: WorkspaceMetadata,
    pub primary_tech: String,
    pub port_recommendation: PortRange,
}

/// Scans workspace directories against the tech pattern table
pub struct WorkspaceScanner {
    stacks: StacksConfig,
}

impl WorkspaceScanner {
    pub fn new(stacks: StacksConfig) -> Self {
        Self { stacks }
    }

    /// Scan one workspace directory
    pub fn scan(&self, path: &Path) -> Result<ScanResult> {
        if !path.is_absolute() {
            return Err(CoreError::InvalidWorkspace(format!(
                "{} is not an absolute path",
                path.display()
            )));
        }
        if !path.exists() {
            return Err(CoreError::InvalidWorkspace(format!(
                "{} does not exist",
                path.display()
            )));
        }
        if !path.is_dir() {
            return Err(CoreError::InvalidWorkspace(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        let entries = std::fs::read_dir(path).map_err(|e| {
            CoreError::InvalidWorkspace(format!("{} is not readable: {}", path.display(), e))
        })?;

        let mut files = HashSet::new();
        let mut dirs = HashSet::new();
        let mut extension_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                dirs.insert(name);
            } else {
                if let Some(idx) = name.rfind('.') {
                    if idx > 0 {
                        *extension_counts
                            .entry(name[idx..].to_lowercase())
                            .or_default() += 1;
                    }
                }
                files.insert(name);
            }
        }

        let (metadata, dependencies) = read_manifests(path, &files);

        let mut technologies = Vec::new();
        for pattern in PATTERNS {
            let mut confidence = 0.0;
            let mut evidence = Vec::new();

            for file in pattern.files {
                if files.contains(*file) {
                    confidence += pattern.weight * FILE_FRACTION;
                    evidence.push(format!("file:{}", file));
                }
            }
            for dir in pattern.dirs {
                if dirs.contains(*dir) {
                    confidence += pattern.weight * DIR_FRACTION;
                    evidence.push(format!("directory:{}", dir));
                }
            }
            for ext in pattern.extensions {
                if let Some(count) = extension_counts.get(*ext) {
                    confidence += pattern.weight * EXTENSION_FRACTION;
                    evidence.push(format!("extension:{} ({} files)", ext, count));
                }
            }
            for dep in pattern.dependencies {
                if dependencies.contains(*dep) {
                    confidence += pattern.weight * DEPENDENCY_FRACTION;
                    evidence.push(format!("dependency:{}", dep));
                }
            }

            if confidence > 0.0 {
                technologies.push(TechDetection {
                    tech: pattern.tech.to_string(),
                    confidence: confidence.min(MAX_CONFIDENCE),
                    evidence,
                });
            }
        }

        technologies.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tech.cmp(&b.tech))
        });

        let primary_tech = technologies
            .first()
            .map(|t| t.tech.clone())
            .unwrap_or_else(|| TECH_UNKNOWN.to_string());
        let port_recommendation = self.stacks.range_for(&primary_tech);

        Ok(ScanResult {
            technologies,
            metadata,
            primary_tech,
            port_recommendation,
        })
    }
}

/// Parse package.json / pyproject.toml when present; returns manifest
/// metadata plus the set of declared dependency names
fn read_manifests(path: &Path, files: &HashSet<String>) -> (WorkspaceMetadata, HashSet<String>) {
    let mut metadata = WorkspaceMetadata::default();
    let mut dependencies = HashSet::new();

    if files.contains("package.json") {
        if let Ok(content) = std::fs::read_to_string(path.join("package.json")) {
            if let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&content) {
                metadata.name = manifest
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                metadata.version = manifest
                    .get("version")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                metadata.description = manifest
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(String::from);

                for section in ["dependencies", "devDependencies"] {
                    if let Some(deps) = manifest.get(section).and_then(|v| v.as_object()) {
                        dependencies.extend(deps.keys().cloned());
                    }
                }
            }
        }
    }

    if metadata.name.is_none() && files.contains("pyproject.toml") {
        if let Ok(content) = std::fs::read_to_string(path.join("pyproject.toml")) {
            if let Ok(manifest) = content.parse::<toml::Value>() {
                if let Some(project) = manifest.get("project") {
                    metadata.name = project
                        .get("name")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    metadata.version = project
                        .get("version")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    metadata.description = project
                        .get("description")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                }
            }
        }
    }

    (metadata, dependencies)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> WorkspaceScanner {
        WorkspaceScanner::new(StacksConfig::default())
    }

    #[test]
    fn test_empty_workspace_is_valid_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let result = scanner().scan(tmp.path()).unwrap();

        assert!(result.technologies.is_empty());
        assert_eq!(result.primary_tech, "unknown");
        assert_eq!(
            (result.port_recommendation.start, result.port_recommendation.end),
            (3000, 9999)
        );
    }

    #[test]
    fn test_missing_path_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        let err = scanner().scan(&missing).unwrap_err();
        assert!(matches!(err, CoreError::InvalidWorkspace(_)));
    }

    #[test]
    fn test_file_path_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let err = scanner().scan(&file).unwrap_err();
        assert!(matches!(err, CoreError::InvalidWorkspace(_)));
    }

    #[test]
    fn test_relative_path_is_invalid() {
        let err = scanner().scan(Path::new("some/relative")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidWorkspace(_)));
    }

    #[test]
    fn test_react_dependency_outranks_plain_nodejs() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("package.json"),
            r#"{"name":"webapp","version":"1.0.0","dependencies":{"react":"18"}}"#,
        )
        .unwrap();

        let result = scanner().scan(tmp.path()).unwrap();
        assert_eq!(result.primary_tech, "react");
        assert_eq!(result.metadata.name.as_deref(), Some("webapp"));
        // react shares the nodejs range, defaulting to 3000
        assert_eq!(result.port_recommendation.default_port, Some(3000));

        let react = &result.technologies[0];
        assert!(react.evidence.iter().any(|e| e == "dependency:react"));
        let nodejs = result
            .technologies
            .iter()
            .find(|t| t.tech == "nodejs")
            .unwrap();
        assert!(react.confidence > nodejs.confidence);
    }

    #[test]
    fn test_python_detection_and_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("requirements.txt"), "flask\n").unwrap();
        std::fs::write(
            tmp.path().join("pyproject.toml"),
            "[project]\nname = \"svc\"\nversion = \"0.2.0\"\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("app.py"), "print('hi')\n").unwrap();

        let result = scanner().scan(tmp.path()).unwrap();
        assert_eq!(result.primary_tech, "python");
        assert_eq!(result.metadata.name.as_deref(), Some("svc"));
        assert_eq!(
            (result.port_recommendation.start, result.port_recommendation.end),
            (5000, 5999)
        );

        let python = &result.technologies[0];
        assert!(python
            .evidence
            .iter()
            .any(|e| e.starts_with("extension:.py")));
    }

    #[test]
    fn test_angular_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("angular.json"), "{}").unwrap();
        std::fs::write(
            tmp.path().join("package.json"),
            r#"{"name":"ng-app","dependencies":{"@angular/core":"17"}}"#,
        )
        .unwrap();

        let result = scanner().scan(tmp.path()).unwrap();
        assert_eq!(result.primary_tech, "angular");
        assert_eq!(result.port_recommendation.default_port, Some(4200));
    }

    #[test]
    fn test_confidence_capped_at_100() {
        let tmp = tempfile::tempdir().unwrap();
        for f in [
            "requirements.txt",
            "pyproject.toml",
            "setup.py",
            "Pipfile",
            "manage.py",
        ] {
            std::fs::write(tmp.path().join(f), "").unwrap();
        }

        let result = scanner().scan(tmp.path()).unwrap();
        let python = &result.technologies[0];
        assert_eq!(python.tech, "python");
        assert_eq!(python.confidence, 100.0);
    }

    #[test]
    fn test_static_site() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("index.html"), "<html></html>").unwrap();
        std::fs::write(tmp.path().join("style.css"), "body {}").unwrap();

        let result = scanner().scan(tmp.path()).unwrap();
        assert_eq!(result.primary_tech, "static");
        assert_eq!(
            (result.port_recommendation.start, result.port_recommendation.end),
            (4000, 4999)
        );
    }
}
