//! Crash-safe JSON persistence
//!
//! Documents are written to a temp file and renamed over the target, with the
//! prior content parked at `<path>.bak` until the rename lands. A crash at
//! any step leaves either the old or the new document readable. Callers must
//! serialize writes to the same path; the registries do so with their own
//! locks.

use crate::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Whether a document exists at `path`
pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Read a document, returning the default value when the file is absent.
///
/// A document that fails to parse falls back to the `.bak` sibling if that
/// parses; the backup is then promoted back to the primary path.
pub fn read<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str(&content) {
        Ok(doc) => Ok(doc),
        Err(primary_err) => {
            let bak = sibling(path, ".bak");
            if bak.exists() {
                if let Ok(doc) = std::fs::read_to_string(&bak)
                    .map_err(CoreError::Io)
                    .and_then(|s| serde_json::from_str::<T>(&s).map_err(CoreError::Json))
                {
                    tracing::warn!(
                        path = %path.display(),
                        "document corrupt, restored from backup"
                    );
                    std::fs::rename(&bak, path)?;
                    return Ok(doc);
                }
            }
            Err(CoreError::StoreCorrupted(format!(
                "{}: {}",
                path.display(),
                primary_err
            )))
        }
    }
}

/// Atomically write a document.
///
/// Sequence: serialize, write `<path>.tmp`, rename the existing document to
/// `<path>.bak`, rename the temp file over `path`, drop the backup. Any
/// failure removes the temp file and puts the backup back.
pub fn write<T>(path: &Path, doc: &T) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = sibling(path, ".tmp");
    let bak = sibling(path, ".bak");

    let content = serde_json::to_string_pretty(doc)?;
    std::fs::write(&tmp, &content)?;

    let had_backup = if path.exists() {
        if let Err(e) = std::fs::rename(path, &bak) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        true
    } else {
        false
    };

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        if had_backup {
            let _ = std::fs::rename(&bak, path);
        }
        return Err(e.into());
    }

    if had_backup {
        let _ = std::fs::remove_file(&bak);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        entries: BTreeMap<String, u32>,
    }

    fn doc(pairs: &[(&str, u32)]) -> Doc {
        Doc {
            entries: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    #[test]
    fn test_read_missing_returns_default() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("absent.json");
        let loaded: Doc = read(&path).unwrap();
        assert_eq!(loaded, Doc::default());
    }

    #[test]
    fn test_write_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");

        let original = doc(&[("a", 1), ("b", 2)]);
        write(&path, &original).unwrap();

        let loaded: Doc = read(&path).unwrap();
        assert_eq!(loaded, original);
        // No droppings left behind
        assert!(!sibling(&path, ".tmp").exists());
        assert!(!sibling(&path, ".bak").exists());
    }

    #[test]
    fn test_rewrite_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");

        write(&path, &doc(&[("a", 1)])).unwrap();
        let first = std::fs::read(&path).unwrap();

        let loaded: Doc = read(&path).unwrap();
        write(&path, &loaded).unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");

        write(&path, &doc(&[("a", 1)])).unwrap();
        write(&path, &doc(&[("a", 2)])).unwrap();

        let loaded: Doc = read(&path).unwrap();
        assert_eq!(loaded.entries["a"], 2);
    }

    #[test]
    fn test_stale_tmp_does_not_shadow_primary() {
        // Simulates a crash after the temp file was written but before any
        // rename: the prior document must still load.
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");

        write(&path, &doc(&[("kept", 1)])).unwrap();
        std::fs::write(sibling(&path, ".tmp"), "{\"entries\":{\"lost\":9}}").unwrap();

        let loaded: Doc = read(&path).unwrap();
        assert_eq!(loaded, doc(&[("kept", 1)]));
    }

    #[test]
    fn test_corrupt_primary_restores_from_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");

        let good = doc(&[("a", 1)]);
        let serialized = serde_json::to_string_pretty(&good).unwrap();
        std::fs::write(sibling(&path, ".bak"), serialized).unwrap();
        std::fs::write(&path, "not json {{{").unwrap();

        let loaded: Doc = read(&path).unwrap();
        assert_eq!(loaded, good);
        // Backup was promoted back to the primary path
        assert!(!sibling(&path, ".bak").exists());
        let reread: Doc = read(&path).unwrap();
        assert_eq!(reread, good);
    }

    #[test]
    fn test_corrupt_primary_without_backup_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");
        std::fs::write(&path, "not json").unwrap();

        let result: Result<Doc> = read(&path);
        assert!(matches!(result, Err(CoreError::StoreCorrupted(_))));
    }

    #[test]
    fn test_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");
        assert!(!exists(&path));
        write(&path, &Doc::default()).unwrap();
        assert!(exists(&path));
    }
}
