use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Flat key-value store backing the persisted state records.
///
/// Each key maps to a single JSON blob on disk (`<dir>/<key>.json`). Records
/// are loaded once at startup and rewritten in full on every mutation; there
/// are no partial writes and no migration versioning.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open the default store under the platform data directory:
    /// `<data_dir>/aidesk/state/`
    pub fn open_default() -> Result<Self> {
        let dir = dirs::data_dir()
            .context("Could not determine data directory")?
            .join("aidesk")
            .join("state");
        Ok(Self { dir })
    }

    /// Open a store rooted at an explicit directory.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Load the record stored under `key`, or `None` if it has never been
    /// written.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state record {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse state record {}", path.display()))?;
        Ok(Some(value))
    }

    /// Replace the record stored under `key` with a full serialization of
    /// `value`.
    ///
    /// Writes to a temp file and renames it into place so a crash mid-write
    /// leaves the previous blob intact.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory {}", self.dir.display()))?;
        let path = self.record_path(key);
        let contents = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize state record {key}"))?;
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write state record {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace state record {}", path.display()))?;
        Ok(())
    }
}
