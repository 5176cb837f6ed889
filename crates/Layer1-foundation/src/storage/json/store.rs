//! JSON file store
//!
//! Writes go to a sibling temp file which is synced and renamed over the
//! target, so a concurrent reader sees either the old or the new document.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// JSON artifacts of one directory
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_dir: PathBuf,
}

impl JsonStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Default home (`~/.multi-tasker/`)
    pub fn global() -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| Error::Config("Cannot find home directory".to_string()))?
            .join(".multi-tasker");
        Ok(Self::new(dir))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    /// Load and parse a JSON file
    pub fn load<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        let path = self.file_path(filename);
        let content = fs::read_to_string(&path).map_err(|e| Error::artifact(filename, e))?;
        serde_json::from_str(&content).map_err(|e| Error::artifact(filename, e))
    }

    /// Load, `None` when the file is absent
    pub fn load_optional<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        if !self.file_path(filename).exists() {
            return Ok(None);
        }
        self.load(filename).map(Some)
    }

    /// Save as pretty JSON (temp + rename); the directory must exist
    pub fn save<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(data)?;
        self.write_atomic(filename, &content)
    }

    /// Replace a file's bytes (temp + rename)
    pub fn write_atomic(&self, filename: &str, content: &[u8]) -> Result<()> {
        let path = self.file_path(filename);
        let tmp = self.file_path(&format!(".{}.tmp", filename));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::artifact(filename, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let sample = Sample {
            name: "echo".into(),
            count: 2,
        };

        store.save("sample.json", &sample).unwrap();
        let loaded: Sample = store.load("sample.json").unwrap();

        assert_eq!(loaded, sample);
        assert!(!dir.path().join(".sample.json.tmp").exists());
    }

    #[test]
    fn test_save_does_not_create_directory() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("removed"));
        assert!(store.save("sample.json", &Sample::default()).is_err());
        assert!(!dir.path().join("removed").exists());
    }

    #[test]
    fn test_load_optional_missing() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let loaded: Option<Sample> = store.load_optional("missing.json").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupt_file_names_artifact() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        std::fs::write(store.file_path("stats.json"), "{ not json").unwrap();

        let err = store.load::<Sample>("stats.json").unwrap_err();
        match err {
            Error::Artifact { artifact, .. } => assert_eq!(artifact, "stats.json"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        store.write_atomic("raw", b"first").unwrap();
        store.write_atomic("raw", b"second").unwrap();
        assert_eq!(std::fs::read(store.file_path("raw")).unwrap(), b"second");
    }
}
