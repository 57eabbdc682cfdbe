//! Locked, atomically-written JSON state files
//!
//! Every state file is accessed under an advisory lock on a sibling
//! `.lock` file and written atomically: temp sibling, fsync, rename over
//! the target. Readers therefore see either the old or the new complete
//! document, never a partial write. A file that fails to parse is
//! quarantined (renamed with a `.corrupt` suffix) and reinitialized empty
//! rather than wedging the service.

use fslock::LockFile;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::StateError;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// One JSON document on disk with locking and atomic-write discipline
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            lock_timeout: Duration::from_secs(5),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the advisory lock, retrying until the timeout
    fn lock(&self) -> Result<LockFile, StateError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::Io {
                path: self.lock_path.clone(),
                source: e,
            })?;
        }

        let lock_err = |e: fslock::Error| StateError::Io {
            path: self.lock_path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        };

        let mut lock = LockFile::open(&self.lock_path).map_err(lock_err)?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match lock.try_lock() {
                Ok(true) => return Ok(lock),
                Ok(false) => {
                    if Instant::now() >= deadline {
                        return Err(StateError::LockTimeout {
                            path: self.path.clone(),
                            timeout_secs: self.lock_timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(lock_err(e)),
            }
        }
    }

    /// Read the document; a missing file yields the default value
    pub fn read<T: DeserializeOwned + Default>(&self) -> Result<T, StateError> {
        let _lock = self.lock()?;
        self.read_locked()
    }

    fn read_locked<T: DeserializeOwned + Default>(&self) -> Result<T, StateError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        if contents.trim().is_empty() {
            return Ok(T::default());
        }

        match serde_json::from_str(&contents) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.quarantine(&e.to_string());
                Ok(T::default())
            }
        }
    }

    /// Write the document atomically: temp sibling, fsync, rename
    pub fn write<T: Serialize>(&self, value: &T) -> Result<(), StateError> {
        let _lock = self.lock()?;
        self.write_locked(value)
    }

    fn write_locked<T: Serialize>(&self, value: &T) -> Result<(), StateError> {
        let io_err = |e: std::io::Error| StateError::Io {
            path: self.path.clone(),
            source: e,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(value).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            reason: format!("serialization failed: {e}"),
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut tmp = fs::File::create(&tmp_path).map_err(io_err)?;
            tmp.write_all(json.as_bytes()).map_err(io_err)?;
            tmp.sync_all().map_err(io_err)?;
        }

        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        debug!("Wrote {}", self.path.display());
        Ok(())
    }

    /// Read-modify-write under a single lock acquisition
    pub fn update<T, F>(&self, mutate: F) -> Result<T, StateError>
    where
        T: DeserializeOwned + Default + Serialize,
        F: FnOnce(&mut T),
    {
        let _lock = self.lock()?;
        let mut value: T = self.read_locked()?;
        mutate(&mut value);
        self.write_locked(&value)?;
        Ok(value)
    }

    /// Move an unparseable file aside and log loudly
    fn quarantine(&self, reason: &str) {
        let mut corrupt_name = self.path.file_name().unwrap_or_default().to_os_string();
        corrupt_name.push(".corrupt");
        let corrupt_path = self.path.with_file_name(corrupt_name);

        error!(
            "Corrupt state file {} ({reason}); quarantining to {} and reinitializing empty",
            self.path.display(),
            corrupt_path.display()
        );

        if let Err(e) = fs::rename(&self.path, &corrupt_path) {
            error!("Failed to quarantine {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_reads_default() {
        let dir = tempdir().unwrap();
        let file = JsonStateFile::new(dir.path().join("nothing.json"));
        let map: BTreeMap<String, i64> = file.read().unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let file = JsonStateFile::new(dir.path().join("data.json"));

        let mut map = BTreeMap::new();
        map.insert("ABCD".to_string(), 875i64);
        file.write(&map).unwrap();

        let loaded: BTreeMap<String, i64> = file.read().unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = tempdir().unwrap();
        let file = JsonStateFile::new(dir.path().join("data.json"));
        file.write(&vec![1, 2, 3]).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "found {leftovers:?}");
    }

    #[test]
    fn test_corrupt_file_quarantined_and_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, "{not json at all").unwrap();

        let file = JsonStateFile::new(&path);
        let map: BTreeMap<String, i64> = file.read().unwrap();
        assert!(map.is_empty());
        assert!(dir.path().join("data.json.corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_update_read_modify_write() {
        let dir = tempdir().unwrap();
        let file = JsonStateFile::new(dir.path().join("counter.json"));

        file.write(&BTreeMap::from([("n".to_string(), 1i64)])).unwrap();
        file.update(|m: &mut BTreeMap<String, i64>| {
            *m.entry("n".to_string()).or_insert(0) += 1;
        })
        .unwrap();

        let loaded: BTreeMap<String, i64> = file.read().unwrap();
        assert_eq!(loaded["n"], 2);
    }

    #[test]
    fn test_empty_file_reads_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.json");
        fs::write(&path, "  \n").unwrap();

        let file = JsonStateFile::new(&path);
        let v: Vec<i64> = file.read().unwrap();
        assert!(v.is_empty());
    }
}
