//! Durable storage for instance records
//!
//! Every mutation goes through [`StateStore::update`], which holds an
//! exclusive lock for the whole read-modify-write so two processes can never
//! claim the same instance id.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use parking_lot::Mutex;

use crate::common::paths::ensure_dir;
use crate::common::{Error, Result};

use super::instance::InstanceRecord;

pub trait StateStore: Send + Sync {
    /// Current records, ordered by id
    fn load(&self) -> Result<Vec<InstanceRecord>>;

    /// Read-modify-write under an exclusive lock
    ///
    /// Nothing is written when `f` returns an error.
    fn update(&self, f: &mut dyn FnMut(&mut Vec<InstanceRecord>) -> Result<()>) -> Result<()>;
}

/// One JSON file per instance under `<state_dir>/instances/`
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("instances"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("instance-{}.json", id))
    }

    fn lock(&self) -> Result<LockedFile> {
        ensure_dir(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(".lock"))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| Error::StateStore(format!("failed to lock instance registry: {}", e)))?;
        Ok(LockedFile { file })
    }

    fn read_all(&self) -> Result<Vec<InstanceRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("instance-") && n.ends_with(".json"));
            if !is_record {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<InstanceRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Ignoring unreadable instance record: {}", e);
                }
            }
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    fn write_record(&self, record: &InstanceRecord) -> Result<()> {
        let path = self.record_path(record.id);
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(record)?.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Vec<InstanceRecord>> {
        let _lock = self.lock()?;
        self.read_all()
    }

    fn update(&self, f: &mut dyn FnMut(&mut Vec<InstanceRecord>) -> Result<()>) -> Result<()> {
        let _lock = self.lock()?;
        let before = self.read_all()?;
        let mut records = before.clone();
        f(&mut records)?;

        for record in &records {
            if !before.contains(record) {
                self.write_record(record)?;
            }
        }
        for old in &before {
            if !records.iter().any(|r| r.id == old.id) {
                match fs::remove_file(self.record_path(old.id)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

/// Exclusive lock released on drop
struct LockedFile {
    file: File,
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// In-process store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<Vec<InstanceRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self.records.lock().clone())
    }

    fn update(&self, f: &mut dyn FnMut(&mut Vec<InstanceRecord>) -> Result<()>) -> Result<()> {
        let mut guard = self.records.lock();
        let mut records = guard.clone();
        f(&mut records)?;
        records.sort_by_key(|r| r.id);
        *guard = records;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::instance::ports_for;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: u32) -> InstanceRecord {
        InstanceRecord {
            id,
            ports: ports_for(i64::from(id), 5).unwrap(),
            owner_pid: 42,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_file_store_persists_and_removes() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load().unwrap().is_empty());

        store
            .update(&mut |records| {
                records.push(record(1));
                records.push(record(0));
                Ok(())
            })
            .unwrap();
        assert!(store.dir().join("instance-0.json").exists());

        let reopened = FileStateStore::new(dir.path());
        let ids: Vec<u32> = reopened.load().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1]);

        reopened
            .update(&mut |records| {
                records.retain(|r| r.id != 0);
                Ok(())
            })
            .unwrap();
        assert!(!store.dir().join("instance-0.json").exists());
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        let result = store.update(&mut |records| {
            records.push(record(0));
            Err(Error::Internal("abort".into()))
        });
        assert!(result.is_err());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        store
            .update(&mut |records| {
                records.push(record(2));
                Ok(())
            })
            .unwrap();
        fs::write(store.dir().join("instance-3.json"), "{not json").unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::new();
        store
            .update(&mut |records| {
                records.push(record(3));
                records.push(record(1));
                Ok(())
            })
            .unwrap();
        let ids: Vec<u32> = store.load().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
