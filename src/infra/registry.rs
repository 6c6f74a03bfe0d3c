//! Instance registry
//!
//! Hands out numbered instance slots and tracks who owns them. Only
//! bookkeeping lives here; tearing down OS resources is the cleaner's job.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::common::config::InstanceConfig;
use crate::common::{Error, Result};

use super::instance::{self, InstanceRecord, PortSet, ResourceKind};
use super::process::{ProcessLiveness, SystemLiveness};
use super::store::{FileStateStore, StateStore};

/// A record together with its staleness
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    #[serde(flatten)]
    pub record: InstanceRecord,
    pub stale: bool,
}

pub struct InstanceRegistry {
    store: Arc<dyn StateStore>,
    liveness: Arc<dyn ProcessLiveness>,
    config: InstanceConfig,
}

impl InstanceRegistry {
    pub fn new(
        store: Arc<dyn StateStore>,
        liveness: Arc<dyn ProcessLiveness>,
        config: InstanceConfig,
    ) -> Self {
        Self {
            store,
            liveness,
            config,
        }
    }

    /// File-backed registry with real process checks
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self::new(
            Arc::new(FileStateStore::new(&config.state_dir())),
            Arc::new(SystemLiveness),
            config.clone(),
        )
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn max_instances(&self) -> u32 {
        self.config.max_instances
    }

    /// Ports for instance `id`
    pub fn ports(&self, id: i64) -> Result<PortSet> {
        instance::ports_for(id, self.config.max_instances)
    }

    /// Deterministic name of one resource of instance `id`
    pub fn resource_name(&self, id: i64, kind: ResourceKind) -> Result<String> {
        let id = instance::check_instance_id(id, self.config.max_instances)?;
        instance::resource_name(&self.config.prefix, id, kind)
    }

    /// Whether a record no longer belongs to a live owner
    ///
    /// Liveness that cannot be determined does not make a record stale.
    pub fn is_stale(&self, record: &InstanceRecord) -> bool {
        if self.liveness.is_alive(record.owner_pid) == Some(false) {
            return true;
        }
        let age = Utc::now().signed_duration_since(record.started_at);
        age.to_std().is_ok_and(|age| age > self.config.stale_timeout())
    }

    /// Claim the lowest free slot for the current process
    ///
    /// A slot held by a stale record counts as free and is taken over.
    pub fn acquire(&self) -> Result<InstanceRecord> {
        self.acquire_for(std::process::id())
    }

    pub fn acquire_for(&self, owner_pid: u32) -> Result<InstanceRecord> {
        let max = self.config.max_instances;
        let mut acquired = None;
        self.store.update(&mut |records| {
            records.retain(|r| r.id < max);
            let id = (0..max)
                .find(|id| {
                    records
                        .iter()
                        .find(|r| r.id == *id)
                        .is_none_or(|r| self.is_stale(r))
                })
                .ok_or(Error::NoInstanceAvailable { max })?;

            records.retain(|r| r.id != id);
            let record = InstanceRecord {
                id,
                ports: instance::ports_for(i64::from(id), max)?,
                owner_pid,
                started_at: Utc::now(),
            };
            records.push(record.clone());
            acquired = Some(record);
            Ok(())
        })?;

        let record = acquired.ok_or_else(|| Error::Internal("acquire produced no record".into()))?;
        tracing::info!(instance = record.id, pid = owner_pid, "Acquired instance");
        Ok(record)
    }

    /// Drop the record for `id`; returns whether one existed
    pub fn release(&self, id: i64) -> Result<bool> {
        let id = instance::check_instance_id(id, self.config.max_instances)?;
        let mut removed = false;
        self.store.update(&mut |records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            removed = records.len() != before;
            Ok(())
        })?;
        if removed {
            tracing::info!(instance = id, "Released instance");
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<InstanceStatus>> {
        Ok(self
            .store
            .load()?
            .into_iter()
            .map(|record| InstanceStatus {
                stale: self.is_stale(&record),
                record,
            })
            .collect())
    }

    /// `max_instances` minus active, non-stale instances
    pub fn available_count(&self) -> Result<u32> {
        let active = self
            .store
            .load()?
            .iter()
            .filter(|r| r.id < self.config.max_instances && !self.is_stale(r))
            .count() as u32;
        Ok(self.config.max_instances.saturating_sub(active))
    }

    /// Remove stale records; returns their ids
    pub fn clean_stale(&self) -> Result<Vec<u32>> {
        let mut cleaned = Vec::new();
        self.store.update(&mut |records| {
            cleaned = records
                .iter()
                .filter(|r| self.is_stale(r))
                .map(|r| r.id)
                .collect();
            records.retain(|r| !cleaned.contains(&r.id));
            Ok(())
        })?;
        if !cleaned.is_empty() {
            tracing::info!(instances = ?cleaned, "Removed stale instance records");
        }
        Ok(cleaned)
    }

    /// Remove every record; returns how many there were
    pub fn clear(&self) -> Result<usize> {
        let mut count = 0;
        self.store.update(&mut |records| {
            count = records.len();
            records.clear();
            Ok(())
        })?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::store::MemoryStateStore;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Liveness answers configured per pid; unknown pids are alive
    #[derive(Default)]
    struct FakeLiveness {
        answers: Mutex<HashMap<u32, Option<bool>>>,
    }

    impl FakeLiveness {
        fn set(&self, pid: u32, answer: Option<bool>) {
            self.answers.lock().insert(pid, answer);
        }
    }

    impl ProcessLiveness for FakeLiveness {
        fn is_alive(&self, pid: u32) -> Option<bool> {
            self.answers.lock().get(&pid).copied().unwrap_or(Some(true))
        }
    }

    fn registry(max: u32) -> (InstanceRegistry, Arc<FakeLiveness>) {
        let liveness = Arc::new(FakeLiveness::default());
        let config = InstanceConfig {
            max_instances: max,
            ..Default::default()
        };
        let registry = InstanceRegistry::new(
            Arc::new(MemoryStateStore::new()),
            liveness.clone(),
            config,
        );
        (registry, liveness)
    }

    #[test]
    fn test_acquire_lowest_free_until_exhausted() {
        let (registry, _) = registry(3);
        let ids: Vec<u32> = (0..3).map(|_| registry.acquire_for(100).unwrap().id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(registry.available_count().unwrap(), 0);
        assert!(matches!(
            registry.acquire_for(100),
            Err(Error::NoInstanceAvailable { max: 3 })
        ));

        assert!(registry.release(1).unwrap());
        assert!(!registry.release(1).unwrap());
        assert_eq!(registry.acquire_for(100).unwrap().id, 1);
    }

    #[test]
    fn test_acquired_record_has_ports() {
        let (registry, _) = registry(5);
        let record = registry.acquire_for(7).unwrap();
        assert_eq!(record.ports, registry.ports(0).unwrap());
        assert_eq!(record.owner_pid, 7);
        assert_eq!(
            registry.resource_name(0, ResourceKind::Db).unwrap(),
            "agent-eval-0-db"
        );
        assert!(registry.release(9).is_err());
    }

    #[test]
    fn test_dead_owner_is_stale_and_reclaimed() {
        let (registry, liveness) = registry(2);
        registry.acquire_for(10).unwrap();
        registry.acquire_for(11).unwrap();
        liveness.set(10, Some(false));

        assert_eq!(registry.available_count().unwrap(), 1);
        let stale: Vec<bool> = registry.list().unwrap().iter().map(|s| s.stale).collect();
        assert_eq!(stale, vec![true, false]);

        let record = registry.acquire_for(12).unwrap();
        assert_eq!(record.id, 0);
        assert_eq!(record.owner_pid, 12);
    }

    #[test]
    fn test_unknown_liveness_is_not_stale() {
        let (registry, liveness) = registry(2);
        registry.acquire_for(20).unwrap();
        liveness.set(20, None);
        assert!(registry.clean_stale().unwrap().is_empty());
        assert_eq!(registry.available_count().unwrap(), 1);
    }

    #[test]
    fn test_old_record_is_stale() {
        let liveness = Arc::new(FakeLiveness::default());
        let store = Arc::new(MemoryStateStore::new());
        let registry = InstanceRegistry::new(
            store.clone(),
            liveness,
            InstanceConfig {
                stale_timeout_secs: 60,
                ..Default::default()
            },
        );
        store
            .update(&mut |records| {
                records.push(InstanceRecord {
                    id: 2,
                    ports: instance::ports_for(2, 5)?,
                    owner_pid: 1,
                    started_at: Utc::now() - chrono::Duration::seconds(120),
                });
                Ok(())
            })
            .unwrap();

        assert_eq!(registry.clean_stale().unwrap(), vec![2]);
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_clean_stale_keeps_live_records() {
        let (registry, liveness) = registry(3);
        for pid in [1, 2, 3] {
            registry.acquire_for(pid).unwrap();
        }
        liveness.set(2, Some(false));
        assert_eq!(registry.clean_stale().unwrap(), vec![1]);
        assert_eq!(registry.list().unwrap().len(), 2);
        assert_eq!(registry.clear().unwrap(), 2);
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_file_backed_registries_share_state() {
        let dir = TempDir::new().unwrap();
        let config = InstanceConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let a = InstanceRegistry::from_config(&config);
        let b = InstanceRegistry::from_config(&config);

        let first = a.acquire().unwrap();
        let second = b.acquire().unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(a.list().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_acquire_never_duplicates() {
        let dir = TempDir::new().unwrap();
        let config = InstanceConfig {
            state_dir: Some(dir.path().to_path_buf()),
            max_instances: 8,
            ..Default::default()
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let config = config.clone();
                std::thread::spawn(move || InstanceRegistry::from_config(&config).acquire().unwrap().id)
            })
            .collect();
        let mut ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }
}
