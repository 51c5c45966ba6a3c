//! JSON-file backed [`LocationCache`].

use super::{LocationCache, LocationHint, SubnetEntry};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CacheData {
    /// name -> one hint per project
    #[serde(default)]
    locations: BTreeMap<String, Vec<LocationHint>>,
    #[serde(default)]
    zones: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    subnets: Vec<SubnetEntry>,
}

impl CacheData {
    fn upsert(&mut self, name: &str, hint: LocationHint) {
        let hints = self.locations.entry(name.to_string()).or_default();
        match hints.iter_mut().find(|h| h.project == hint.project) {
            Some(existing) => *existing = hint,
            None => hints.push(hint),
        }
    }
}

/// Location cache persisted as one JSON document.
///
/// Without a path it lives only in memory.
pub struct FileCache {
    path: Option<PathBuf>,
    data: RwLock<CacheData>,
    write_lock: Mutex<()>,
}

impl FileCache {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(CacheData::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Open the cache at `path`; an unreadable or corrupt file starts empty
    pub fn open(path: &Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring corrupt cache file {:?}: {}", path, e);
                CacheData::default()
            }),
            Err(_) => CacheData::default(),
        };

        Self {
            path: Some(path.to_path_buf()),
            data: RwLock::new(data),
            write_lock: Mutex::new(()),
        }
    }

    /// Default cache location
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|p| p.join("gcpfind").join("locations.json"))
    }

    /// Apply `f` and write the result. `write_lock` is held from the
    /// mutation until the file is replaced, so files land in mutation order.
    fn update(&self, f: impl FnOnce(&mut CacheData)) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("cache write lock poisoned"))?;

        let snapshot = {
            let mut data = self
                .data
                .write()
                .map_err(|_| anyhow::anyhow!("cache lock poisoned"))?;
            f(&mut data);
            match self.path {
                Some(_) => serde_json::to_string_pretty(&*data)?,
                None => return Ok(()),
            }
        };
        self.persist(&snapshot)
    }

    /// Replace the file with `content`; callers hold `write_lock`
    fn persist(&self, content: &str) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
        std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&CacheData) -> T) -> Option<T> {
        match self.data.read() {
            Ok(data) => Some(f(&data)),
            Err(_) => {
                tracing::warn!("cache lock poisoned, treating as miss");
                None
            }
        }
    }
}

impl LocationCache for FileCache {
    fn get(&self, name: &str) -> Option<LocationHint> {
        self.read(|d| {
            d.locations
                .get(name)
                .and_then(|hints| hints.iter().max_by_key(|h| h.updated_at).cloned())
        })
        .flatten()
    }

    fn get_scoped(&self, name: &str, project: &str) -> Option<LocationHint> {
        self.read(|d| {
            d.locations
                .get(name)
                .and_then(|hints| hints.iter().find(|h| h.project == project).cloned())
        })
        .flatten()
    }

    fn set(&self, name: &str, hint: LocationHint) -> Result<()> {
        self.update(|d| d.upsert(name, hint))
    }

    fn set_batch(&self, hints: HashMap<String, LocationHint>) -> Result<()> {
        self.update(|d| {
            for (name, hint) in hints {
                d.upsert(&name, hint);
            }
        })
    }

    fn zones(&self, project: &str) -> Option<Vec<String>> {
        self.read(|d| d.zones.get(project).cloned())
            .flatten()
            .filter(|z| !z.is_empty())
    }

    fn set_zones(&self, project: &str, zones: Vec<String>) -> Result<()> {
        self.update(|d| {
            d.zones.insert(project.to_string(), zones);
        })
    }

    fn find_subnets_for_ip(&self, ip: IpAddr) -> Vec<SubnetEntry> {
        self.read(|d| d.subnets.iter().filter(|s| s.contains(ip)).cloned().collect())
            .unwrap_or_default()
    }

    fn remember_subnet_batch(&self, entries: Vec<SubnetEntry>) -> Result<()> {
        self.update(|d| {
            for entry in entries {
                match d.subnets.iter_mut().find(|s| s.key() == entry.key()) {
                    Some(existing) => *existing = entry,
                    None => d.subnets.push(entry),
                }
            }
        })
    }
}
