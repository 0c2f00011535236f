//! Per-instance metadata kept on disk so that instances can be listed,
//! found by name, and cleaned up after their supervisor is gone.

use crate::error::ControlError;
use crate::watch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

const METADATA_SUFFIX: &str = "json";

/// What the launcher records about an instance once its endpoint is bound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    #[serde(default)]
    pub name: Option<String>,
    pub cpus: u32,
    /// Guest memory in megabytes.
    pub memory: u64,
    pub kernel: String,
    /// Host-facing description of the devices with host resources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub driver: String,
    pub info: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub pid: i32,
    pub alive: bool,
    #[serde(flatten)]
    pub metadata: InstanceMetadata,
}

/// Storage for per-instance metadata, keyed by supervisor pid.
pub trait InstanceRegistry {
    fn add(&self, pid: i32, metadata: &InstanceMetadata) -> Result<(), ControlError>;
    fn remove(&self, pid: i32) -> Result<(), ControlError>;

    /// Arrange for the entry of `pid` to disappear once the calling process
    /// exits. Stores without on-disk state need not do anything.
    fn remove_on_exit(&self, _pid: i32) -> Result<(), ControlError> {
        Ok(())
    }
}

/// One `<pid>.json` file per instance.
#[derive(Debug, Clone)]
pub struct DirRegistry {
    root: PathBuf,
}

impl DirRegistry {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, pid: i32) -> PathBuf {
        self.root.join(format!("{}.{}", pid, METADATA_SUFFIX))
    }

    /// Scratch directory owned by the instance, removed with its entry.
    pub fn instance_dir(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// All registered instances, ordered by pid.
    pub fn list(&self) -> Result<Vec<InstanceInfo>, ControlError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut instances = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(METADATA_SUFFIX) {
                continue;
            }
            let Some(pid) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };

            let content = std::fs::read_to_string(&path)?;
            let metadata: InstanceMetadata = match serde_json::from_str(&content) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable instance entry");
                    continue;
                }
            };

            instances.push(InstanceInfo {
                pid,
                alive: is_alive(pid),
                metadata,
            });
        }

        instances.sort_by_key(|info| info.pid);
        Ok(instances)
    }

    /// Look an instance up by its declared name.
    pub fn find_by_name(&self, name: &str) -> Result<Option<InstanceInfo>, ControlError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|info| info.metadata.name.as_deref() == Some(name)))
    }

    /// Drop entries whose supervisor is gone. Returns the removed pids.
    pub fn clean(&self) -> Result<Vec<i32>, ControlError> {
        let mut removed = Vec::new();
        for info in self.list()? {
            if !info.alive {
                self.remove(info.pid)?;
                removed.push(info.pid);
            }
        }
        Ok(removed)
    }
}

impl InstanceRegistry for DirRegistry {
    fn add(&self, pid: i32, metadata: &InstanceMetadata) -> Result<(), ControlError> {
        std::fs::create_dir_all(&self.root)?;
        let json = serde_json::to_string_pretty(metadata)?;
        std::fs::write(self.entry_path(pid), json)?;
        tracing::debug!(pid, name = ?metadata.name, "Registered instance");
        Ok(())
    }

    fn remove(&self, pid: i32) -> Result<(), ControlError> {
        match std::fs::remove_dir_all(self.instance_dir(pid)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match std::fs::remove_file(self.entry_path(pid)) {
            Ok(()) => {
                tracing::debug!(pid, "Removed instance entry");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_on_exit(&self, pid: i32) -> Result<(), ControlError> {
        watch::remove_on_exit(&[
            self.entry_path(pid).as_path(),
            self.instance_dir(pid).as_path(),
        ])
    }
}

fn is_alive(pid: i32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
