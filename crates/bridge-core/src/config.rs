use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use bridge_platform::environment::HostEnvironment;

use crate::context::MountSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Virtual path the persistent root is mounted at
    #[serde(default = "default_mount_point")]
    pub mount_point: String,

    /// Execution context; decides the mount backend at `custom-init`
    #[serde(default)]
    pub environment: HostEnvironment,

    /// Host directory backing the mount in native environments
    #[serde(default = "default_native_root")]
    pub native_root: PathBuf,

    /// Store file backing the mount in browser environments
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Program run by `callMain`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Capacity of the inbound and outbound message queues
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_mount_point() -> String {
    "/db".to_string()
}
fn default_native_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_store_path() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("org", "vfs-bridge", "worker") {
        dirs.data_dir().join("persist.json")
    } else {
        PathBuf::from("vfs-bridge-store.json")
    }
}
fn default_channel_capacity() -> usize {
    256
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            environment: HostEnvironment::default(),
            native_root: default_native_root(),
            store_path: default_store_path(),
            program: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl WorkerConfig {
    /// Default config file path for this platform
    pub fn default_path() -> PathBuf {
        if let Some(dirs) = directories::ProjectDirs::from("org", "vfs-bridge", "worker") {
            dirs.config_dir().join("config.json")
        } else {
            PathBuf::from("vfs-bridge-config.json")
        }
    }

    /// Load config from a file path
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&data).with_context(|| "failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a file path
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.mount_point.starts_with('/') || self.mount_point == "/" {
            anyhow::bail!(
                "mount point must be an absolute path below the root, got '{}'",
                self.mount_point
            );
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("channel capacity must be at least 1");
        }
        Ok(())
    }

    pub fn mount_settings(&self) -> MountSettings {
        MountSettings {
            mount_point: self.mount_point.clone(),
            native_root: self.native_root.clone(),
            store_path: self.store_path.clone(),
        }
    }
}
