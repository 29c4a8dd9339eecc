use std::path::PathBuf;
use std::sync::Arc;

use bridge_platform::environment::HostEnvironment;
use bridge_platform::filesystem::{Backend, FileSystem};
use bridge_platform::runtime::Runtime;

use crate::messenger::Messenger;

/// Where and how `custom-init` mounts the persistent root
#[derive(Debug, Clone)]
pub struct MountSettings {
    pub mount_point: String,
    /// Directory backing the mount in native environments
    pub native_root: PathBuf,
    /// Store file backing the mount in browser environments
    pub store_path: PathBuf,
}

impl MountSettings {
    pub fn backend_for(&self, environment: HostEnvironment) -> Backend {
        if environment.is_native() {
            Backend::LocalDir {
                root: self.native_root.clone(),
            }
        } else {
            Backend::Persistent {
                store: self.store_path.clone(),
            }
        }
    }
}

/// Everything a command handler may touch, built once at startup
pub struct WorkerContext {
    pub runtime: Arc<dyn Runtime>,
    pub fs: Arc<dyn FileSystem>,
    pub messenger: Messenger,
    pub environment: HostEnvironment,
    pub mount: MountSettings,
}
