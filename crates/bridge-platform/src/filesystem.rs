use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("file exists: {0}")]
    AlreadyExists(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("path must be absolute: {0}")]
    RelativePath(String),
    #[error("file is not valid UTF-8: {0}")]
    InvalidUtf8(String),
    #[error("filesystem is not mounted")]
    NotMounted,
    #[error("filesystem already mounted at {0}")]
    AlreadyMounted(String),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("backend I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("backend store is corrupt: {0}")]
    Corrupt(String),
}

/// Storage backend bound to the mount point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Backend {
    /// Mirrors a host directory (native execution contexts)
    LocalDir { root: PathBuf },
    /// Single-file persistent store (browser-style execution contexts)
    Persistent { store: PathBuf },
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::LocalDir { root } => write!(f, "local directory {}", root.display()),
            Backend::Persistent { store } => write!(f, "persistent store {}", store.display()),
        }
    }
}

/// Direction of a flush between the in-memory tree and its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Populate the mounted tree from the backend
    Load,
    /// Persist the mounted tree to the backend
    Save,
}

/// Counters describing what a flush changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub written: usize,
    pub removed: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// File contents keyed by `/`-separated path relative to some directory
pub type Snapshot = BTreeMap<String, Vec<u8>>;

/// Where a name-table entry hangs in the tree.
///
/// `MemFs` removes files only, never a directory with live children, so it
/// always reports `Node`. `Detached` exists for facades whose trees can lose a
/// directory out from under its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentMarker {
    /// Parent is a live directory node; the entry resolves to a path
    Node(NodeId),
    /// Parent is gone; only the last known parent path is remembered
    Detached(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub node: NodeId,
    pub name: String,
    pub parent: ParentMarker,
}

impl NameEntry {
    pub fn is_resolvable(&self) -> bool {
        matches!(self.parent, ParentMarker::Node(_))
    }
}

/// Permission bits for files created through the data-file entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFileMode {
    pub can_read: bool,
    pub can_write: bool,
}

impl DataFileMode {
    pub const READ_WRITE: DataFileMode = DataFileMode {
        can_read: true,
        can_write: true,
    };
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Create `mount_point` and bind `backend` to it. One mount per filesystem.
    fn mount(&self, backend: Backend, mount_point: &str) -> Result<(), FsError>;

    /// Flush between the mounted tree and its backend. Flushes are serialized.
    async fn sync(&self, direction: SyncDirection) -> Result<SyncReport, FsError>;

    /// Every live file node, in creation order
    fn name_table(&self) -> Vec<NameEntry>;

    fn path_of(&self, node: NodeId) -> Result<String, FsError>;

    fn read_file(&self, path: &str) -> Result<String, FsError>;

    /// Create or overwrite `path`, returning the number of bytes written
    fn write_file(&self, path: &str, content: &str) -> Result<usize, FsError>;

    fn unlink(&self, path: &str) -> Result<(), FsError>;

    /// Every file under `dir`, keyed by path relative to it
    fn export_tree(&self, dir: &str) -> Result<Snapshot, FsError>;

    /// Make the files under `dir` equal to `snapshot`
    fn import_tree(&self, dir: &str, snapshot: Snapshot) -> Result<SyncReport, FsError>;

    /// Create `dir/name` with explicit permissions, returning its path
    fn create_data_file(
        &self,
        dir: &str,
        name: &str,
        content: &str,
        mode: DataFileMode,
    ) -> Result<String, FsError>;
}
