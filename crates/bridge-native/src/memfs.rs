use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use bridge_platform::filesystem::{
    Backend, DataFileMode, FileSystem, FsError, NameEntry, NodeId, ParentMarker, SyncDirection,
    SyncReport,
};

use crate::store::{check_entry_key, open_store, Snapshot, Store};

const ROOT: NodeId = NodeId(0);

enum NodeKind {
    Dir { children: BTreeMap<String, NodeId> },
    File { content: Vec<u8>, mode: DataFileMode },
}

struct Node {
    name: String,
    parent: NodeId,
    // Path of the parent at creation time
    parent_path: String,
    kind: NodeKind,
}

struct Mount {
    point: String,
    store: Arc<dyn Store>,
}

struct Tree {
    nodes: BTreeMap<NodeId, Node>,
    next_id: u64,
    mount: Option<Mount>,
}

/// In-memory virtual filesystem with a single persistent mount
pub struct MemFs {
    tree: Mutex<Tree>,
    // Serializes flushes; the tree lock is never held across a backend await
    flush: tokio::sync::Mutex<()>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT,
            Node {
                name: String::new(),
                parent: ROOT,
                parent_path: "/".to_string(),
                kind: NodeKind::Dir {
                    children: BTreeMap::new(),
                },
            },
        );
        Self {
            tree: Mutex::new(Tree {
                nodes,
                next_id: 1,
                mount: None,
            }),
            flush: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a directory. The parent must exist.
    pub fn mkdir(&self, path: &str) -> Result<NodeId, FsError> {
        let mut tree = self.lock();
        let (parent, name) = tree.split_parent(path)?;
        if tree.child(parent, &name).is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        Ok(tree.insert(
            parent,
            name,
            NodeKind::Dir {
                children: BTreeMap::new(),
            },
        ))
    }
}

fn components(path: &str) -> Result<Vec<&str>, FsError> {
    if !path.starts_with('/') {
        return Err(FsError::RelativePath(path.to_string()));
    }
    Ok(path.split('/').filter(|c| !c.is_empty() && *c != ".").collect())
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

impl Tree {
    fn node(&self, id: NodeId) -> Result<&Node, FsError> {
        self.nodes.get(&id).ok_or(FsError::UnknownNode(id))
    }

    fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        match self.nodes.get(&dir).map(|n| &n.kind) {
            Some(NodeKind::Dir { children }) => children.get(name).copied(),
            _ => None,
        }
    }

    fn path_of(&self, id: NodeId) -> Result<String, FsError> {
        let mut parts = Vec::new();
        let mut current = id;
        while current != ROOT {
            let node = self.node(current)?;
            parts.push(node.name.as_str());
            current = node.parent;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    fn lookup(&self, path: &str) -> Result<NodeId, FsError> {
        let mut current = ROOT;
        for part in components(path)? {
            current = match part {
                ".." => self.node(current)?.parent,
                name => match &self.node(current)?.kind {
                    NodeKind::Dir { children } => children
                        .get(name)
                        .copied()
                        .ok_or_else(|| FsError::NotFound(path.to_string()))?,
                    NodeKind::File { .. } => return Err(FsError::NotADirectory(path.to_string())),
                },
            };
        }
        Ok(current)
    }

    /// Resolve the directory holding `path` and the final component
    fn split_parent(&self, path: &str) -> Result<(NodeId, String), FsError> {
        let parts = components(path)?;
        let (name, dirs) = match parts.split_last() {
            Some((name, dirs)) if *name != ".." => (*name, dirs),
            _ => return Err(FsError::IsADirectory(path.to_string())),
        };
        let dir = self.lookup(&format!("/{}", dirs.join("/")))?;
        match self.node(dir)?.kind {
            NodeKind::Dir { .. } => Ok((dir, name.to_string())),
            NodeKind::File { .. } => Err(FsError::NotADirectory(path.to_string())),
        }
    }

    fn insert(&mut self, parent: NodeId, name: String, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let parent_path = self.path_of(parent).unwrap_or_else(|_| "/".to_string());
        if let Some(Node {
            kind: NodeKind::Dir { children },
            ..
        }) = self.nodes.get_mut(&parent)
        {
            children.insert(name.clone(), id);
        }
        self.nodes.insert(
            id,
            Node {
                name,
                parent,
                parent_path,
                kind,
            },
        );
        id
    }

    fn remove(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            if let Some(Node {
                kind: NodeKind::Dir { children },
                ..
            }) = self.nodes.get_mut(&node.parent)
            {
                children.remove(&node.name);
            }
        }
    }

    fn write(&mut self, path: &str, data: Vec<u8>) -> Result<usize, FsError> {
        let (dir, name) = self.split_parent(path)?;
        let len = data.len();
        match self.child(dir, &name) {
            Some(id) => match self.nodes.get_mut(&id).map(|n| &mut n.kind) {
                Some(NodeKind::File { content, mode }) => {
                    if !mode.can_write {
                        return Err(FsError::PermissionDenied(path.to_string()));
                    }
                    *content = data;
                }
                _ => return Err(FsError::IsADirectory(path.to_string())),
            },
            None => {
                self.insert(
                    dir,
                    name,
                    NodeKind::File {
                        content: data,
                        mode: DataFileMode::READ_WRITE,
                    },
                );
            }
        }
        Ok(len)
    }

    /// Create every missing directory along `path`
    fn mkdir_all(&mut self, path: &str) -> Result<NodeId, FsError> {
        let mut current = ROOT;
        for part in components(path)? {
            current = match self.child(current, part) {
                Some(id) => match self.node(id)?.kind {
                    NodeKind::Dir { .. } => id,
                    NodeKind::File { .. } => return Err(FsError::NotADirectory(path.to_string())),
                },
                None => self.insert(
                    current,
                    part.to_string(),
                    NodeKind::Dir {
                        children: BTreeMap::new(),
                    },
                ),
            };
        }
        Ok(current)
    }

    /// Files under `dir`, keyed by path relative to it
    fn files_under(&self, dir: NodeId) -> Result<BTreeMap<String, NodeId>, FsError> {
        let mut files = BTreeMap::new();
        let mut pending = vec![(dir, String::new())];
        while let Some((id, prefix)) = pending.pop() {
            if let NodeKind::Dir { children } = &self.node(id)?.kind {
                for (name, child) in children {
                    let rel = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{}/{}", prefix, name)
                    };
                    match self.node(*child)?.kind {
                        NodeKind::Dir { .. } => pending.push((*child, rel)),
                        NodeKind::File { .. } => {
                            files.insert(rel, *child);
                        }
                    }
                }
            }
        }
        Ok(files)
    }

    fn snapshot(&self, point: &str) -> Result<Snapshot, FsError> {
        let dir = self.lookup(point)?;
        let mut snapshot = Snapshot::new();
        for (rel, id) in self.files_under(dir)? {
            if let NodeKind::File { content, .. } = &self.node(id)?.kind {
                snapshot.insert(rel, content.clone());
            }
        }
        Ok(snapshot)
    }

    /// Make the tree under `point` equal to `snapshot`
    fn replace_subtree(&mut self, point: &str, snapshot: Snapshot) -> Result<SyncReport, FsError> {
        for rel in snapshot.keys() {
            check_entry_key(rel)?;
        }
        let dir = self.lookup(point)?;
        let existing = self.files_under(dir)?;
        let mut report = SyncReport::default();

        for (rel, id) in &existing {
            if !snapshot.contains_key(rel) {
                self.remove(*id);
                report.removed += 1;
            }
        }

        for (rel, data) in snapshot {
            let path = join(point, &rel);
            if let Some(id) = existing.get(&rel) {
                if let Some(Node {
                    kind: NodeKind::File { content, .. },
                    ..
                }) = self.nodes.get_mut(id)
                {
                    if *content == data {
                        report.unchanged += 1;
                    } else {
                        *content = data;
                        report.written += 1;
                    }
                    continue;
                }
            }
            if let Some((parent, _)) = path.rsplit_once('/') {
                if !parent.is_empty() {
                    self.mkdir_all(parent)?;
                }
            }
            self.write(&path, data)?;
            report.written += 1;
        }

        Ok(report)
    }
}

#[async_trait]
impl FileSystem for MemFs {
    fn mount(&self, backend: Backend, mount_point: &str) -> Result<(), FsError> {
        let mut tree = self.lock();
        if let Some(mount) = &tree.mount {
            return Err(FsError::AlreadyMounted(mount.point.clone()));
        }
        let (parent, name) = tree.split_parent(mount_point)?;
        match tree.child(parent, &name) {
            Some(id) => {
                if let NodeKind::File { .. } = tree.node(id)?.kind {
                    return Err(FsError::NotADirectory(mount_point.to_string()));
                }
            }
            None => {
                tree.insert(
                    parent,
                    name,
                    NodeKind::Dir {
                        children: BTreeMap::new(),
                    },
                );
            }
        }
        debug!("mounting {} at {}", backend, mount_point);
        let store = open_store(&backend);
        tree.mount = Some(Mount {
            point: mount_point.to_string(),
            store,
        });
        Ok(())
    }

    async fn sync(&self, direction: SyncDirection) -> Result<SyncReport, FsError> {
        let _flush = self.flush.lock().await;

        let (point, store) = {
            let tree = self.lock();
            let mount = tree.mount.as_ref().ok_or(FsError::NotMounted)?;
            (mount.point.clone(), mount.store.clone())
        };

        match direction {
            SyncDirection::Load => {
                let snapshot = store.load().await?;
                let report = self.lock().replace_subtree(&point, snapshot)?;
                Ok(report)
            }
            SyncDirection::Save => {
                let snapshot = self.lock().snapshot(&point)?;
                store.save(&snapshot).await
            }
        }
    }

    fn name_table(&self) -> Vec<NameEntry> {
        let tree = self.lock();
        tree.nodes
            .iter()
            .filter(|(_, node)| matches!(node.kind, NodeKind::File { .. }))
            .map(|(id, node)| {
                let parent = match tree.nodes.get(&node.parent) {
                    Some(Node {
                        kind: NodeKind::Dir { .. },
                        ..
                    }) => ParentMarker::Node(node.parent),
                    _ => ParentMarker::Detached(node.parent_path.clone()),
                };
                NameEntry {
                    node: *id,
                    name: node.name.clone(),
                    parent,
                }
            })
            .collect()
    }

    fn path_of(&self, node: NodeId) -> Result<String, FsError> {
        self.lock().path_of(node)
    }

    fn read_file(&self, path: &str) -> Result<String, FsError> {
        let tree = self.lock();
        let id = tree.lookup(path)?;
        match &tree.node(id)?.kind {
            NodeKind::File { mode, .. } if !mode.can_read => {
                Err(FsError::PermissionDenied(path.to_string()))
            }
            NodeKind::File { content, .. } => {
                String::from_utf8(content.clone()).map_err(|_| FsError::InvalidUtf8(path.to_string()))
            }
            NodeKind::Dir { .. } => Err(FsError::IsADirectory(path.to_string())),
        }
    }

    fn write_file(&self, path: &str, content: &str) -> Result<usize, FsError> {
        self.lock().write(path, content.as_bytes().to_vec())
    }

    fn unlink(&self, path: &str) -> Result<(), FsError> {
        let mut tree = self.lock();
        let (dir, name) = tree.split_parent(path)?;
        let id = tree
            .child(dir, &name)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if let NodeKind::Dir { .. } = tree.node(id)?.kind {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        tree.remove(id);
        Ok(())
    }

    fn export_tree(&self, dir: &str) -> Result<Snapshot, FsError> {
        self.lock().snapshot(dir)
    }

    fn import_tree(&self, dir: &str, snapshot: Snapshot) -> Result<SyncReport, FsError> {
        self.lock().replace_subtree(dir, snapshot)
    }

    fn create_data_file(
        &self,
        dir: &str,
        name: &str,
        content: &str,
        mode: DataFileMode,
    ) -> Result<String, FsError> {
        let mut tree = self.lock();
        let path = join(dir, name);
        let (parent, name) = tree.split_parent(&path)?;
        if tree.child(parent, &name).is_some() {
            return Err(FsError::AlreadyExists(path));
        }
        tree.insert(
            parent,
            name,
            NodeKind::File {
                content: content.as_bytes().to_vec(),
                mode,
            },
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(fs: &MemFs) -> Vec<String> {
        fs.name_table()
            .into_iter()
            .filter(|e| e.is_resolvable())
            .map(|e| fs.path_of(e.node).unwrap())
            .collect()
    }

    #[test]
    fn test_write_read_overwrite() {
        let fs = MemFs::new();
        fs.mkdir("/db").unwrap();
        assert_eq!(fs.write_file("/db/a.txt", "hello").unwrap(), 5);
        assert_eq!(fs.read_file("/db/a.txt").unwrap(), "hello");
        fs.write_file("/db/a.txt", "bye").unwrap();
        assert_eq!(fs.read_file("/db/a.txt").unwrap(), "bye");
        assert_eq!(listing(&fs), vec!["/db/a.txt"]);
    }

    #[test]
    fn test_write_requires_parent() {
        let fs = MemFs::new();
        assert!(matches!(
            fs.write_file("/db/a.txt", "x"),
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.write_file("relative.txt", "x"),
            Err(FsError::RelativePath(_))
        ));
    }

    #[test]
    fn test_unlink_then_read_fails() {
        let fs = MemFs::new();
        fs.write_file("/a.txt", "x").unwrap();
        fs.unlink("/a.txt").unwrap();
        assert!(matches!(fs.read_file("/a.txt"), Err(FsError::NotFound(_))));
        assert!(matches!(fs.unlink("/a.txt"), Err(FsError::NotFound(_))));
        assert!(listing(&fs).is_empty());
    }

    #[test]
    fn test_unlink_directory_rejected() {
        let fs = MemFs::new();
        fs.mkdir("/db").unwrap();
        assert!(matches!(fs.unlink("/db"), Err(FsError::IsADirectory(_))));
    }

    #[test]
    fn test_data_file_permissions() {
        let fs = MemFs::new();
        let path = fs
            .create_data_file(
                "/",
                "ro.txt",
                "fixed",
                DataFileMode {
                    can_read: true,
                    can_write: false,
                },
            )
            .unwrap();
        assert_eq!(path, "/ro.txt");
        assert_eq!(fs.read_file("/ro.txt").unwrap(), "fixed");
        assert!(matches!(
            fs.write_file("/ro.txt", "changed"),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            fs.create_data_file("/", "ro.txt", "again", DataFileMode::READ_WRITE),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_name_table_excludes_directories() {
        let fs = MemFs::new();
        fs.mkdir("/db").unwrap();
        fs.mkdir("/db/sub").unwrap();
        fs.write_file("/db/a.txt", "a").unwrap();
        fs.write_file("/db/sub/b.txt", "b").unwrap();
        assert_eq!(listing(&fs), vec!["/db/a.txt", "/db/sub/b.txt"]);
    }

    #[test]
    fn test_mount_twice_fails() {
        let fs = MemFs::new();
        let backend = Backend::Persistent {
            store: "unused.json".into(),
        };
        fs.mount(backend.clone(), "/db").unwrap();
        assert!(matches!(
            fs.mount(backend, "/db"),
            Err(FsError::AlreadyMounted(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_before_mount() {
        let fs = MemFs::new();
        assert!(matches!(
            fs.sync(SyncDirection::Save).await,
            Err(FsError::NotMounted)
        ));
    }

    #[tokio::test]
    async fn test_save_then_load_into_fresh_tree() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::Persistent {
            store: dir.path().join("persist.json"),
        };

        let fs = MemFs::new();
        fs.mount(backend.clone(), "/db").unwrap();
        fs.sync(SyncDirection::Load).await.unwrap();
        fs.write_file("/db/a.txt", "alpha").unwrap();
        fs.write_file("/db/b.txt", "beta").unwrap();
        let report = fs.sync(SyncDirection::Save).await.unwrap();
        assert_eq!(report.written, 2);

        let restored = MemFs::new();
        restored.mount(backend, "/db").unwrap();
        let report = restored.sync(SyncDirection::Load).await.unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(restored.read_file("/db/b.txt").unwrap(), "beta");
        assert_eq!(listing(&restored), vec!["/db/a.txt", "/db/b.txt"]);
    }

    #[tokio::test]
    async fn test_load_replaces_mounted_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/keep.txt"), "disk").unwrap();

        let fs = MemFs::new();
        fs.mount(
            Backend::LocalDir {
                root: dir.path().to_path_buf(),
            },
            "/db",
        )
        .unwrap();
        fs.write_file("/db/scratch.txt", "memory only").unwrap();
        fs.write_file("/outside.txt", "untouched").unwrap();

        let report = fs.sync(SyncDirection::Load).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.written, 1);
        assert_eq!(fs.read_file("/db/nested/keep.txt").unwrap(), "disk");
        assert!(fs.read_file("/db/scratch.txt").is_err());
        assert_eq!(fs.read_file("/outside.txt").unwrap(), "untouched");
    }

    #[tokio::test]
    async fn test_save_writes_through_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fs = MemFs::new();
        fs.mount(
            Backend::LocalDir {
                root: dir.path().to_path_buf(),
            },
            "/db",
        )
        .unwrap();
        fs.sync(SyncDirection::Load).await.unwrap();
        fs.write_file("/db/out.txt", "saved").unwrap();
        fs.sync(SyncDirection::Save).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "saved"
        );
    }

    #[test]
    fn test_import_rejects_keys_outside_dir() {
        let fs = MemFs::new();
        fs.mkdir("/db").unwrap();
        let snapshot: Snapshot = [("../escaped.txt".to_string(), b"x".to_vec())].into();
        assert!(matches!(
            fs.import_tree("/db", snapshot),
            Err(FsError::Corrupt(_))
        ));
        assert!(matches!(
            fs.read_file("/escaped.txt"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_export_import_tree() {
        let fs = MemFs::new();
        fs.mkdir("/db").unwrap();
        fs.write_file("/db/a.txt", "a").unwrap();
        fs.write_file("/db/gone.txt", "gone").unwrap();

        let mut snapshot = fs.export_tree("/db").unwrap();
        assert_eq!(snapshot.len(), 2);
        snapshot.remove("gone.txt");
        snapshot.insert("a.txt".into(), b"changed".to_vec());
        snapshot.insert("sub/new.txt".into(), b"new".to_vec());

        let report = fs.import_tree("/db", snapshot).unwrap();
        assert_eq!(
            report,
            SyncReport {
                written: 2,
                removed: 1,
                unchanged: 0
            }
        );
        assert_eq!(fs.read_file("/db/a.txt").unwrap(), "changed");
        assert_eq!(fs.read_file("/db/sub/new.txt").unwrap(), "new");
        assert_eq!(listing(&fs), vec!["/db/a.txt", "/db/sub/new.txt"]);
    }

    #[tokio::test]
    async fn test_name_table_stays_resolvable_after_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/kept.txt"), "kept").unwrap();

        let fs = MemFs::new();
        fs.mount(
            Backend::LocalDir {
                root: dir.path().to_path_buf(),
            },
            "/db",
        )
        .unwrap();
        fs.mkdir("/db/scratch").unwrap();
        fs.write_file("/db/scratch/tmp.txt", "tmp").unwrap();
        fs.sync(SyncDirection::Load).await.unwrap();
        fs.unlink("/db/sub/kept.txt").unwrap();
        fs.write_file("/db/sub/other.txt", "other").unwrap();

        assert!(fs.name_table().iter().all(|e| e.is_resolvable()));
        assert_eq!(listing(&fs), vec!["/db/sub/other.txt"]);
    }
}
