use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use bridge_platform::filesystem::{DataFileMode, FileSystem, Snapshot};
use bridge_platform::runtime::Runtime;

/// Set for the program to the host directory standing in for the virtual root
pub const VFS_ROOT_ENV: &str = "BRIDGE_VFS_ROOT";

/// Runs a host program as the worker's main entry point.
///
/// The program is never started on its own: each `run_main` call runs it once,
/// and the runtime stays usable afterwards. The virtual filesystem is staged
/// into a scratch directory for the run and whatever the program leaves there
/// is imported back, so data files created beforehand are visible to it and
/// its outputs can be read with `cat` afterwards.
pub struct ProcessRuntime {
    program: Option<PathBuf>,
    /// Virtual directory the program starts in
    working_dir: String,
    fs: Arc<dyn FileSystem>,
}

impl ProcessRuntime {
    pub fn new(program: Option<PathBuf>, working_dir: String, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            program,
            working_dir,
            fs,
        }
    }
}

fn write_stage(root: &Path, files: &Snapshot) -> Result<()> {
    for (rel, data) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, data).with_context(|| format!("failed to stage {}", rel))?;
    }
    Ok(())
}

fn read_stage(root: &Path) -> Result<Snapshot> {
    let mut files = Snapshot::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!("skipping non UTF-8 name {}", entry.path().display());
                continue;
            };
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to stat {}", entry.path().display()))?;

            if file_type.is_dir() {
                pending.push((entry.path(), rel));
            } else if file_type.is_file() {
                let data = std::fs::read(entry.path())
                    .with_context(|| format!("failed to read back {}", rel))?;
                files.insert(rel, data);
            } else {
                debug!("skipping non-regular entry {}", entry.path().display());
            }
        }
    }

    Ok(files)
}

impl Runtime for ProcessRuntime {
    fn run_main(&self, args: &[String]) -> Result<i32> {
        let program = self
            .program
            .as_ref()
            .context("no program configured for callMain")?;
        // Paths like ./solver must not resolve against the scratch directory
        let program = if program.is_relative() && program.components().count() > 1 {
            std::env::current_dir()
                .context("failed to resolve the worker directory")?
                .join(program)
        } else {
            program.clone()
        };

        let stage = tempfile::Builder::new()
            .prefix("vfs-bridge-")
            .tempdir()
            .context("failed to create staging directory")?;
        let files = self
            .fs
            .export_tree("/")
            .context("failed to snapshot the virtual filesystem")?;
        write_stage(stage.path(), &files)?;

        let cwd = stage.path().join(self.working_dir.trim_start_matches('/'));
        std::fs::create_dir_all(&cwd)
            .with_context(|| format!("failed to create {}", cwd.display()))?;

        info!("running {} {:?} in {}", program.display(), args, self.working_dir);

        // stdout is the protocol stream, so program output goes to the log
        let output = Command::new(&program)
            .args(args)
            .current_dir(&cwd)
            .env(VFS_ROOT_ENV, stage.path())
            .output()
            .with_context(|| format!("failed to run {}", program.display()))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!("[main] {}", line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!("[main] {}", line);
        }

        let code = output.status.code().unwrap_or(-1);
        info!("{} exited with code {}", program.display(), code);

        let report = self
            .fs
            .import_tree("/", read_stage(stage.path())?)
            .context("failed to import program output")?;
        debug!(
            "program left {} files written, {} removed, {} unchanged",
            report.written, report.removed, report.unchanged
        );

        Ok(code)
    }

    fn unlink_file(&self, path: &str) -> Result<()> {
        self.fs
            .unlink(path)
            .with_context(|| format!("failed to unlink {}", path))
    }

    fn create_data_file(
        &self,
        dir: &str,
        name: &str,
        content: &str,
        mode: DataFileMode,
    ) -> Result<()> {
        self.fs
            .create_data_file(dir, name, content, mode)
            .with_context(|| format!("failed to create {} in {}", name, dir))?;
        Ok(())
    }
}
