use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bridge_platform::filesystem::{DataFileMode, SyncDirection};

use crate::context::WorkerContext;
use crate::protocol::{self, CommandMessage};

/// Every command the worker understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CallMain,
    FsUnlink,
    FsCreateDataFile,
    CustomInit,
    FsSync,
    Ls,
    Cat,
    WriteFile,
    DeleteFile,
}

impl CommandKind {
    pub const ALL: [CommandKind; 9] = [
        CommandKind::CallMain,
        CommandKind::FsUnlink,
        CommandKind::FsCreateDataFile,
        CommandKind::CustomInit,
        CommandKind::FsSync,
        CommandKind::Ls,
        CommandKind::Cat,
        CommandKind::WriteFile,
        CommandKind::DeleteFile,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            CommandKind::CallMain => protocol::CALL_MAIN,
            CommandKind::FsUnlink => protocol::FS_UNLINK,
            CommandKind::FsCreateDataFile => protocol::FS_CREATE_DATA_FILE,
            CommandKind::CustomInit => protocol::CUSTOM_INIT,
            CommandKind::FsSync => protocol::FS_SYNC,
            CommandKind::Ls => protocol::LS,
            CommandKind::Cat => protocol::CAT,
            CommandKind::WriteFile => protocol::WRITE_FILE,
            CommandKind::DeleteFile => protocol::DELETE_FILE,
        }
    }

    /// Exact match on the tag; no prefixes, no case folding
    pub fn from_tag(tag: &str) -> Option<CommandKind> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

/// What a dispatched command left behind
#[derive(Debug)]
pub enum Outcome {
    /// Handler ran to completion
    Completed,
    /// A flush is in flight; its continuation sends the response.
    /// Dropping the handle detaches it.
    Pending(JoinHandle<Result<()>>),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown custom command '{command}': {payload}")]
    UnknownCommand { command: String, payload: Value },
    #[error("{command} failed: {error:#}")]
    Failed {
        command: &'static str,
        error: anyhow::Error,
    },
}

/// Routes host commands to the runtime and filesystem facades
pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
}

impl Dispatcher {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Run the handler for one command message
    pub async fn dispatch(&self, msg: CommandMessage) -> Result<Outcome, DispatchError> {
        let Some(kind) = CommandKind::from_tag(msg.command()) else {
            return Err(DispatchError::UnknownCommand {
                command: msg.command().to_string(),
                payload: Value::Object(msg.payload().clone()),
            });
        };

        debug!("dispatching {}", kind.tag());

        let result = match kind {
            CommandKind::CallMain => self.call_main(&msg).await,
            CommandKind::FsUnlink => self.fs_unlink(&msg),
            CommandKind::FsCreateDataFile => self.fs_create_data_file(&msg),
            CommandKind::CustomInit => self.custom_init(),
            CommandKind::FsSync => self.fs_sync(),
            CommandKind::Ls => self.ls().await,
            CommandKind::Cat => self.cat(&msg).await,
            CommandKind::WriteFile => self.write_file(&msg),
            CommandKind::DeleteFile => self.delete_file(&msg),
        };

        result.map_err(|error| DispatchError::Failed {
            command: kind.tag(),
            error,
        })
    }

    async fn call_main(&self, msg: &CommandMessage) -> Result<Outcome> {
        let req: protocol::CallMainRequest = msg.parse()?;

        // Runs on the dispatch thread with no timeout; nothing else is
        // dispatched until the program returns.
        let code = self.ctx.runtime.run_main(&req.arguments)?;
        debug!("main returned {}", code);

        self.ctx
            .messenger
            .notify_bare(protocol::CALL_MAIN_COMPLETE)
            .await?;
        Ok(Outcome::Completed)
    }

    fn fs_unlink(&self, msg: &CommandMessage) -> Result<Outcome> {
        let req: protocol::UnlinkRequest = msg.parse()?;
        self.ctx.runtime.unlink_file(&req.filename)?;
        info!("Removed file {}", req.filename);
        Ok(Outcome::Completed)
    }

    fn fs_create_data_file(&self, msg: &CommandMessage) -> Result<Outcome> {
        let req: protocol::CreateDataFileRequest = msg.parse()?;
        self.ctx.runtime.create_data_file(
            &req.dir,
            &req.filename,
            &req.content,
            DataFileMode::READ_WRITE,
        )?;
        info!("Created file {} in {}", req.filename, req.dir);
        Ok(Outcome::Completed)
    }

    fn custom_init(&self) -> Result<Outcome> {
        let mount_point = self.ctx.mount.mount_point.clone();
        let backend = self.ctx.mount.backend_for(self.ctx.environment);

        self.ctx.fs.mount(backend.clone(), &mount_point)?;

        let ctx = self.ctx.clone();
        let task = tokio::spawn(async move {
            match ctx.fs.sync(SyncDirection::Load).await {
                Ok(report) => {
                    info!(
                        "Mounted {} as a file system at {} ({} files loaded)",
                        backend,
                        mount_point,
                        report.written + report.unchanged
                    );
                    if let Err(e) = ctx.messenger.notify_bare(protocol::CUSTOM_INIT_DONE).await {
                        error!("failed to report {}: {:#}", protocol::CUSTOM_INIT_DONE, e);
                        return Err(e);
                    }
                    Ok(())
                }
                Err(e) => {
                    error!("loading {} from {} failed: {}", mount_point, backend, e);
                    Err(anyhow::Error::from(e))
                }
            }
        });

        Ok(Outcome::Pending(task))
    }

    fn fs_sync(&self) -> Result<Outcome> {
        let ctx = self.ctx.clone();
        let task = tokio::spawn(async move {
            match ctx.fs.sync(SyncDirection::Save).await {
                Ok(report) => {
                    info!(
                        "Synced {} back to {} ({} written, {} removed, {} unchanged)",
                        ctx.mount.mount_point,
                        ctx.mount.backend_for(ctx.environment),
                        report.written,
                        report.removed,
                        report.unchanged
                    );
                    Ok(())
                }
                Err(e) => {
                    error!("syncing {} failed: {}", ctx.mount.mount_point, e);
                    Err(anyhow::Error::from(e))
                }
            }
        });

        Ok(Outcome::Pending(task))
    }

    async fn ls(&self) -> Result<Outcome> {
        for entry in self.ctx.fs.name_table() {
            if !entry.is_resolvable() {
                warn!("Not including {} (parent {:?})", entry.name, entry.parent);
                continue;
            }
            let name = self.ctx.fs.path_of(entry.node)?;
            self.ctx
                .messenger
                .notify_json(protocol::FILE_NAME, &protocol::FileNameEntry { name })
                .await?;
        }
        Ok(Outcome::Completed)
    }

    async fn cat(&self, msg: &CommandMessage) -> Result<Outcome> {
        let req: protocol::PathRequest = msg.parse()?;
        let content = self.ctx.fs.read_file(&req.name)?;
        self.ctx
            .messenger
            .notify_json(
                protocol::CAT_RESPONSE,
                &protocol::CatResponse {
                    name: req.name,
                    content,
                },
            )
            .await?;
        Ok(Outcome::Completed)
    }

    fn write_file(&self, msg: &CommandMessage) -> Result<Outcome> {
        let req: protocol::WriteFileRequest = msg.parse()?;
        let written = self.ctx.fs.write_file(&req.name, &req.content)?;
        debug!("wrote {} bytes to {}", written, req.name);
        Ok(Outcome::Completed)
    }

    fn delete_file(&self, msg: &CommandMessage) -> Result<Outcome> {
        let req: protocol::PathRequest = msg.parse()?;
        self.ctx.fs.unlink(&req.name)?;
        debug!("deleted {}", req.name);
        Ok(Outcome::Completed)
    }
}
