use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use bridge_core::config::WorkerConfig;
use bridge_core::context::WorkerContext;
use bridge_core::dispatcher::Dispatcher;
use bridge_core::transport::{self, HostEvent};
use bridge_native::{MemFs, ProcessRuntime};
use bridge_platform::environment::HostEnvironment;
use bridge_platform::filesystem::FileSystem;

/// How long queued responses get to drain on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "vfs-bridge-worker")]
#[command(about = "Background worker relaying host commands to a program and its persistent virtual filesystem")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(long, env = "BRIDGE_CONFIG_PATH", global = true)]
    config_path: Option<PathBuf>,

    /// Execution context (native or browser); selects the mount backend
    #[arg(long, env = "BRIDGE_ENVIRONMENT", global = true)]
    environment: Option<HostEnvironment>,

    /// Host directory backing the mount in native mode
    #[arg(long, env = "BRIDGE_NATIVE_ROOT", global = true)]
    native_root: Option<PathBuf>,

    /// Store file backing the mount in browser mode
    #[arg(long, env = "BRIDGE_STORE_PATH", global = true)]
    store_path: Option<PathBuf>,

    /// Program run by callMain
    #[arg(long, env = "BRIDGE_PROGRAM", global = true)]
    program: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BRIDGE_LOG_LEVEL", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the effective configuration to the config path and exit
    InitConfig,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config_path
        .clone()
        .unwrap_or_else(WorkerConfig::default_path);

    let mut config = if config_path.exists() {
        info!("loading config from {}", config_path.display());
        WorkerConfig::load(&config_path)?
    } else {
        WorkerConfig::default()
    };

    // CLI args override config file
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }
    if let Some(root) = cli.native_root {
        config.native_root = root;
    }
    if let Some(store) = cli.store_path {
        config.store_path = store;
    }
    if let Some(program) = cli.program {
        config.program = Some(program);
    }
    config.validate()?;

    if let Some(Commands::InitConfig) = cli.command {
        config.save(&config_path)?;
        info!("config written to {}", config_path.display());
        return Ok(());
    }

    run_worker(config).await
}

async fn run_worker(config: WorkerConfig) -> Result<()> {
    info!(
        "vfs-bridge-worker v{} starting (environment={}, mount={})",
        env!("CARGO_PKG_VERSION"),
        config.environment,
        config.mount_point,
    );
    if config.program.is_none() {
        warn!("no program configured, callMain will fail");
    }

    let mut transport = transport::spawn(
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.channel_capacity,
    );

    let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
    let runtime = ProcessRuntime::new(config.program.clone(), config.mount_point.clone(), fs.clone());

    let dispatcher = Dispatcher::new(WorkerContext {
        runtime: Arc::new(runtime),
        fs,
        messenger: transport.messenger.clone(),
        environment: config.environment,
        mount: config.mount_settings(),
    });
    drop(transport.messenger);

    info!(
        "worker ready, waiting for custom-init to mount {}",
        dispatcher.context().mount.mount_point
    );

    loop {
        tokio::select! {
            event = transport.events.recv() => {
                match event {
                    Some(HostEvent::Command(msg)) => {
                        // Pending flushes finish on their own
                        if let Err(e) = dispatcher.dispatch(msg).await {
                            error!("{}", e);
                        }
                    }
                    Some(HostEvent::Closed) | None => {
                        info!("host gone, shutting down");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
                break;
            }
        }
    }

    drop(dispatcher);
    if tokio::time::timeout(SHUTDOWN_GRACE, transport.writer).await.is_err() {
        warn!("outbound queue not drained after {:?}", SHUTDOWN_GRACE);
    }

    Ok(())
}
