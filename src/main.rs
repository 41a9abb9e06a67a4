//! vmhost - headless virtual machine sessions
//!
//! Creates machines from templates, runs their install and launch tasks,
//! supervises the emulator and mirrors its display into a local framebuffer.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmhost::{
    config::{self, ConfigError, HostConfig},
    framebuffer::Framebuffer,
    pipeline::{OperationRegistry, RunEnvironment},
    resources::Resources,
    rfb::{RfbError, RfbEvent, VncConnection},
    session::{SessionError, SessionManager, SessionStatus},
    template::{Template, TemplateError},
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// vmhost - headless virtual machine sessions
#[derive(Parser, Debug)]
#[command(name = "vmhost", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the host config file
    #[arg(long, env = "VMHOST_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a machine from a template file
    Create {
        /// Template TOML file
        template: PathBuf,
    },

    /// List machines
    List,

    /// Run a machine until its emulator exits (Ctrl+C stops it)
    Run {
        /// Machine id
        id: String,

        /// Write the last display frame to this PPM file on exit
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Stop and delete a machine and its workspace
    Delete {
        /// Machine id
        id: String,
    },

    /// Connect to a VNC server and save its screen
    View {
        /// Server address (host:port)
        address: String,

        /// Output PPM file
        #[arg(long)]
        snapshot: PathBuf,

        /// Number of framebuffer updates to receive before saving
        #[arg(long, default_value_t = 1)]
        frames: u32,
    },

    /// List the emulator architectures available
    Archs,
}

#[derive(Error, Debug)]
pub enum VmhostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Rfb(#[from] RfbError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("machine failed: {0}")]
    Failed(String),

    #[error("display closed before any frame arrived")]
    NoFrame,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vmhost=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), VmhostError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let config = HostConfig::load(&config_path)?;
    tracing::debug!(path = %config_path.display(), "config loaded");

    match cli.command {
        Commands::Create { template } => run_create(config, template),
        Commands::List => run_list(config),
        Commands::Run { id, snapshot } => run_machine(config, id, snapshot).await,
        Commands::Delete { id } => run_delete(config, id).await,
        Commands::View {
            address,
            snapshot,
            frames,
        } => {
            let frame_rate = config.display.frame_rate;
            run_view(address, snapshot, frames, frame_rate).await
        }
        Commands::Archs => {
            for arch in Resources::new(&config.resources).emulation_architectures() {
                println!("{arch}");
            }
            Ok(())
        }
    }
}

fn open_manager(config: HostConfig) -> Result<SessionManager, VmhostError> {
    let manager = SessionManager::new(RunEnvironment::new(
        OperationRegistry::with_defaults(),
        config,
    ));
    manager.load_all()?;
    Ok(manager)
}

// ── Machine management ─────────────────────────────────────────────

fn run_create(config: HostConfig, template: PathBuf) -> Result<(), VmhostError> {
    let template = Template::load(&template)?;
    let manager = open_manager(config)?;
    let session = manager.create(template)?;
    println!("{}", session.id());
    Ok(())
}

fn run_list(config: HostConfig) -> Result<(), VmhostError> {
    let manager = open_manager(config)?;
    for session in manager.list() {
        let state = if session.is_installed() {
            "installed"
        } else {
            "new"
        };
        println!("{}  {:<9}  {}", session.id(), state, session.name());
    }
    Ok(())
}

async fn run_delete(config: HostConfig, id: String) -> Result<(), VmhostError> {
    let manager = open_manager(config)?;
    manager.delete(&id).await?;
    println!("deleted {id}");
    Ok(())
}

// ── Running ────────────────────────────────────────────────────────

/// Start a machine, print its status as it changes, and attach a display
/// client once the emulator reports where it is listening.
async fn run_machine(
    config: HostConfig,
    id: String,
    snapshot: Option<PathBuf>,
) -> Result<(), VmhostError> {
    let frame_rate = config.display.frame_rate;
    let manager = open_manager(config)?;
    let session = manager.start(&id)?;
    println!("started {} ({})", session.name(), session.id());

    let framebuffer = Framebuffer::new();
    let mut viewer: Option<VncConnection> = None;
    let mut last = SessionStatus::default();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c, if !stopping => {
                eprintln!("vmhost: stopping {}", session.name());
                stopping = true;
                session.stop();
            }
        }

        let status = session.status();
        if status.status != last.status || status.sub_status != last.sub_status {
            match (status.status.is_empty(), status.sub_status.is_empty()) {
                (true, true) => {}
                (false, true) => println!("{}", status.status),
                (true, false) => println!("  {}", status.sub_status),
                (false, false) => println!("{}\n  {}", status.status, status.sub_status),
            }
        }
        if viewer.is_none() {
            if let Some(endpoint) = &status.endpoint {
                println!("display at {}", endpoint.address());
                let (connection, _events) =
                    VncConnection::spawn(endpoint.address(), framebuffer.clone(), frame_rate);
                viewer = Some(connection);
            }
        }
        if !status.running {
            break;
        }
        last = status;
    }
    session.wait().await;

    if let Some(viewer) = viewer {
        viewer.shutdown();
        if let Err(e) = viewer.join().await {
            tracing::debug!(error = %e, "display client ended with error");
        }
    }
    if let Some(path) = snapshot {
        if framebuffer.size() != (0, 0) {
            framebuffer.snapshot().write_ppm(&path)?;
            println!("wrote {}", path.display());
        }
    }

    match session.error() {
        Some(error) => Err(VmhostError::Failed(error)),
        None => {
            println!("{} has closed", session.name());
            Ok(())
        }
    }
}

async fn run_view(
    address: String,
    snapshot: PathBuf,
    frames: u32,
    frame_rate: u32,
) -> Result<(), VmhostError> {
    let framebuffer = Framebuffer::new();
    let (connection, mut events) =
        VncConnection::spawn(address, framebuffer.clone(), frame_rate);

    let mut updates = 0u32;
    loop {
        match events.recv().await {
            Ok(RfbEvent::Connected { name }) => println!("connected to {name}"),
            Ok(RfbEvent::Resized { width, height }) => println!("display is {width}x{height}"),
            Ok(RfbEvent::Updated { .. }) => {
                updates += 1;
                if updates >= frames.max(1) {
                    break;
                }
            }
            Ok(RfbEvent::Disconnected { .. }) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(_)) => {}
        }
    }

    connection.shutdown();
    let result = connection.join().await;
    if updates == 0 {
        result?;
        return Err(VmhostError::NoFrame);
    }

    framebuffer.snapshot().write_ppm(&snapshot)?;
    println!("wrote {}", snapshot.display());
    Ok(())
}
