//! Portfleet CLI - SSH tunnels to every running workspace
//!
//! Opens one local port per workspace, keeps it healthy and tears everything
//! down on Ctrl+C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portfleet_proto::{
    CredentialResolver, WorkspaceDirectory, WorkspaceScope, WorkspaceStatus, WorkspaceTarget,
};
use portfleet_store::{
    ConfigManager, KeyFileResolver, PortStore, SshConfigWriter, SshHostEntry, WorkspaceStore,
};
use portfleet_supervisor::{PortAssigner, SshHealthChecker, Supervisor, SupervisorConfig};
use portfleet_transport::TcpForwarder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portfleet - SSH tunnels to your remote workspaces
#[derive(Parser, Debug)]
#[command(name = "portfleet")]
#[command(about = "Portfleet - SSH tunnels to your remote workspaces")]
#[command(version = env!("PORTFLEET_VERSION"))]
#[command(long_version = concat!(env!("PORTFLEET_VERSION"), " (", env!("PORTFLEET_COMMIT"), ")"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open tunnels to every running workspace until Ctrl+C
    #[command(long_about = r#"
Open one SSH tunnel per running workspace on a local port and keep them
healthy. Any tunnel error triggers a health check of every workspace;
unhealthy ones are reconnected, up to --retries times each.

Every workspace gets a `Host <local id>` alias in ~/.portfleet/ssh_config,
pointing at its local port. Include that file from ~/.ssh/config once:

  Include ~/.portfleet/ssh_config

and connect with `ssh <local id>`. Ports drawn for a workspace are saved, so
the aliases stay valid across runs.
"#)]
    Up {
        /// Reconnections allowed per workspace
        #[arg(long, env = "PORTFLEET_RETRIES")]
        retries: Option<u32>,

        /// Health probe timeout in seconds
        #[arg(long, env = "PORTFLEET_PROBE_TIMEOUT")]
        probe_timeout: Option<u64>,

        /// SSH user for health probes
        #[arg(long, env = "PORTFLEET_USER")]
        user: Option<String>,

        /// Private key file
        #[arg(short, long, env = "PORTFLEET_IDENTITY")]
        identity: Option<PathBuf>,
    },

    /// Manage known workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },

    /// Manage pinned local ports
    Port {
        #[command(subcommand)]
        command: PortCommands,
    },

    /// Manage global configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum WorkspaceCommands {
    /// Add or update a workspace
    Add {
        /// Workspace name
        name: String,
        /// Workspace id
        id: String,
        /// SSH host, optionally with a port
        address: String,
        /// Workspace status
        #[arg(long, value_enum, default_value_t = StatusArg::Running)]
        status: StatusArg,
    },
    /// List workspaces
    List {
        /// Include workspaces that are not running
        #[arg(long)]
        all: bool,
    },
    /// Remove a workspace by local id
    Remove { local_id: String },
}

#[derive(Subcommand, Debug)]
enum PortCommands {
    /// Pin a workspace to a local port
    Set { local_id: String, port: u16 },
    /// Unpin a workspace
    Clear { local_id: String },
    /// List pinned ports
    List,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the current configuration
    Show,
    /// Set the SSH user
    SetUser { user: String },
    /// Set the private key file, or clear it when omitted
    SetIdentity { path: Option<PathBuf> },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum StatusArg {
    Running,
    Starting,
    Deploying,
    Stopped,
}

impl From<StatusArg> for WorkspaceStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Running => WorkspaceStatus::Running,
            StatusArg::Starting => WorkspaceStatus::Starting,
            StatusArg::Deploying => WorkspaceStatus::Deploying,
            StatusArg::Stopped => WorkspaceStatus::Stopped,
        }
    }
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Up {
            retries,
            probe_timeout,
            user,
            identity,
        } => up(retries, probe_timeout, user, identity).await,
        Commands::Workspace { command } => handle_workspace_command(command),
        Commands::Port { command } => handle_port_command(command),
        Commands::Config { command } => handle_config_command(command),
    }
}

async fn up(
    retries: Option<u32>,
    probe_timeout: Option<u64>,
    user: Option<String>,
    identity: Option<PathBuf>,
) -> Result<()> {
    let config = ConfigManager::new()?
        .load()
        .context("Failed to load configuration")?;

    let retry_budget = retries.unwrap_or(config.retry_budget);
    let probe_timeout = Duration::from_secs(probe_timeout.unwrap_or(config.probe_timeout_secs));
    let user = user.unwrap_or(config.ssh_user);
    let credentials = Arc::new(KeyFileResolver::new(identity.or(config.private_key_path)));

    let key_path = credentials
        .private_key_path()
        .context("No usable private key (set one with `portfleet config set-identity`)")?;
    info!("Using private key {:?}", key_path);

    let workspaces = WorkspaceStore::new()?
        .list_workspaces(WorkspaceScope::Running)
        .await
        .context("Failed to list workspaces")?;

    if workspaces.is_empty() {
        println!("No running workspaces.");
        return Ok(());
    }

    let ports = PortAssigner::new(Arc::new(PortStore::new()?));
    ports.reserve_configured(&workspaces);
    let mut entries = Vec::with_capacity(workspaces.len());
    for workspace in &workspaces {
        match ports.resolve_port(workspace) {
            Ok(port) => entries.push(SshHostEntry::new(workspace.local_id(), port)),
            Err(e) => warn!("[{}] No local port: {}", workspace.local_id(), e),
        }
    }

    let ssh_config = SshConfigWriter::new(user.clone(), Some(key_path))?;
    ssh_config
        .sync(&entries)
        .context("Failed to write ssh config")?;
    print_connection_hint(&ssh_config, &entries);

    let supervisor_config = SupervisorConfig {
        retry_budget,
        ..Default::default()
    };
    let health = SshHealthChecker::new(credentials.clone(), user)
        .with_timeout(probe_timeout)
        .with_remote_port(supervisor_config.remote_port);
    let supervisor = Supervisor::new(
        supervisor_config,
        Arc::new(TcpForwarder::new()),
        Arc::new(health),
        ports,
    );

    portfleet_supervisor::run(supervisor, credentials.as_ref(), &workspaces)
        .await
        .context("Tunnel supervisor failed")?;

    info!("Portfleet stopped");
    Ok(())
}

fn print_connection_hint(ssh_config: &SshConfigWriter, entries: &[SshHostEntry]) {
    println!("Add this line to the top of ~/.ssh/config (once):");
    println!();
    println!("  {}", ssh_config.include_line());
    println!();
    println!("Connect with:");
    for entry in entries {
        println!("  ssh {}    # 127.0.0.1:{}", entry.local_id, entry.port);
    }
    println!();
}

fn handle_workspace_command(command: WorkspaceCommands) -> Result<()> {
    let store = WorkspaceStore::new()?;

    match command {
        WorkspaceCommands::Add {
            name,
            id,
            address,
            status,
        } => {
            let target = WorkspaceTarget::new(id, name, address).with_status(status.into());
            let local_id = store.save(&target)?;
            println!("✅ Workspace '{}' saved", local_id);
        }
        WorkspaceCommands::List { all } => {
            let workspaces = store.list()?;
            let scope = if all {
                WorkspaceScope::All
            } else {
                WorkspaceScope::Running
            };
            let shown: Vec<_> = workspaces.iter().filter(|w| scope.includes(w)).collect();

            if shown.is_empty() {
                println!("No workspaces found in {:?}", store.base_dir());
                return Ok(());
            }
            for workspace in shown {
                println!(
                    "{:<24} {:<10} {}",
                    workspace.local_id(),
                    format!("{:?}", workspace.status).to_lowercase(),
                    workspace.address
                );
            }
        }
        WorkspaceCommands::Remove { local_id } => {
            store.remove(&local_id)?;
            println!("✅ Workspace '{}' removed", local_id);
        }
    }

    Ok(())
}

fn handle_port_command(command: PortCommands) -> Result<()> {
    let store = PortStore::new()?;

    match command {
        PortCommands::Set { local_id, port } => {
            store.set(&local_id, port)?;
            println!("✅ {} pinned to 127.0.0.1:{}", local_id, port);
        }
        PortCommands::Clear { local_id } => {
            if store.remove(&local_id)? {
                println!("✅ {} unpinned", local_id);
            } else {
                println!("{} has no pinned port", local_id);
            }
        }
        PortCommands::List => {
            let ports = store.list()?;
            if ports.is_empty() {
                println!("No pinned ports");
            }
            for (local_id, port) in ports {
                println!("{:<24} {}", local_id, port);
            }
        }
    }

    Ok(())
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    let manager = ConfigManager::new()?;

    match command {
        ConfigCommands::Show => {
            let config = manager.load()?;
            println!("Config file: {:?}", manager.path());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::SetUser { user } => {
            manager.set_user(user.clone())?;
            println!("✅ SSH user set to '{}'", user);
        }
        ConfigCommands::SetIdentity { path } => {
            manager.set_identity(path.clone())?;
            match path {
                Some(path) => println!("✅ Private key set to {:?}", path),
                None => println!("✅ Private key cleared, ~/.ssh keys will be searched"),
            }
        }
    }

    Ok(())
}
