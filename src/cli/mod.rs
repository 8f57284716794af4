//! Command-line interface for xcloud-worker.
//!
//! Provides commands for running the reconciliation loop, driving single
//! ticks, queueing server actions and inspecting their state.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::{LegacyHttpBackend, ProvisioningBackend, SimulatedBackend};
use crate::config::{self, BackendSettings, ResolvedConfig};
use crate::core::{Clock, ControlLoop, LoopState, SystemClock};
use crate::domain::{ActionId, ActionStatus, ServerId, ServerSpec};
use crate::requests::RequestLayer;
use crate::store::{ActionStore, SqliteActionStore};

/// xcloud-worker - Drives server provisioning actions against the legacy backend
#[derive(Parser, Debug)]
#[command(name = "xcloud-worker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control loop until Ctrl-C
    Run,

    /// Run a single dispatch + reconcile pass
    Tick {
        /// Number of passes to run back to back
        #[arg(short, long, default_value = "1")]
        count: u32,
    },

    /// Queue and inspect server actions
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },

    /// Inspect actions
    Action {
        #[command(subcommand)]
        command: ActionCommands,
    },

    /// List recent actions
    Actions {
        /// Only show actions in this status (queued, running, completed, failed)
        #[arg(short, long)]
        status: Option<ActionStatus>,

        /// Maximum number of actions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum ServerCommands {
    /// Record a server and queue its creation
    Create {
        /// Server name
        name: String,

        #[arg(long, default_value = "redhat-9.0")]
        image: String,

        #[arg(long = "type", default_value = "linux-small")]
        server_type: String,

        #[arg(long, default_value = "fra1")]
        datacenter: String,
    },

    /// Queue deletion of a server
    Delete { server_id: ServerId },

    /// Queue modification of a server
    Modify { server_id: ServerId },

    /// Show a server as JSON
    Show { server_id: ServerId },
}

#[derive(Subcommand, Debug)]
pub enum ActionCommands {
    /// Show an action as JSON
    Show { action_id: ActionId },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run => run_loop().await,
            Commands::Tick { count } => run_ticks(count).await,
            Commands::Server { command } => execute_server(command).await,
            Commands::Action { command } => match command {
                ActionCommands::Show { action_id } => show_action(action_id).await,
            },
            Commands::Actions { status, limit } => list_actions(status, limit).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Store, backend and clock wired from the resolved configuration
struct Worker {
    config: &'static ResolvedConfig,
    store: Arc<dyn ActionStore>,
    clock: Arc<dyn Clock>,
}

impl Worker {
    fn open() -> Result<Self> {
        let config = config::config()?;
        let store = SqliteActionStore::open(&config.database).with_context(|| {
            format!("Failed to open database: {}", config.database.display())
        })?;

        Ok(Self {
            config,
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
        })
    }

    fn backend(&self) -> Result<Arc<dyn ProvisioningBackend>> {
        let backend: Arc<dyn ProvisioningBackend> = match &self.config.backend {
            BackendSettings::Simulated { duration } => {
                let duration = chrono::Duration::from_std(*duration)
                    .context("Simulated duration out of range")?;
                Arc::new(SimulatedBackend::new(self.clock.clone(), duration))
            }
            BackendSettings::LegacyHttp(http) => Arc::new(LegacyHttpBackend::new(http.clone())?),
        };
        Ok(backend)
    }

    fn control_loop(&self) -> Result<ControlLoop> {
        Ok(ControlLoop::new(
            self.store.clone(),
            self.backend()?,
            self.clock.clone(),
            self.config.worker.clone(),
        ))
    }

    fn requests(&self) -> RequestLayer {
        RequestLayer::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.catalog.clone(),
        )
    }
}

/// Run the control loop until interrupted
async fn run_loop() -> Result<()> {
    let worker = Worker::open()?;
    let backend = worker.backend()?;

    if let Err(e) = backend.health_check().await {
        tracing::warn!(backend = backend.name(), error = %e, "Backend health check failed, starting anyway");
    }

    let mut handle = worker.control_loop()?.spawn();
    if handle.wait_for(LoopState::Running).await == LoopState::Crashed {
        let err = handle.join().await.err();
        anyhow::bail!(
            "Control loop failed to start: {}",
            err.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".to_string())
        );
    }

    eprintln!("[Worker running against {}, Ctrl-C to stop]", worker.config.database.display());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    eprintln!("[Stopping after the current step...]");
    let ticks = handle.stop().await?;
    eprintln!("[Worker stopped after {} ticks]", ticks);

    Ok(())
}

/// Run `count` ticks and print what each did
async fn run_ticks(count: u32) -> Result<()> {
    let worker = Worker::open()?;
    let control_loop = worker.control_loop()?;

    for tick in 1..=count {
        let report = control_loop.tick().await;
        println!(
            "tick {}: dispatched {:?}, reconciled {:?}{}",
            tick,
            report.dispatched,
            report.reconciled,
            if report.aborted { " (aborted)" } else { "" }
        );
    }

    Ok(())
}

async fn execute_server(command: ServerCommands) -> Result<()> {
    let worker = Worker::open()?;
    let requests = worker.requests();

    match command {
        ServerCommands::Create {
            name,
            image,
            server_type,
            datacenter,
        } => {
            let (server, action) = requests
                .create_server(ServerSpec {
                    name,
                    image,
                    server_type,
                    datacenter,
                })
                .await?;
            println!("Server {} queued for creation (action {})", server.id, action.id);
        }
        ServerCommands::Delete { server_id } => {
            let action = requests.delete_server(server_id).await?;
            println!("Server {} queued for deletion (action {})", server_id, action.id);
        }
        ServerCommands::Modify { server_id } => {
            let action = requests.modify_server(server_id).await?;
            println!("Server {} queued for modification (action {})", server_id, action.id);
        }
        ServerCommands::Show { server_id } => {
            let server = requests.get_server(server_id).await?;
            println!("{}", serde_json::to_string_pretty(&server)?);
        }
    }

    Ok(())
}

async fn show_action(action_id: ActionId) -> Result<()> {
    let worker = Worker::open()?;
    let action = worker.requests().get_action(action_id).await?;
    println!("{}", serde_json::to_string_pretty(&action)?);
    Ok(())
}

async fn list_actions(status: Option<ActionStatus>, limit: usize) -> Result<()> {
    let worker = Worker::open()?;
    let actions = worker.requests().list_actions(status, limit).await?;

    if actions.is_empty() {
        println!("No actions found");
        return Ok(());
    }

    println!(
        "{:<8} {:<15} {:<10} {:>4}  {:<8} {:<20}",
        "ID", "COMMAND", "STATUS", "PCT", "SERVER", "REASON"
    );
    println!("{}", "-".repeat(72));

    for action in actions {
        println!(
            "{:<8} {:<15} {:<10} {:>3}%  {:<8} {:<20}",
            action.id,
            action.kind.as_str(),
            action.status.as_str(),
            action.progress,
            action.target_server_id,
            action.failure_reason.as_deref().unwrap_or("")
        );
    }

    Ok(())
}

async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("xcloud-worker configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!();
    println!("Worker:");
    println!("  Tick interval:        {}ms", cfg.worker.tick_interval_ms);
    println!("  Batch size:           {}", cfg.worker.batch_size);
    println!("  Stuck timeout:        {}ms", cfg.worker.stuck_timeout_ms);
    println!("  Max dispatch retries: {}", cfg.worker.max_dispatch_retries);
    println!("  Adapter timeout:      {}ms", cfg.worker.adapter_timeout_ms);
    println!();
    match &cfg.backend {
        BackendSettings::Simulated { duration } => {
            println!("Backend: simulated ({}ms per job)", duration.as_millis());
        }
        BackendSettings::LegacyHttp(http) => {
            println!("Backend: legacy HTTP at {}", http.endpoint);
            println!(
                "  Token: {}",
                if http.token.is_some() { "(set)" } else { "(none)" }
            );
        }
    }
    println!();
    println!("Catalog:");
    println!("  Images:       {}", cfg.catalog.images.join(", "));
    println!("  Server types: {}", cfg.catalog.server_types.join(", "));
    println!("  Datacenters:  {}", cfg.catalog.datacenters.join(", "));

    Ok(())
}
