use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use redfleet::config::{Config, ConfigError};
use redfleet::core::{BatchAction, BatchReport, NodeRole};
use redfleet::{FleetNode, Propagation};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "redfleet")]
#[command(about = "Fleet coordinator for Redis instances across master, minion and sentinel nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Redfleet Team")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "/etc/redfleet/redfleet.toml")]
    config: PathBuf,

    /// Name recorded as the initiator of queued commands
    #[arg(long, global = true, default_value = "operator")]
    initiator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server (master nodes)
    Serve,
    /// Run the sync agent (minion and sentinel nodes)
    Agent,
    /// Show instance states
    Status {
        /// Instance IDs, all instances when omitted
        ids: Vec<u32>,
    },
    /// Create and start a new instance
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        password: String,
    },
    /// Start an instance
    Start {
        id: u32,
        #[arg(short, long)]
        force: bool,
    },
    /// Stop an instance
    Stop {
        id: u32,
        /// Skip the final save and kill hung instances
        #[arg(short, long)]
        force: bool,
    },
    /// Restart an instance
    Restart {
        id: u32,
        #[arg(short, long)]
        force: bool,
    },
    /// Change description, tags or password of an instance
    Edit {
        id: u32,
        #[arg(long)]
        description: Option<String>,
        /// Add a tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Remove a tag, repeatable
        #[arg(long = "untag")]
        untags: Vec<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Destroy a stopped instance
    Destroy { id: u32 },
    /// Start every instance
    StartAll {
        #[arg(short, long)]
        force: bool,
    },
    /// Stop every instance
    StopAll {
        #[arg(short, long)]
        force: bool,
    },
    /// Restart every instance
    RestartAll {
        #[arg(short, long)]
        force: bool,
    },
    /// Restart instances that were working before a host reboot
    Restore,
    /// Switch this node between master and minion
    Role {
        /// Target role (master or minion)
        target: NodeRole,
        /// Confirm the switch
        #[arg(long)]
        yes: bool,
    },
    /// Show the replication roster
    Replication,
    /// Show sync daemon statistics
    Stats,
    /// Generate example configuration files
    Config {
        /// Node role (master, minion or sentinel)
        #[arg(short, long)]
        role: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Config { role, output } => return generate_config(role, output.clone()),
        Commands::Validate => return validate_config(&cli.config),
        Commands::Version => {
            show_version();
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load_from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    init_logging(&config)?;

    let node = FleetNode::from_config(config).await?;
    let initiator = cli.initiator.as_str();

    match cli.command {
        Commands::Serve => {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting redfleet sync server");
            if let Some(report) = node.restore_after_reboot().await? {
                println!("Restored after reboot: {}", report);
            }
            node.serve(shutdown_signal()).await?;
            node.save_snapshot().await?;
        }
        Commands::Agent => {
            tracing::info!(role = %node.role(), "Starting redfleet sync agent");
            if let Some(report) = node.restore_after_reboot().await? {
                println!("Restored after reboot: {}", report);
            }
            node.run_agent(shutdown_signal()).await?;
            node.save_snapshot().await?;
        }
        Commands::Status { ids } => {
            for (meta, state) in node.status(&ids).await? {
                println!(
                    "{:>5}  {:<36}  {:<12}  {}",
                    meta.id, meta.uuid, meta.owner, state
                );
            }
        }
        Commands::Create {
            owner,
            description,
            password,
        } => {
            let (meta, propagation) = node
                .create(&owner, &description, &password, initiator)
                .await?;
            println!("Created instance {} ({})", meta.id, meta.uuid);
            report_propagation(&propagation);
        }
        Commands::Start { id, force } => {
            lifecycle(&node, BatchAction::Start, id, force, initiator).await?
        }
        Commands::Stop { id, force } => {
            lifecycle(&node, BatchAction::Stop, id, force, initiator).await?
        }
        Commands::Restart { id, force } => {
            lifecycle(&node, BatchAction::Restart, id, force, initiator).await?
        }
        Commands::Edit {
            id,
            description,
            tags,
            untags,
            password,
        } => {
            let (meta, propagation) = node
                .edit(
                    id,
                    move |meta| {
                        let mut meta = match &description {
                            Some(description) => meta.with_description(description),
                            None => meta,
                        };
                        for tag in &tags {
                            meta = meta.with_tag(tag);
                        }
                        for tag in &untags {
                            meta = meta.without_tag(tag);
                        }
                        match &password {
                            Some(password) => meta.with_password(password),
                            None => meta,
                        }
                    },
                    initiator,
                )
                .await?;
            if propagation == Propagation::Skipped && node.role() == NodeRole::Master {
                println!("Instance {} unchanged", meta.id);
            } else {
                println!("Edited instance {}", meta.id);
                report_propagation(&propagation);
            }
        }
        Commands::Destroy { id } => {
            let propagation = node.destroy(id, initiator).await?;
            println!("Destroyed instance {}", id);
            report_propagation(&propagation);
        }
        Commands::StartAll { force } => {
            batch(&node, BatchAction::Start, force, initiator).await?
        }
        Commands::StopAll { force } => batch(&node, BatchAction::Stop, force, initiator).await?,
        Commands::RestartAll { force } => {
            batch(&node, BatchAction::Restart, force, initiator).await?
        }
        Commands::Restore => match node.restore_after_reboot().await? {
            Some(report) => {
                println!("Restored: {}", report);
                exit_on_failures(&report);
            }
            None => println!("No reboot since the last snapshot"),
        },
        Commands::Role { target, yes } => {
            node.switch_role(target, yes).await?;
            println!("Node is now {}", target);
        }
        Commands::Replication => {
            let info = node.replication().await?;
            println!(
                "master {} ({}) v{}",
                info.master.hostname, info.master.ip, info.master.version
            );
            for client in &info.clients {
                let marker = if info.is_suppliant(&client.cid) { "*" } else { " " };
                println!(
                    "{} {:<8}  {:<24}  {:<15}  {:<13}  seen {}ms ago, sync lag {}ms",
                    marker,
                    client.role,
                    client.hostname,
                    client.ip,
                    client.state,
                    client.last_seen_lag_ms,
                    client.last_sync_lag_ms
                );
            }
        }
        Commands::Stats => {
            let stats = node.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Config { .. } | Commands::Validate | Commands::Version => {}
    }

    Ok(())
}

async fn lifecycle(
    node: &FleetNode,
    action: BatchAction,
    id: u32,
    force: bool,
    initiator: &str,
) -> anyhow::Result<()> {
    let (report, propagation) = node.lifecycle(action, id, force, initiator).await?;
    println!("{} {}: {}", action, id, report);
    report_propagation(&propagation);
    Ok(())
}

async fn batch(
    node: &FleetNode,
    action: BatchAction,
    force: bool,
    initiator: &str,
) -> anyhow::Result<()> {
    let (report, propagation) = node.batch(action, force, initiator).await?;
    println!("{}-all: {}", action, report);
    for (id, error) in &report.failed {
        eprintln!("  {}: {}", id, error);
    }
    report_propagation(&propagation);
    exit_on_failures(&report);
    Ok(())
}

fn report_propagation(propagation: &Propagation) {
    match propagation {
        Propagation::Queued(_) => println!("Queued for the fleet"),
        Propagation::Skipped => {}
        Propagation::Failed(error) => {
            eprintln!("Warning: local change kept but not propagated: {}", error)
        }
    }
}

fn exit_on_failures(report: &BatchReport) {
    if !report.is_success() {
        std::process::exit(1);
    }
}

/// Receiver that turns true on Ctrl-C
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

fn generate_config(role: &str, output: PathBuf) -> anyhow::Result<()> {
    println!("Generating {} configuration file: {:?}", role, output);

    Config::create_example_config(&output, role).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  redfleet --config {:?} validate", output);

    Ok(())
}

fn validate_config(config_path: &PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Role: {}", config.node.role);
            println!("  Data dir: {:?}", config.node.data_dir);
            println!("  Base port: {}", config.node.base_port);
            match config.node.role {
                NodeRole::Master => println!("  Sync listen address: {}", config.sync.listen_addr),
                _ => println!(
                    "  Master URL: {}",
                    config.sync.master_url.as_deref().unwrap_or("-")
                ),
            }
            if config.sentinel.enabled {
                println!("  Sentinel port: {}", config.sentinel.port);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            bail!(e)
        }
    }
}

fn show_version() {
    println!("redfleet v{}", env!("CARGO_PKG_VERSION"));
    println!("Fleet coordinator for Redis instances");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Instance state classification from PID, process and INFO signals");
    println!("  • Master to minion/sentinel command propagation over JSON/HTTP");
    println!("  • Client liveness tracking and replication roster");
    println!("  • Guarded master/minion role switch");
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(level = %config.logging.level, format = %config.logging.format, "Logging initialized");
    Ok(())
}
