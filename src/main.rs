//! WolfHA - High-Availability Database Access Middleware
//!
//! Command line entry point: runs a node in front of a MariaDB replica set
//! and inspects its configuration and persisted state.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfha::cluster::{ClusterBuilder, DatabaseCluster};
use wolfha::config::WolfHaConfig;
use wolfha::distributed::{Member, TcpCommandDispatcher, TcpDispatcherConfig};
use wolfha::error::{Error, Result};
use wolfha::sql::mariadb::MariaDbConnector;
use wolfha::sql::{Operation, OperationClass, SqlProxy, Value};
use wolfha::state::{
    DistributedStateManager, MemoryStateManager, SqliteStateManager, StateBackend, StateManager,
};

/// WolfHA - High-Availability Database Access Middleware
#[derive(Parser)]
#[command(name = "wolfha")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfha.toml")]
    config: PathBuf,

    /// Log level (overrides [logging] level)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfHA node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfha.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Print the persisted active set and pending invocations as JSON
    State,

    /// Run a single statement through the cluster
    Exec {
        /// SQL text
        sql: String,

        /// Treat the statement as a read (sent to one replica)
        #[arg(long)]
        query: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty", None)?;
            run_init(output, node_id)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty", None)?;
            run_validate(cli.config)
        }
        command => {
            let config = match WolfHaConfig::from_file(&cli.config) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Failed to load configuration from {:?}: {}", cli.config, e);
                    return Err(e);
                }
            };
            let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
            init_logging(level, &config.logging.format, config.logging.file.as_ref())?;

            match command {
                Commands::Start => run_start(config).await,
                Commands::Info => run_info(&config),
                Commands::State => run_state(&config).await,
                Commands::Exec { sql, query } => run_exec(config, sql, query).await,
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str, file: Option<&PathBuf>) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let writer = match file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stdout),
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(file.is_none());

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "compact" => registry.with(layer.compact()).init(),
        _ => registry.with(layer.pretty()).init(),
    }
    Ok(())
}

/// State manager for this node alone
fn local_state_manager(config: &WolfHaConfig) -> Result<Arc<dyn StateManager>> {
    match config.state.backend {
        StateBackend::Memory => Ok(Arc::new(MemoryStateManager::new())),
        StateBackend::Sqlite => {
            let manager = SqliteStateManager::new(config.state_dir(), &config.cluster.id)?;
            tracing::info!("State database: {}", manager.path().display());
            Ok(Arc::new(manager))
        }
    }
}

/// Build and start the cluster described by `config`
async fn start_cluster(config: &WolfHaConfig, distributed: bool) -> Result<Arc<DatabaseCluster>> {
    if let Err(e) = std::fs::create_dir_all(config.state_dir()) {
        tracing::error!("Failed to create state directory {:?}: {}", config.state_dir(), e);
        return Err(e.into());
    }

    let local = local_state_manager(config)?;
    let builder = ClusterBuilder::from_config(config);

    let cluster = if distributed {
        let member = Member::new(config.node.id.clone(), config.advertise_address());
        let dispatcher = Arc::new(TcpCommandDispatcher::new(
            member,
            TcpDispatcherConfig {
                bind_address: config.node.bind_address.clone(),
                peers: config.cluster.peers.clone(),
                heartbeat_interval: config.heartbeat_interval(),
                member_timeout: config.member_timeout(),
                request_timeout: config.dispatch_timeout(),
                connect_timeout: config.peer_connect_timeout(),
            },
        ));
        builder.build(|weak| Arc::new(DistributedStateManager::new(weak, local, dispatcher)))?
    } else {
        builder.build(|_| local)?
    };

    cluster.start().await?;
    Ok(cluster)
}

/// Start the WolfHA node
async fn run_start(config: WolfHaConfig) -> Result<()> {
    tracing::info!("Starting WolfHA node {}", config.node.id);

    let cluster = start_cluster(&config, config.cluster.distributed).await?;
    let connector = Arc::new(MariaDbConnector::new(&config.driver));
    let proxy = SqlProxy::connect(Arc::clone(&cluster), connector.clone()).await?;

    let active: Vec<String> = cluster.active_databases().iter().map(|db| db.id.clone()).collect();
    tracing::info!("Cluster {} ready, active databases: {:?}", cluster.id(), active);

    let mut ticker = config.health_check_interval().map(tokio::time::interval);
    loop {
        tokio::select! {
            _ = async {
                match ticker.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                // Pinging every bound connection deactivates replicas that stopped answering
                if let Err(e) = proxy.invoke(Operation::new("ping", OperationClass::Existing)).await {
                    tracing::error!("Health check failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    if let Err(e) = proxy.close().await {
        tracing::warn!("Error closing connections: {}", e);
    }
    connector.close().await;
    cluster.stop().await?;

    tracing::info!("WolfHA shutdown complete");
    Ok(())
}

fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    std::fs::write(&output, WolfHaConfig::sample(&node_id))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your databases and cluster settings.");
    println!("Then start with: wolfha start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfHaConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Cluster: {}", config.cluster.id);
            println!("  Databases: {}", config.databases.len());
            println!("  Distributed: {}", config.cluster.distributed);
            println!("  Peers: {}", config.cluster.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config: &WolfHaConfig) -> Result<()> {
    println!("WolfHA Node Information");
    println!("=======================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Cluster Configuration:");
    println!("  ID:             {}", config.cluster.id);
    println!("  Balancer:       {:?}", config.cluster.balancer);
    println!("  Dialect:        {:?}", config.cluster.dialect);
    println!("  Durability:     {:?}", config.cluster.durability);
    println!("  Execution:      {:?}", config.cluster.execution);
    println!("  State Backend:  {:?}", config.state.backend);
    println!("  Distributed:    {}", config.cluster.distributed);
    if config.cluster.distributed {
        println!("  Peers:          {:?}", config.cluster.peers);
        println!("  Heartbeat:      {} ms", config.cluster.heartbeat_interval_ms);
        println!("  Member Timeout: {} ms", config.cluster.member_timeout_ms);
    }
    println!();
    println!("Databases:");
    for db in &config.databases {
        println!("  {:<14}  {}:{} (weight {})", db.id, db.host, db.port, db.weight);
    }

    Ok(())
}

/// Print persisted state without contacting replicas or peers
async fn run_state(config: &WolfHaConfig) -> Result<()> {
    let manager = local_state_manager(config)?;
    let active = manager.active_databases().await?;
    let pending: Vec<serde_json::Value> = manager
        .recover()
        .await?
        .into_iter()
        .map(|(key, invokers)| {
            serde_json::json!({
                "transaction_id": key.transaction_id.as_u64(),
                "phase": format!("{:?}", key.phase),
                "invokers": invokers.into_values().collect::<Vec<_>>(),
            })
        })
        .collect();

    let state = serde_json::json!({
        "cluster": config.cluster.id,
        "active_databases": active,
        "pending_invocations": pending,
    });
    let text = serde_json::to_string_pretty(&state).map_err(|e| Error::Internal(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

/// Run one statement and print the primary replica's result
async fn run_exec(config: WolfHaConfig, sql: String, query: bool) -> Result<()> {
    if config.cluster.distributed {
        tracing::warn!("exec runs without joining peers; cluster state changes stay on this node");
    }

    let cluster = start_cluster(&config, false).await?;
    let connector = Arc::new(MariaDbConnector::new(&config.driver));
    let proxy = SqlProxy::connect(Arc::clone(&cluster), connector.clone()).await?;

    let operation = if query { Operation::query(sql) } else { Operation::execute(sql) };
    let result = proxy.invoke(operation).await.and_then(|reply| reply.into_value());

    if let Err(e) = proxy.close().await {
        tracing::warn!("Error closing connections: {}", e);
    }
    connector.close().await;
    cluster.stop().await?;

    let text = serde_json::to_string_pretty(&to_json(&result?))
        .map_err(|e| Error::Internal(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(v) => serde_json::json!(v),
        Value::Int(v) => serde_json::json!(v),
        Value::Float(v) => serde_json::json!(v),
        Value::Text(v) => serde_json::json!(v),
        Value::Bytes(v) => serde_json::json!(v),
        Value::Rows(rows) => serde_json::Value::Array(
            rows.iter()
                .map(|row| serde_json::Value::Array(row.iter().map(to_json).collect()))
                .collect(),
        ),
        Value::Handle(_) => serde_json::Value::String(value.summary()),
    }
}
