//! ShardKV - Statically Sharded Key-Value Store
//!
//! Node binary: loads the shared sharding configuration, opens the local
//! database and serves the HTTP API for one shard.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardkv::api::HttpServer;
use shardkv::config::ShardKvConfig;
use shardkv::error::Result;
use shardkv::router::{Forwarder, RequestRouter};
use shardkv::shard::ShardTable;
use shardkv::storage::StorageEngine;

/// ShardKV - Statically Sharded Key-Value Store
#[derive(Parser)]
#[command(name = "shardkv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sharding configuration file
    #[arg(short, long, default_value = "sharding.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a shard node
    Start {
        /// Path to the database file
        #[arg(long)]
        db_location: PathBuf,

        /// Name of the shard served by this node
        #[arg(long)]
        shard: String,

        /// HTTP host and port (defaults to the shard's configured address)
        #[arg(long)]
        http_addr: Option<String>,

        /// Serve the database read-only, as a replica
        #[arg(long, alias = "replica")]
        read_only: bool,
    },

    /// Validate the configuration file
    Validate {
        /// Also resolve the shard table for this shard name
        #[arg(long)]
        shard: Option<String>,
    },

    /// Write a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "sharding.toml")]
        output: PathBuf,

        /// Number of shards
        #[arg(long, default_value_t = 2)]
        shards: usize,

        /// Host every shard listens on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port of shard 0; shard N listens on base_port + N
        #[arg(long, default_value_t = 8080)]
        base_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start {
            db_location,
            shard,
            http_addr,
            read_only,
        } => run_start(cli.config, db_location, shard, http_addr, read_only).await,
        Commands::Validate { shard } => run_validate(cli.config, shard),
        Commands::Init {
            output,
            shards,
            host,
            base_port,
        } => run_init(output, shards, host, base_port),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start a shard node
async fn run_start(
    config_path: PathBuf,
    db_location: PathBuf,
    shard: String,
    http_addr: Option<String>,
    read_only: bool,
) -> Result<()> {
    let config = match ShardKvConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Error while parsing config {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    let shards = match ShardTable::new(&config.shards, &shard) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Error while parsing shards from config: {}", e);
            return Err(e);
        }
    };
    tracing::info!(
        "Serving shard {} (index {} of {})",
        shard,
        shards.current_index(),
        shards.count()
    );

    let engine = match StorageEngine::open(&db_location, read_only) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("Failed to open database {:?}: {}", db_location, e);
            return Err(e);
        }
    };
    if read_only {
        tracing::info!("Database {:?} opened read-only", db_location);
    }

    let forwarder = Forwarder::new(config.forward.timeout())?;
    let router = RequestRouter::new(engine, Arc::clone(&shards), forwarder);

    let bind_address = match http_addr {
        Some(addr) => addr,
        None => shards
            .address(shards.current_index())
            .unwrap_or("127.0.0.1:8080")
            .to_string(),
    };
    let http_server = HttpServer::new(bind_address, shard, router);

    tokio::select! {
        result = http_server.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    tracing::info!("ShardKV shutdown complete");
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf, shard: Option<String>) -> Result<()> {
    let config = match ShardKvConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            return Err(e);
        }
    };

    if let Some(name) = shard {
        match ShardTable::new(&config.shards, &name) {
            Ok(table) => {
                println!("✓ Configuration is valid");
                println!("  Shard:          {} (index {})", name, table.current_index());
                println!("  Shard Count:    {}", table.count());
                for (idx, addr) in table.addresses() {
                    println!("    [{}] {}", idx, addr);
                }
            }
            Err(e) => {
                eprintln!("✗ Shard configuration error: {}", e);
                return Err(e);
            }
        }
    } else {
        println!("✓ Configuration parsed");
        println!("  Shards: {}", config.shards.len());
        for s in &config.shards {
            println!("    [{}] {} at {}", s.idx, s.name, s.address);
        }
    }

    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, shards: usize, host: String, base_port: u16) -> Result<()> {
    if shards == 0 {
        return Err(shardkv::Error::Config("at least one shard is required".into()));
    }

    std::fs::write(&output, ShardKvConfig::sample(shards, &host, base_port))?;
    println!("Configuration file created: {}", output.display());
    println!(
        "Start each shard with: shardkv --config {} start --shard shard-0 --db-location shard-0.db",
        output.display()
    );

    Ok(())
}
