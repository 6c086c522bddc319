//! Rowkeep node - write-behind record cache in front of a SQL store
//!
//! Runs the cache engine until interrupted, or inspects binlog files.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rowkeep_common::NodeConfig;
use rowkeep_core::Engine;
use rowkeep_core::binlog::{list_files, read_file};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rowkeep-node")]
#[command(about = "Rowkeep cache node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rowkeep/node.toml", env = "ROWKEEP_CONFIG")]
    config: PathBuf,

    /// Binlog directory
    #[arg(long)]
    binlog_dir: Option<PathBuf>,

    /// SQLite database file
    #[arg(long)]
    sql_path: Option<PathBuf>,

    /// Number of cache shards
    #[arg(long)]
    shards: Option<usize>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print every entry of the binlog files in a directory
    ShowBinlog {
        /// Binlog directory
        #[arg(long)]
        dir: PathBuf,

        /// File name prefix
        #[arg(long, default_value = "binlog")]
        prefix: String,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

/// Read the config file if it exists and apply command-line overrides
fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config: NodeConfig = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse {}", args.config.display()))?
    } else {
        NodeConfig::default()
    };

    if let Some(dir) = &args.binlog_dir {
        config.binlog.dir.clone_from(dir);
    }
    if let Some(path) = &args.sql_path {
        config.sql.path.clone_from(path);
    }
    if let Some(shards) = args.shards {
        config.cache.shard_count = shards;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

fn show_binlog(dir: &Path, prefix: &str) -> Result<()> {
    let files = list_files(dir, prefix)?;
    if files.is_empty() {
        println!("No binlog files in {}", dir.display());
        return Ok(());
    }

    let mut total = 0;
    for (index, path) in &files {
        println!("== {} (index {})", path.display(), index);
        let stats = read_file(path, |entry| {
            println!(
                "{:<8} {:>8}  {}  ({} fields)",
                format!("{:?}", entry.opcode).to_lowercase(),
                entry.version,
                entry.uni_key,
                entry.fields.len()
            );
            Ok(())
        })
        .with_context(|| format!("failed to read {}", path.display()))?;
        if stats.torn_tail {
            println!("(partial block at end of file)");
        }
        total += stats.entries;
    }
    println!("{} entries in {} files", total, files.len());
    Ok(())
}

async fn serve(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    init_logging(&config.logging.level, args.log_json);

    info!("Starting Rowkeep node");
    info!("Config file: {}", args.config.display());
    info!("Binlog directory: {}", config.binlog.dir.display());
    info!("SQL store: {}", config.sql.path.display());

    let engine = match Engine::open(config).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start engine: {}", e);
            std::process::exit(1);
        }
    };
    let recovery = engine.recovery();
    if recovery.files > 0 {
        info!(
            "Replayed {} entries from {} files, {} records queued for write-back",
            recovery.entries, recovery.files, recovery.write_backs
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    engine.shutdown();

    let stats = engine.stats().total;
    info!(
        "Final stats: {} records, {} hits, {} misses, {} evictions, {} blocks flushed",
        stats.records, stats.hits, stats.misses, stats.evictions, stats.flushed_blocks
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match &args.command {
        Some(Commands::ShowBinlog { dir, prefix }) => {
            init_logging(args.log_level.as_deref().unwrap_or("warn"), args.log_json);
            show_binlog(dir, prefix)
        }
        None => serve(&args).await,
    }
}
