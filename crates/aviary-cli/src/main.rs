use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use aviary_cache::{AssetKind, MediaCacheConfig};

mod commands;

#[derive(Parser)]
#[command(
    name = "aviary",
    about = "Offline media cache for field-guide recordings and images",
    version,
    long_about = "Fetch, verify and manage the local copy of catalog images and recordings. \
                  Every limit can also be set through AVIARY_* environment variables."
)]
struct Cli {
    /// Set the logging level (RUST_LOG takes precedence)
    #[arg(short, long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Cache root directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Aggregate cache ceiling in MiB
    #[arg(long, global = true)]
    max_cache_mb: Option<u64>,

    /// Treat the network as unavailable
    #[arg(long, global = true)]
    offline: bool,

    /// Output format
    #[arg(short = 'o', long, value_enum, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// How command results are printed
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Cache one asset and print its local URI
    Fetch {
        /// Remote URL
        url: String,

        /// Asset kind
        #[arg(short, long, default_value = "audio")]
        kind: AssetKind,
    },

    /// Verify the cache against a catalog and repair what is missing
    Verify {
        /// JSON catalog export
        #[arg(long, env = "AVIARY_CATALOG")]
        catalog: PathBuf,

        /// Check images as well as recordings
        #[arg(long)]
        all_kinds: bool,
    },

    /// Re-verify whenever a connectivity probe succeeds after failing
    Watch {
        /// JSON catalog export
        #[arg(long, env = "AVIARY_CATALOG")]
        catalog: PathBuf,

        /// host:port to probe for connectivity
        #[arg(long, default_value = "1.1.1.1:443")]
        probe: String,

        /// Seconds between probes
        #[arg(long, default_value_t = 30)]
        interval: u64,

        /// Check images as well as recordings
        #[arg(long)]
        all_kinds: bool,
    },

    /// Print the aggregate cache size
    Size,

    /// Remove cached media, keeping the repair log
    Clear,

    /// Print the repair log
    Log,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(cli.log_level.into()).into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MediaCacheConfig> {
    let mut config = MediaCacheConfig::from_env().context("Invalid AVIARY_* environment")?;
    if let Some(dir) = &cli.cache_dir {
        config = config.with_cache_root(dir);
    }
    if let Some(mb) = cli.max_cache_mb {
        config = config.with_max_cache_bytes(mb.saturating_mul(1024 * 1024));
        config.max_download_bytes = config.max_download_bytes.min(config.max_cache_bytes);
    }
    config.validate().context("Invalid cache configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = load_config(&cli)?;
    let ctx = commands::Context::new(config, cli.offline, cli.format)?;

    match cli.command {
        Commands::Fetch { url, kind } => commands::fetch(&ctx, &url, kind).await,
        Commands::Verify { catalog, all_kinds } => commands::verify(&ctx, catalog, all_kinds).await,
        Commands::Watch {
            catalog,
            probe,
            interval,
            all_kinds,
        } => commands::watch(&ctx, catalog, &probe, interval, all_kinds).await,
        Commands::Size => commands::size(&ctx).await,
        Commands::Clear => commands::clear(&ctx).await,
        Commands::Log => commands::log(&ctx).await,
    }
}
