use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Daemonless multi-architecture container image builder", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error, fatal)
    #[arg(long, global = true, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a Dockerfile
    Build(commands::build::BuildArgs),

    /// Inspect and maintain the build cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show entry counts, sizes and hit rates
    Info,

    /// Remove entries until the pruning limits hold
    Prune {
        /// Maximum total size (e.g. 512MB, 10GB)
        #[arg(long, value_parser = commands::parse_size)]
        max_size: Option<u64>,

        /// Maximum entry age in hours
        #[arg(long)]
        max_age_hours: Option<u64>,

        /// Maximum number of entries
        #[arg(long)]
        max_files: Option<usize>,

        /// Per-platform size quota (e.g. 2GB)
        #[arg(long, value_parser = commands::parse_size)]
        platform_quota: Option<u64>,
    },

    /// Delete every cache entry
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    kiln_core::init_observability(cli.log_level.as_deref(), cli.json_logs);

    match cli.command {
        Commands::Build(args) => {
            let code = commands::build::build(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Cache(cache_cmd) => match cache_cmd {
            CacheCommands::Info => {
                commands::cache::info()?;
            }
            CacheCommands::Prune { max_size, max_age_hours, max_files, platform_quota } => {
                commands::cache::prune(max_size, max_age_hours, max_files, platform_quota)?;
            }
            CacheCommands::Clear => {
                commands::cache::clear()?;
            }
        },
    }

    Ok(())
}
