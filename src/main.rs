use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "curfew")]
#[command(about = "Parental-control enforcement agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory for settings, database, pid files and the command inbox
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the enforcement agent (default)
    Run,

    /// Low-footprint companion that keeps the agent alive
    Companion {
        /// Seconds between agent checks
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },

    /// Restart the agent after a delay (used after task removal)
    Relaunch {
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
    },

    /// Start the agent if it is not running (run by OS-registered jobs)
    Ensure,

    /// Remove every recovery trigger and stop the agent (uninstall)
    Disarm,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    curfew_lib::init_logging();

    let data_dir = cli.data_dir.unwrap_or_else(curfew_lib::default_data_dir);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(curfew_lib::run_agent(data_dir)),
        Commands::Companion { interval } => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(curfew_lib::run_companion(
                data_dir,
                Duration::from_secs(interval.max(1)),
            )),
        Commands::Relaunch { delay_ms } => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(curfew_lib::relaunch(data_dir, Duration::from_millis(delay_ms))),
        Commands::Ensure => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(curfew_lib::ensure_agent(data_dir)),
        Commands::Disarm => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(curfew_lib::disarm(data_dir)),
    }
}
