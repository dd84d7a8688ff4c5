use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleetbeacon_lib::{init_logging, resolve_data_dir, run_dashboard, run_producer, IdentityOverrides};

#[derive(Parser)]
#[command(name = "fleetbeacon")]
#[command(about = "Field location producer and live liveness dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample `lat,lon` lines from stdin and deliver them to the sink
    Producer {
        /// Directory for settings and the offline queue
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Device identity reported with every reading
        #[arg(long)]
        device_id: Option<String>,

        /// Vehicle or asset title
        #[arg(long)]
        title: Option<String>,

        /// Operator name shown on the dashboard
        #[arg(long)]
        user_name: Option<String>,
    },
    /// Track JSON location records from stdin and print display commands
    Dashboard {
        /// Directory for settings and the entity snapshot
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Whether ordinary updates move the viewport (persisted)
        #[arg(long)]
        fit_on_update: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Producer {
            data_dir,
            device_id,
            title,
            user_name,
        } => {
            let overrides = IdentityOverrides {
                device_id,
                title,
                user_name,
            };
            run_producer(resolve_data_dir(data_dir), overrides).await
        }
        Commands::Dashboard {
            data_dir,
            fit_on_update,
        } => run_dashboard(resolve_data_dir(data_dir), fit_on_update).await,
    }
}
