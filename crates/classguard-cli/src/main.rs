mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use classguard_core::config::get_data_dir;
use classguard_storage::Role;

use commands::daemon::{
    raise_help, run_daemon_process, run_foreground, show_status, start_daemon, stop_daemon,
};

#[derive(Parser)]
#[command(name = "classguard")]
#[command(about = "Classroom attention monitoring agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize this device (first-time setup)
    Init {
        /// Device role: student or teacher
        #[arg(short, long)]
        role: Option<Role>,
        /// Backend base URL
        #[arg(long)]
        backend_url: Option<String>,
        /// Backend API token
        #[arg(long)]
        api_token: Option<String>,
    },
    /// Start the agent daemon in the background
    Start,
    /// (Internal) Run the daemon process
    #[command(hide = true)]
    DaemonInternalStart,
    /// Stop the agent daemon
    Stop,
    /// Run the agent in the foreground
    Run,
    /// Show session, sync and outbox state
    Status,
    /// Inspect the local outbox
    Outbox {
        /// List permanently failed entries
        #[arg(short, long)]
        failed: bool,
        /// Maximum number of rows
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// List sessions recorded on this device
    Sessions {
        /// Only finalized sessions the backend never confirmed
        #[arg(short, long)]
        unconfirmed: bool,
        /// Maximum number of rows
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Ask the teacher for help
    Help {
        /// Why help is needed
        #[arg(required = true)]
        reason: Vec<String>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::DaemonInternalStart) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    }

    let data_dir = get_data_dir()?;

    match cli.command {
        Commands::Init {
            role,
            backend_url,
            api_token,
        } => commands::init::init_command(
            &data_dir,
            commands::init::InitOptions {
                role,
                backend_url,
                api_token,
            },
        ),
        Commands::Start => start_daemon(&data_dir),
        Commands::DaemonInternalStart => run_daemon_process(&data_dir).await,
        Commands::Stop => stop_daemon(&data_dir).await,
        Commands::Run => run_foreground(&data_dir).await,
        Commands::Status => show_status(&data_dir).await,
        Commands::Outbox { failed, limit } => {
            commands::outbox::show_outbox(&data_dir, failed, limit)
        }
        Commands::Sessions { unconfirmed, limit } => {
            commands::sessions::list_sessions(&data_dir, unconfirmed, limit)
        }
        Commands::Help { reason } => raise_help(&data_dir, &reason.join(" ")).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => commands::config::show_config(&data_dir),
    }
}
