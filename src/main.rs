use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "appforge")]
#[command(version, about = "Prompt-to-app generation server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Port to listen on (overrides PORT)
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Validate the environment configuration and print it with secrets redacted
    CheckConfig,
    /// Mark sessions stuck in the generating state as failed
    RecoverStuck {
        /// Age in milliseconds after which a generating session counts as stuck
        /// (overrides STUCK_SESSION_THRESHOLD_MS)
        #[arg(long)]
        threshold_ms: Option<u64>,
        /// Report what would be recovered without changing anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { port, dev } => cmd::cmd_serve(port, dev).await,
        Commands::CheckConfig => cmd::cmd_check_config(),
        Commands::RecoverStuck { threshold_ms, dry_run } => cmd::cmd_recover_stuck(threshold_ms, dry_run),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
