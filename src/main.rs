//! certrig - hardware certification test orchestrator
//!
//! The same binary runs the resident agent (`certrig agent`) and the
//! controller commands that drive it.

use certrig::common::logging;
use certrig::ipc::Endpoint;
use certrig::{agent, cli, commands};
use clap::Parser;
use commands::Commands;

#[derive(Parser)]
#[command(name = "certrig", about = "Hardware certification test orchestrator")]
#[command(version, long_about = None)]
struct Cli {
    /// Talk to a remote agent at host:port instead of the local one
    #[arg(long, global = true, value_name = "HOST:PORT")]
    connect: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Agent => {
            let _guard = logging::init_agent();
            agent::run().await
        }
        command => {
            logging::init_cli();
            let endpoint = match cli.connect {
                Some(addr) => Endpoint::Tcp(addr),
                None => Endpoint::Local,
            };
            cli::dispatch(command, endpoint).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
