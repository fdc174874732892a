use clap::Parser;
use slog_scope::error;

use veiltun::cli::{Cli, TopCommand};
use veiltun::{logging, server};

fn main() {
    let cli = Cli::parse();

    // Terminal logging covers startup; the supervisor swaps in the
    // config-selected drain once the config is loaded.
    logging::init_terminal(false);

    match cli.command {
        TopCommand::Run { config } => {
            let config_json = match std::fs::read(&config) {
                Ok(bytes) => bytes,
                Err(e) => {
                    eprintln!("failed to read config {}: {}", config.display(), e);
                    std::process::exit(1);
                }
            };

            let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            if let Err(e) = rt.block_on(server::run_services(&config_json)) {
                error!("server_failed"; "error" => format!("{:#}", e));
                std::process::exit(1);
            }
        }
    }
}
