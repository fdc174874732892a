use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Default location of the server configuration inside the container image.
pub const DEFAULT_CONFIG_FILE: &str = "/opt/veiltun/config/server.json";

#[derive(Parser)]
#[command(
    name = "veiltun",
    version = env!("VEILTUN_BUILD_VERSION"),
    about = "Obfuscated tunnel server"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// Run the tunnel server with the given JSON configuration
    Run {
        /// Path to the server configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}
