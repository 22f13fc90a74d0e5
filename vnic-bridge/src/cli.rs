use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vnic_core::MacAddr;

#[derive(Debug, Parser)]
#[command(
    name = "vnic-bridge",
    version,
    about = "Relays a virtual Ethernet adapter's frames to a remote hub"
)]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge in the foreground (default)
    Run {
        /// Hub address, overriding the config file
        #[arg(long)]
        hub: Option<String>,

        /// Hub port, overriding the config file
        #[arg(long)]
        port: Option<u16>,

        /// Instance (PPA) to create and bridge
        #[arg(long)]
        instance: Option<u32>,

        /// Hardware address for the instance, e.g. 02:00:5e:00:00:01
        #[arg(long)]
        mac: Option<MacAddr>,
    },

    /// Write a default config file (does not overwrite unless --force)
    InitConfig {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved config file path
    PrintConfigPath,
}

impl Command {
    /// `run` with nothing overridden
    pub fn default_run() -> Self {
        Command::Run {
            hub: None,
            port: None,
            instance: None,
            mac: None,
        }
    }
}
