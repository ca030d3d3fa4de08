use std::net::SocketAddr;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pigeonhole")]
#[command(about = "IP address management service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the IPAM service
    Serve {
        /// Address for the HTTP listener
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Directory holding the database file
        #[arg(long)]
        data_dir: Option<String>,
        /// Keep all state in memory (development only)
        #[arg(long, default_value_t = false)]
        ephemeral: bool,
    },
}
