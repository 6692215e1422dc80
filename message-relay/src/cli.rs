use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    client::ClientOptions,
    config::{DEFAULT_HOST, DEFAULT_PORT},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, recording every received message.
    Server(ServerArgs),
    /// Connect to a relay and send messages interactively.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// JSON configuration file. A missing or malformed file falls back to defaults.
    #[arg(long, default_value = "server_config.json")]
    pub config: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// JSON file with `server_host` and `server_port`; overrides --host and --port.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Relay host name or address.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Relay port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Seconds to wait for the connection to be established.
    #[arg(long, default_value_t = 5)]
    pub connect_timeout: u64,

    /// Seconds to wait for each reply.
    #[arg(long, default_value_t = 5)]
    pub read_timeout: u64,
}

impl ClientArgs {
    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            read_timeout: Duration::from_secs(self.read_timeout),
        }
    }
}
