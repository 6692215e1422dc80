use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use message_relay::{
    cli::{ClientArgs, Cli, Command, ServerArgs},
    client::{self, Client},
    config::{self, ResolvedConfig},
    handler::Services,
    relay::Relay,
    sink::LogSink,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Diagnostics go to stderr so the client's stdout carries only the conversation.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let ResolvedConfig { config, warning } = config::load_server_config(&args.config);
    if let Some(warning) = warning {
        warn!("{warning}");
    }

    let services = Services::new(LogSink::from_config(&config));
    let relay = Relay::bind(config, services).await?;
    let addr = relay.local_addr()?;
    info!("relay listening on {}", addr);

    relay.run_until_ctrl_c().await;
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let (host, port) = match &args.config {
        Some(path) => {
            let config = config::load_client_config(path)?;
            (config.server_host, config.server_port)
        }
        None => (args.host.clone(), args.port),
    };

    let mut client = Client::connect(&host, port, args.options()).await?;
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    tokio::select! {
        result = client::run_interactive(&mut client, &mut stdin, &mut stdout) => result?,
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
            info!("interrupted");
        }
    }

    client.close().await;
    println!("connection closed");
    Ok(())
}
