//! Heartwire - fixed-width packet protocol with heartbeat-driven connections
//!
//! Runs either end of the wire: a server that tracks its clients and
//! broadcasts heartbeats, or a client that reconnects with backoff and
//! notices a silent server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use heartwire::config::{self, Config};
use heartwire::network::{Client, ClientEvent, Server};
use heartwire::protocol::PacketSet;

/// Heartwire - heartbeat protocol server and client
#[derive(Parser)]
#[command(name = "heartwire")]
#[command(author = "Heartwire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Fixed-width packet protocol with heartbeat-driven connections", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Server {
        /// Address to bind to
        #[arg(long)]
        bind_addr: Option<String>,

        /// Port to bind to
        #[arg(long)]
        bind_port: Option<u16>,
    },

    /// Run a client against a server
    Client {
        /// Server hostname or address
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server {
            bind_addr,
            bind_port,
        } => {
            if let Some(addr) = bind_addr {
                config.server.bind_address = addr;
            }
            if let Some(port) = bind_port {
                config.server.port = port;
            }
            run_server(config).await?;
        }
        Commands::Client { host, port } => {
            if let Some(host) = host {
                config.client.host = host;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            run_client(config).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the server until Ctrl+C
async fn run_server(config: Config) -> anyhow::Result<()> {
    let server = Server::bind(&config.server, &config.protocol).await?;
    let shutdown = server.shutdown_handle();

    tracing::info!(
        "Heartbeat every {} ms (protocol {}, type {})",
        config.server.heartbeat_interval_ms,
        config.protocol.protocol_id,
        config.protocol.heartbeat_type
    );

    let mut handle = tokio::spawn(server.run());

    tokio::select! {
        result = &mut handle => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            let _ = shutdown.send(()).await;
            handle.await??;
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Run the client until Ctrl+C or until the session halts
async fn run_client(config: Config) -> anyhow::Result<()> {
    let packets = PacketSet::new(config.protocol.protocol_id);
    let mut client = Client::new(&config.client, &config.protocol, packets)?;

    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("client event receiver already taken"))?;
    let shutdown = client.shutdown_handle();
    let handle = tokio::spawn(client.run());

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    ClientEvent::Connected { server } => {
                        println!("Connected to {}", server);
                    }
                    ClientEvent::RetryScheduled { delay } => {
                        println!("Server unavailable, retrying in {}s", delay.as_secs());
                    }
                    ClientEvent::Heartbeat => {
                        tracing::debug!("server alive");
                    }
                    ClientEvent::Packet(packet) => {
                        tracing::info!("Packet {} received", packet.kind().name());
                    }
                    ClientEvent::ConnectionLost => {
                        println!("Connection to server lost");
                    }
                    ClientEvent::Error { message } => {
                        tracing::error!("Client error: {}", message);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                let _ = shutdown.send(()).await;
                break;
            }
        }
    }

    handle.await??;
    tracing::info!("Client stopped");

    Ok(())
}
