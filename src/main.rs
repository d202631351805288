//! Riskstream command line client
//!
//! Connects to the risk stream backend, prints every event on the chosen
//! topics and exits non-zero once reconnection gives up.

use clap::{Parser, Subcommand, ValueEnum};
use riskstream::observability::{init_default_logging, HealthServer};
use riskstream::protocol::KNOWN_TOPICS;
use riskstream::{
    ClientConfig, ClientNotice, ConnectionState, DomainEvent, RealtimeClient, SubscriberError,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "riskstream")]
#[command(about = "Resilient real-time risk stream client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured endpoint
    #[arg(short, long, env = "RISKSTREAM_ENDPOINT")]
    endpoint: Option<String>,

    /// Serve health and metrics on this port
    #[arg(long, env = "HEALTH_PORT")]
    health_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print events until interrupted
    Watch {
        /// Topic to print (repeatable)
        #[arg(short, long = "topic", value_name = "TOPIC")]
        topics: Vec<String>,

        /// Output format for events
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let mut config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    if let Some(endpoint) = cli.endpoint {
        config.client.endpoint = endpoint;
    }

    let result = match cli.command {
        Commands::Watch { topics, format } => watch(config, topics, format, cli.health_port).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in ["riskstream.toml", "config/riskstream.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(ClientConfig::default())
}

async fn watch(
    config: ClientConfig,
    topics: Vec<String>,
    format: OutputFormat,
    health_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let mut client = RealtimeClient::new(config)?;

    let topics = if topics.is_empty() {
        KNOWN_TOPICS.iter().map(|topic| topic.to_string()).collect()
    } else {
        topics
    };
    for topic in &topics {
        client.subscribe(topic, move |event: &DomainEvent| -> Result<(), SubscriberError> {
            print_event(event, format)
        })?;
    }
    info!(topics = ?topics, "Subscribed");

    if let Some(port) = health_port {
        let server = Arc::new(HealthServer::new(
            &client.config().client.endpoint,
            port,
            client.status_receiver(),
            client.metrics_handle(),
        ));
        tokio::spawn(server.start());
    }

    let mut notices = client.notices();
    client.connect_configured()?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let outcome = loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break Ok(());
            }
            notice = notices.recv() => match notice {
                Ok(ClientNotice::AttemptsExhausted { attempts, last_failure }) => {
                    break Err(format!(
                        "gave up after {attempts} attempts, last failure: {last_failure}"
                    ));
                }
                Ok(ClientNotice::StateChanged { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed lifecycle notices");
                    if client.state() == ConnectionState::Failed {
                        break Err("connection failed permanently".to_string());
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break Err("client stopped unexpectedly".to_string());
                }
            }
        }
    };

    client.shutdown().await;
    outcome.map_err(Into::into)
}

fn print_event(event: &DomainEvent, format: OutputFormat) -> Result<(), SubscriberError> {
    match format {
        OutputFormat::Json => {
            let line = serde_json::to_string(event)
                .map_err(|e| SubscriberError::new(format!("cannot encode event: {e}")))?;
            println!("{line}");
        }
        OutputFormat::Text => println!("[{}] {}", event.topic, event.payload),
    }
    Ok(())
}

fn handle_config_command(
    config: ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
