//! CLI for mmw
//!
//! Subcommands:
//! - `server`: run the broker
//! - `publish`: connect, publish one message, tear down
//! - `subscribe`: connect and print messages until interrupted

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use mmw::{
    Broker, Discovery, Message, Persistence, PublishReceipt, Reliability, Session,
    load_config, start_broker_server,
};

#[derive(Parser)]
#[command(name = "mmw", about = "Topic-based publish/subscribe messaging")]
struct Cli {
    /// Log verbosity: off, error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start the broker
    Server {
        /// Configuration file path
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Publish one message and exit
    Publish {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 5000)]
        port: u16,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        message: String,
        /// Wait for subscriber acknowledgments
        #[arg(long)]
        reliable: bool,
    },
    /// Subscribe and print messages until interrupted
    Subscribe {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 5000)]
        port: u16,
        #[arg(long)]
        topic: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    mmw::utils::logging::init(&cli.log_level);

    match cli.command {
        Command::Server { config } => {
            if let Err(e) = run_server(config).await {
                error!("broker failed: {e}");
            }
        }
        Command::Publish {
            host,
            port,
            topic,
            message,
            reliable,
        } => {
            if let Err(e) = run_publish(host, port, topic, message, reliable).await {
                error!("publish failed: {e}");
            }
        }
        Command::Subscribe { host, port, topic } => {
            if let Err(e) = run_subscribe(host, port, topic).await {
                error!("subscribe failed: {e}");
            }
        }
    }
}

async fn run_server(config: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config(config.as_deref())?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    let broker = if settings.broker.retain_messages {
        let persistence = Persistence::new(
            "mmw_db",
            Some(settings.broker.message_ttl_secs as i64),
            Some(settings.broker.max_messages_per_topic),
        )?;
        Arc::new(Broker::new_with_persistence(settings.broker.clone(), persistence))
    } else {
        Arc::new(Broker::new(settings.broker.clone()))
    };

    let listener = TcpListener::bind(&addr).await?;
    tokio::spawn(Broker::start_retry_loop(broker.clone()));

    tokio::select! {
        _ = start_broker_server(listener, broker) => {
            error!("broker server exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, exiting");
        }
    }
    Ok(())
}

async fn run_publish(
    host: String,
    port: u16,
    topic: String,
    message: String,
    reliable: bool,
) -> mmw::Result<()> {
    let session = Session::initialize(Discovery::Endpoint { host, port }).await?;
    let publisher = session.create_publisher(&topic).await?;

    let reliability = if reliable {
        Reliability::Reliable
    } else {
        Reliability::BestEffort
    };
    match publisher.publish(Bytes::from(message.into_bytes()), reliability).await? {
        PublishReceipt::Sent => info!("message sent"),
        PublishReceipt::Acknowledged { delivered, failed } => {
            info!("delivered to {delivered} subscriber(s), {failed} unacknowledged");
        }
    }

    publisher.close();
    session.cleanup().await
}

async fn run_subscribe(host: String, port: u16, topic: String) -> mmw::Result<()> {
    let session = Session::initialize(Discovery::Endpoint { host, port }).await?;
    let subscriber = session
        .create_subscriber(&topic, |message: Message| {
            println!(
                "[{}] {}",
                message.topic,
                String::from_utf8_lossy(&message.payload)
            );
        })
        .await?;

    info!("waiting for messages on '{}', ctrl-c to exit", subscriber.topic());
    let _ = tokio::signal::ctrl_c().await;

    session.cleanup().await
}
