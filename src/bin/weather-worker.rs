//! weather-worker: drains the local_weather queue until told to stop.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use weather_worker::broker::amqp::AmqpConnector;
use weather_worker::broker::{Channel, Connection, Connector, QueueSpec};
use weather_worker::config::Config;
use weather_worker::config::secrets::redact_url;
use weather_worker::processor::SimulatedWork;
use weather_worker::signal::termination_signal;
use weather_worker::telemetry::{TelemetryConfig, init_telemetry};
use weather_worker::worker::{Worker, WorkerSettings};

#[derive(Parser)]
#[command(name = "weather-worker", about = "Consume and acknowledge local weather reports")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker until SIGINT or SIGTERM (default)
    Serve {
        /// Queue to consume instead of the configured one
        #[arg(long)]
        queue: Option<String>,
    },
    /// Publish one message to the queue, declaring it first
    Publish {
        /// Message body, sent as-is
        payload: String,
        /// Queue to publish to instead of the configured one
        #[arg(long)]
        queue: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "weather-worker".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    match cli.command.unwrap_or(Command::Serve { queue: None }) {
        Command::Serve { queue } => {
            if let Some(queue) = queue {
                config.queue_name = queue;
            }
            cmd_serve(config).await
        }
        Command::Publish { payload, queue } => {
            if let Some(queue) = queue {
                config.queue_name = queue;
            }
            cmd_publish(config, payload).await
        }
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    info!(
        broker = %redact_url(&config.amqp_url),
        queue = %config.queue_name,
        work_delay_ms = config.work_delay.as_millis() as u64,
        "starting worker"
    );

    let mut worker = Worker::builder(AmqpConnector::new(config.amqp_url.clone()))
        .settings(WorkerSettings::from(&config))
        .processor(SimulatedWork::new(config.work_delay))
        .build();

    let signal = async {
        let signal = termination_signal().await;
        info!(%signal, "termination requested");
    };

    match worker.run_until(signal).await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(error = %e, "worker failed");
            Err(e.into())
        }
    }
}

async fn cmd_publish(config: Config, payload: String) -> anyhow::Result<()> {
    let connection = AmqpConnector::new(config.amqp_url.clone())
        .connection_name("weather-worker-publish")
        .connect()
        .await?;
    let channel = connection.open_channel().await?;
    channel
        .declare_queue(&QueueSpec::durable(&config.queue_name))
        .await?;
    channel
        .publish(&config.queue_name, payload.as_bytes())
        .await?;
    println!("Message sent to queue '{}'", config.queue_name);

    channel.close().await?;
    connection.close().await?;
    Ok(())
}
