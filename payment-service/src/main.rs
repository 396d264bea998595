use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use payment_service::{PaymentSaga, SimulatedGateway};
use shared::config::{DatabaseArgs, KafkaArgs};
use shared::store::PgStore;
use shared::{db, metrics, telemetry, JobPublisher, Queue, RetryPolicy, Worker};
use tracing::info;

#[derive(Parser)]
#[command(name = "payment-service")]
struct Args {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9103")]
    metrics_addr: SocketAddr,

    /// Share of charges the simulated gateway approves.
    #[arg(long, env = "PAYMENT_SUCCESS_RATE", default_value_t = 0.8)]
    success_rate: f64,

    #[arg(long, env = "GATEWAY_TIMEOUT_SECS", default_value_t = 10)]
    gateway_timeout_secs: u64,

    #[arg(long, env = "SAGA_MAX_RETRIES", default_value_t = shared::retry::SAGA_MAX_RETRIES)]
    saga_max_retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let args = Args::parse();

    db::run_migrations(&args.database.database_url)?;
    let pool = db::build_pool(&args.database).await?;
    let store = Arc::new(PgStore::new(pool));

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()?;
    metrics::register();

    let publisher: Arc<dyn JobPublisher> = Arc::new(args.kafka.publisher()?);
    let consumer = args.kafka.consumer("payment-service", Queue::Payment)?;
    let saga = PaymentSaga::new(
        Arc::new(SimulatedGateway::new(args.success_rate)),
        store,
        Duration::from_secs(args.gateway_timeout_secs),
    );
    let worker = Worker::new(
        Queue::Payment,
        saga,
        publisher,
        RetryPolicy::new(args.saga_max_retries),
    );

    info!("Payment service started");
    worker.run(consumer).await;

    Ok(())
}
