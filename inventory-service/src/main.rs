use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use inventory_service::TicketSaga;
use metrics_exporter_prometheus::PrometheusBuilder;
use shared::config::{DatabaseArgs, KafkaArgs};
use shared::store::PgStore;
use shared::{db, metrics, telemetry, JobPublisher, Queue, RetryPolicy, Worker};
use tracing::info;

#[derive(Parser)]
#[command(name = "inventory-service")]
struct Args {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9102")]
    metrics_addr: SocketAddr,

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
    let consumer = args.kafka.consumer("inventory-service", Queue::Ticket)?;
    let worker = Worker::new(
        Queue::Ticket,
        TicketSaga::new(store),
        publisher,
        RetryPolicy::new(args.saga_max_retries),
    );

    info!("Inventory service started");
    worker.run(consumer).await;

    Ok(())
}
