use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use booking_service::api;
use booking_service::{BookingReaper, BookingSaga, DispatcherConfig, OutboxDispatcher};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use shared::config::{DatabaseArgs, KafkaArgs};
use shared::store::PgStore;
use shared::{db, metrics, telemetry, JobPublisher, Queue, RetryPolicy, Worker};
use tracing::info;

#[derive(Parser)]
#[command(name = "booking-service")]
struct Args {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,

    #[arg(long, env = "DISPATCH_INTERVAL_MS", default_value_t = 1000)]
    dispatch_interval_ms: u64,

    #[arg(long, env = "OUTBOX_BATCH_SIZE", default_value_t = 100)]
    outbox_batch_size: i64,

    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 30)]
    reconcile_interval_secs: u64,

    /// Age after which a DISPATCHED event is published again.
    #[arg(long, env = "PUBLISH_TIMEOUT_SECS", default_value_t = 60)]
    publish_timeout_secs: i64,

    #[arg(long, env = "REAPER_INTERVAL_SECS", default_value_t = 30)]
    reaper_interval_secs: u64,

    #[arg(long, env = "BOOKING_TTL_SECS", default_value_t = 900)]
    booking_ttl_secs: i64,

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

    let prometheus = PrometheusBuilder::new().install_recorder()?;
    metrics::register();

    let publisher: Arc<dyn JobPublisher> = Arc::new(args.kafka.publisher()?);

    let dispatcher = Arc::new(OutboxDispatcher::new(
        store.clone(),
        publisher.clone(),
        DispatcherConfig {
            batch_size: args.outbox_batch_size,
            publish_timeout: chrono::Duration::seconds(args.publish_timeout_secs),
        },
    ));
    let dispatch_every = Duration::from_millis(args.dispatch_interval_ms);
    let reconcile_every = Duration::from_secs(args.reconcile_interval_secs);
    tokio::spawn(async move {
        dispatcher.run(dispatch_every, reconcile_every).await;
    });

    let reaper = BookingReaper::new(store.clone(), args.outbox_batch_size);
    let reaper_every = Duration::from_secs(args.reaper_interval_secs);
    tokio::spawn(async move {
        reaper.run(reaper_every).await;
    });

    let consumer = args.kafka.consumer("booking-service", Queue::Booking)?;
    let worker = Worker::new(
        Queue::Booking,
        BookingSaga::new(store.clone(), store.clone()),
        publisher,
        RetryPolicy::new(args.saga_max_retries),
    );
    tokio::spawn(async move {
        worker.run(consumer).await;
    });

    let app = api::create_router(api::AppState {
        bookings: store.clone(),
        inventory: store,
        booking_ttl: chrono::Duration::seconds(args.booking_ttl_secs),
        metrics: prometheus,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Booking service listening on port {}", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}
