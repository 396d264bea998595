use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use notification_service::{BookingConfirmedMailer, DeadLetterAlert, SimulatedMailer};
use shared::config::KafkaArgs;
use shared::{telemetry, JobPublisher, Queue, RetryPolicy, Worker};
use tracing::info;

#[derive(Parser)]
#[command(name = "notification-service")]
struct Args {
    #[command(flatten)]
    kafka: KafkaArgs,

    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9104")]
    metrics_addr: SocketAddr,

    /// Share of sends the simulated mailer fails.
    #[arg(long, env = "MAIL_FAILURE_RATE", default_value_t = 0.1)]
    mail_failure_rate: f64,

    #[arg(long, env = "MAIL_TIMEOUT_SECS", default_value_t = 10)]
    mail_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let args = Args::parse();

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()?;
    shared::metrics::register();

    let publisher: Arc<dyn JobPublisher> = Arc::new(args.kafka.publisher()?);

    let email_consumer = args.kafka.consumer("notification-service", Queue::Email)?;
    let email_worker = Worker::new(
        Queue::Email,
        BookingConfirmedMailer::new(
            Arc::new(SimulatedMailer::new(args.mail_failure_rate)),
            Duration::from_secs(args.mail_timeout_secs),
        ),
        publisher.clone(),
        RetryPolicy::notifications(),
    );
    tokio::spawn(async move {
        email_worker.run(email_consumer).await;
    });

    let saga_alerts = args
        .kafka
        .consumer("notification-service-saga-alerts", Queue::SagaDeadLetter)?;
    let saga_alert_worker = Worker::new(
        Queue::SagaDeadLetter,
        DeadLetterAlert,
        publisher.clone(),
        RetryPolicy::none(),
    );
    tokio::spawn(async move {
        saga_alert_worker.run(saga_alerts).await;
    });

    let email_alerts = args
        .kafka
        .consumer("notification-service-email-alerts", Queue::EmailDeadLetter)?;
    let email_alert_worker = Worker::new(Queue::EmailDeadLetter, DeadLetterAlert, publisher, RetryPolicy::none());

    info!("Notification service started");
    email_alert_worker.run(email_alerts).await;

    Ok(())
}
