//! Consume product events into the canonical store, exactly once per event.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use health::HealthRegistry;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ingest_common::cache::RedisClient;
use ingest_common::dead_letter::DeadLetterRouter;
use ingest_common::ledger::PgOffsetLedger;
use ingest_common::log::kafka::{KafkaAppender, KafkaReaderFactory};
use ingest_common::metrics::{serve, setup_metrics_recorder, setup_service_router};
use ingest_common::retry::RetryPolicy;
use ingest_common::store::PgStore;
use ingest_common::time::SystemTime;
use ingest_processor::config::Config;
use ingest_processor::consumer::{AssignmentContext, ConsumerGroup};
use ingest_processor::idempotency::IdempotencyCache;
use ingest_processor::processor::{IdempotentProcessor, ProcessorSettings};
use ingest_processor::supervisor::{PartitionSupervisor, WorkerTokens};
use ingest_processor::worker::WorkerSettings;

async fn shutdown_signal(shutdown: CancellationToken) {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "failed to register SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = signal::ctrl_c() => {},
    };

    info!("shutting down gracefully...");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let liveness = HealthRegistry::new("liveness");
    let kafka_liveness = liveness
        .register("kafka".to_string(), time::Duration::seconds(30))
        .await;

    let recorder = if config.export_prometheus {
        Some(setup_metrics_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };
    let router = setup_service_router("ingest-processor", liveness.clone(), recorder);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = %e, "failed to serve health and metrics endpoints");
        }
    });

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the canonical store")?;
    if config.run_migrations {
        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
    }
    let store = Arc::new(PgStore::from_pool(pool.clone()));
    let ledger = Arc::new(PgOffsetLedger::from_pool(pool));

    let redis = RedisClient::new(config.redis_url.clone())
        .await
        .context("failed to connect to redis")?;

    let clock = Arc::new(SystemTime {});
    let dead_letter_log = Arc::new(
        KafkaAppender::new(&config.kafka, kafka_liveness)
            .context("failed to create dead-letter producer")?,
    );
    let dead_letter = DeadLetterRouter::new(
        dead_letter_log.clone(),
        config.dead_letter_topic.as_str().to_owned(),
        config.dead_letter_timeout.0,
        clock.clone(),
    );

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );
    let processor = Arc::new(IdempotentProcessor::new(
        store,
        IdempotencyCache::new(Arc::new(redis), config.idempotency_ttl_secs),
        dead_letter,
        config.consumer_group.as_str().to_owned(),
        ProcessorSettings {
            max_attempts: config.max_attempts,
            apply_timeout: config.apply_timeout.0,
            retry_policy,
        },
        clock,
    ));

    let tokens = WorkerTokens::default();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let group = ConsumerGroup::new(
        &config.kafka,
        config.consumer_group.as_str(),
        config.product_topic.as_str(),
        AssignmentContext::new(tokens.clone(), events_tx),
    )
    .context("failed to join the consumer group")?;
    let readers = Arc::new(KafkaReaderFactory::new(
        &config.kafka,
        config.consumer_group.as_str(),
        Some(Arc::new(group.progress())),
    ));

    let supervisor = PartitionSupervisor::new(
        readers,
        processor.clone(),
        ledger,
        WorkerSettings {
            batch_size: config.batch_size,
            poll_timeout: config.poll_timeout.0,
            subscription_start: config.subscription_start,
        },
        tokens,
    )
    .with_liveness(liveness.clone())
    .with_restart_interval(config.worker_restart_interval.0);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    tokio::join!(
        group.run(shutdown.clone()),
        supervisor.run(events_rx, shutdown.clone())
    );

    if let Err(e) = dead_letter_log.flush(Duration::from_secs(10)) {
        error!(error = %e, "failed to flush dead-letter producer");
    }

    let stats = processor.stats();
    info!(
        processed = stats.processed,
        duplicates = stats.duplicates,
        failed = stats.failed,
        dead_lettered = stats.dead_lettered,
        "processor stopped"
    );
    Ok(())
}
