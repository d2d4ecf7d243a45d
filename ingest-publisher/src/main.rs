//! Publish scraped candidate records onto the product events topic.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tracing::{error, info};

use ingest_common::cache::RedisClient;
use ingest_common::log::kafka::TransactionalKafkaLog;
use ingest_common::metrics::{serve, setup_metrics_recorder, setup_service_router};
use ingest_common::time::SystemTime;
use ingest_publisher::config::Config;
use ingest_publisher::fingerprint::FingerprintStore;
use ingest_publisher::input::parse_ndjson;
use ingest_publisher::publisher::{EventPublisher, PublishSummary};

async fn read_input(path: Option<&str>) -> Result<String> {
    let mut input = String::new();
    match path {
        Some(path) => {
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open input file {path}"))?
                .read_to_string(&mut input)
                .await
                .with_context(|| format!("failed to read input file {path}"))?;
        }
        None => {
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("failed to read candidate records from stdin")?;
        }
    }
    Ok(input)
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
    let router = setup_service_router("ingest-publisher", liveness.clone(), recorder);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = %e, "failed to serve health and metrics endpoints");
        }
    });

    let log = Arc::new(
        TransactionalKafkaLog::new(
            &config.kafka,
            config.transactional_id.as_str(),
            config.batch_timeout.0,
            kafka_liveness,
        )
        .context("failed to create transactional Kafka producer")?,
    );
    let redis = RedisClient::new(config.redis_url.clone())
        .await
        .context("failed to connect to redis")?;

    let publisher = Arc::new(EventPublisher::new(
        log.clone(),
        FingerprintStore::new(Arc::new(redis), config.fingerprint_ttl_secs),
        config.product_topic.as_str().to_owned(),
        config.batch_size,
        config.batch_timeout.0,
        Arc::new(SystemTime {}),
    ));

    let input = read_input(config.input_path.as_deref()).await?;
    let batches = parse_ndjson(
        &input,
        config.default_source.as_ref().map(|s| s.as_str()),
    );
    info!(
        sources = batches.by_source.len(),
        rejected = batches.rejected,
        "read candidate records"
    );

    // One task per source, sources do not share partitions
    let mut tasks = JoinSet::new();
    for (source, records) in batches.by_source {
        let publisher = publisher.clone();
        tasks.spawn(async move {
            let summary = publisher.publish(&source, records).await;
            (source, summary)
        });
    }

    let mut totals = PublishSummary {
        failed: batches.rejected,
        ..Default::default()
    };
    while let Some(joined) = tasks.join_next().await {
        let (source, summary) = match joined {
            Ok(published) => published,
            // Other sources keep publishing, their batches are independent
            Err(e) => {
                error!(error = %e, "publish task failed");
                continue;
            }
        };
        info!(
            source = %source,
            success = summary.success,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "source published"
        );
        totals += summary;
    }

    log.flush(Duration::from_secs(30))
        .await
        .context("failed to flush Kafka producer")?;

    info!(
        success = totals.success,
        duplicates = totals.duplicates,
        failed = totals.failed,
        "publishing complete"
    );
    Ok(())
}
