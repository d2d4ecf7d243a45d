use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    LogAppender, LogError, LogMessage, LogPosition, LogRecord, Partition, PartitionReader,
    ProgressHint, ReaderFactory, TransactionalLog,
};
use crate::config::KafkaConfig;
use crate::metrics_consts::{
    KAFKA_BROKER_REQUESTS_PENDING_GAUGE, KAFKA_BROKER_TX_ERRORS_COUNTER,
    KAFKA_PRODUCER_QUEUE_DEPTH_GAUGE, KAFKA_PRODUCER_QUEUE_DEPTH_LIMIT_GAUGE,
};

// Once the first message of a batch arrived, how long to keep draining the queue
const DRAIN_WINDOW: Duration = Duration::from_millis(10);

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(liveness: HealthHandle) -> Self {
        KafkaContext { liveness }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();

        gauge!(KAFKA_PRODUCER_QUEUE_DEPTH_GAUGE).set(stats.msg_cnt as f64);
        gauge!(KAFKA_PRODUCER_QUEUE_DEPTH_LIMIT_GAUGE).set(stats.msg_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(KAFKA_BROKER_REQUESTS_PENDING_GAUGE, "broker" => id_string.clone())
                .set(stats.outbuf_cnt as f64);
            counter!(KAFKA_BROKER_TX_ERRORS_COUNTER, "broker" => id_string).absolute(stats.txerrs);
        }
    }
}

fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };
    client_config
}

/// Producer settings shared by the transactional and the plain producer.
/// Idempotence is always on: retried sends never duplicate a record in the log.
pub fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = base_config(config);
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("compression.codec", &config.kafka_compression_codec)
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set("enable.idempotence", "true")
        .set("acks", "all");
    client_config
}

/// Consumer settings for partition readers. Only committed transactional
/// records are visible, and nothing is committed automatically.
pub fn consumer_config(config: &KafkaConfig, group_id: &str) -> ClientConfig {
    let mut client_config = base_config(config);
    client_config
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .set("isolation.level", "read_committed");
    client_config
}

fn ping(producer: &FutureProducer<KafkaContext>) -> Result<(), KafkaError> {
    // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
    match producer
        .client()
        .fetch_metadata(None, Timeout::After(Duration::from_secs(10)))
    {
        Ok(metadata) => {
            info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            );
            Ok(())
        }
        Err(error) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", error);
            Err(error)
        }
    }
}

fn classify(error: KafkaError) -> LogError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => LogError::RecordTooLarge,
        _ => LogError::Kafka(error),
    }
}

async fn await_ack(topic: &str, delivery: DeliveryFuture) -> Result<LogPosition, LogError> {
    match delivery.await {
        // Cancelled due to timeout while retrying
        Err(_) => Err(LogError::Timeout),
        Ok(Err((err, _))) => {
            error!(topic, "failed to produce to Kafka: {}", err);
            Err(classify(err))
        }
        Ok(Ok((partition, offset))) => Ok(LogPosition { partition, offset }),
    }
}

fn future_record<'a>(topic: &'a str, record: &'a LogRecord) -> FutureRecord<'a, str, [u8]> {
    FutureRecord {
        topic,
        partition: None,
        payload: Some(record.payload.as_slice()),
        key: record.key.as_deref(),
        timestamp: None,
        headers: None,
    }
}

/// Non-transactional idempotent producer, used for the quarantine topic.
pub struct KafkaAppender {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaAppender {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        let client_config = producer_config(config);
        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext::from(liveness))?;
        ping(&producer)?;
        Ok(Self { producer })
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }
}

#[async_trait]
impl LogAppender for KafkaAppender {
    async fn append(&self, topic: &str, record: LogRecord) -> Result<LogPosition, LogError> {
        let delivery = self
            .producer
            .send_result(future_record(topic, &record))
            .map_err(|(e, _)| classify(e))?;
        await_ack(topic, delivery).await
    }
}

/// Transactional producer: each `append_batch` is one Kafka transaction.
///
/// A producer can only run one transaction at a time, concurrent callers queue
/// on the inner mutex.
///
/// Begin, commit and abort are blocking librdkafka calls, each bounded by
/// `timeout`. A caller's own deadline around `append_batch` cannot cut them
/// short, so the batch can overrun it by up to two of those waits.
pub struct TransactionalKafkaLog {
    state: Mutex<TransactionState>,
    timeout: Duration,
}

struct TransactionState {
    producer: FutureProducer<KafkaContext>,
    // Set while a transaction is open. Still set on entry when the previous
    // caller was dropped mid-batch, e.g. by a timeout.
    open: bool,
}

impl TransactionalKafkaLog {
    pub fn new(
        config: &KafkaConfig,
        transactional_id: &str,
        timeout: Duration,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = producer_config(config);
        client_config.set("transactional.id", transactional_id);
        debug!("rdkafka configuration: {:?}", client_config);

        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext::from(liveness))?;
        ping(&producer)?;
        producer.init_transactions(timeout)?;

        Ok(Self {
            state: Mutex::new(TransactionState {
                producer,
                open: false,
            }),
            timeout,
        })
    }

    pub async fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        let state = self.state.lock().await;
        blocking(|| state.producer.flush(timeout))
    }

    fn abort(&self, state: &mut TransactionState, reason: &LogError) {
        warn!("aborting Kafka transaction: {}", reason);
        if let Err(e) = blocking(|| state.producer.abort_transaction(self.timeout)) {
            error!("failed to abort Kafka transaction: {}", e);
        }
        state.open = false;
    }
}

#[async_trait]
impl TransactionalLog for TransactionalKafkaLog {
    async fn append_batch(
        &self,
        topic: &str,
        records: Vec<LogRecord>,
    ) -> Result<Vec<LogPosition>, LogError> {
        let mut state = self.state.lock().await;
        if state.open {
            let reason = LogError::TransactionAborted("abandoned by a cancelled batch".to_owned());
            self.abort(&mut state, &reason);
        }
        blocking(|| state.producer.begin_transaction()).map_err(classify)?;
        state.open = true;

        // Enqueue sequentially to keep the batch order within each partition
        let mut deliveries = Vec::with_capacity(records.len());
        for record in &records {
            match state.producer.send_result(future_record(topic, record)) {
                Ok(delivery) => deliveries.push(delivery),
                Err((e, _)) => {
                    let err = classify(e);
                    self.abort(&mut state, &err);
                    return Err(err);
                }
            }
        }

        let mut positions = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            match await_ack(topic, delivery).await {
                Ok(position) => positions.push(position),
                Err(err) => {
                    self.abort(&mut state, &err);
                    return Err(err);
                }
            }
        }

        if let Err(e) = blocking(|| state.producer.commit_transaction(self.timeout)) {
            let err = LogError::TransactionAborted(e.to_string());
            self.abort(&mut state, &err);
            return Err(err);
        }
        state.open = false;
        Ok(positions)
    }
}

/// Runs a blocking librdkafka call without stalling the other tasks on this
/// worker thread. A current-thread runtime has nowhere to move them, so the
/// call just blocks there.
fn blocking<T>(call: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(call)
        }
        _ => call(),
    }
}

/// Opens one assign-only consumer per owned partition.
/// Readers run inside tokio tasks, so they keep the default context: the
/// statistics callback would otherwise block the runtime.
pub struct KafkaReaderFactory {
    client_config: ClientConfig,
    hints: Option<Arc<dyn ProgressHint>>,
}

impl KafkaReaderFactory {
    pub fn new(
        config: &KafkaConfig,
        group_id: &str,
        hints: Option<Arc<dyn ProgressHint>>,
    ) -> Self {
        Self {
            client_config: consumer_config(config, &format!("{group_id}-readers")),
            hints,
        }
    }
}

impl ReaderFactory for KafkaReaderFactory {
    fn open(&self, partition: &Partition) -> Result<Box<dyn PartitionReader>, LogError> {
        let consumer: StreamConsumer = self.client_config.create()?;
        Ok(Box::new(KafkaPartitionReader {
            partition: partition.clone(),
            consumer,
            hints: self.hints.clone(),
        }))
    }
}

pub struct KafkaPartitionReader {
    partition: Partition,
    consumer: StreamConsumer,
    hints: Option<Arc<dyn ProgressHint>>,
}

impl KafkaPartitionReader {
    fn to_log_message(&self, message: &impl Message) -> LogMessage {
        LogMessage {
            partition: self.partition.clone(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl PartitionReader for KafkaPartitionReader {
    fn partition(&self) -> &Partition {
        &self.partition
    }

    async fn seek(&mut self, offset: i64) -> Result<(), LogError> {
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(
            self.partition.topic(),
            self.partition.partition_number(),
            Offset::Offset(offset),
        )?;
        self.consumer.assign(&assignment)?;
        debug!(partition = %self.partition, offset, "assigned partition reader");
        Ok(())
    }

    async fn next_batch(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<LogMessage>, LogError> {
        let mut batch = Vec::new();
        match tokio::time::timeout(wait, self.consumer.recv()).await {
            Err(_) => return Ok(batch),
            Ok(received) => batch.push(self.to_log_message(&received?)),
        }

        while batch.len() < max {
            match tokio::time::timeout(DRAIN_WINDOW, self.consumer.recv()).await {
                Err(_) => break,
                Ok(received) => batch.push(self.to_log_message(&received?)),
            }
        }
        Ok(batch)
    }

    fn commit_hint(&self, next_offset: i64) {
        if let Some(hints) = &self.hints {
            hints.record(&self.partition, next_offset);
        }
    }
}
