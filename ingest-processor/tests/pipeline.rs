mod common;

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;

use common::{candidate, CrashingLedger, PartitionDownLedger, Pipeline, DEAD_LETTER_TOPIC, GROUP, TOPIC};
use ingest_common::cache::MockRedisClient;
use ingest_common::dead_letter::DeadLetterRecord;
use ingest_common::event::ProductEvent;
use ingest_common::log::Partition;
use ingest_common::store::{CanonicalProduct, PriceChangeKind, PriceHistory};
use ingest_processor::error::WorkerError;

fn price(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

#[tokio::test]
async fn deck_x_price_drop_is_recorded_once() {
    let pipeline = Pipeline::new(4);
    let fingerprints = MockRedisClient::new();
    let publisher = pipeline.publisher(fingerprints.clone());
    let partition = pipeline.partition_of("shopA");

    let first = publisher
        .publish("shopA", vec![candidate("123", "Deck X", "39.99")])
        .await;
    assert_eq!(first.success, 1);

    // Identical content within the fingerprint TTL is suppressed at the producer
    let repeat = publisher
        .publish("shopA", vec![candidate("123", "Deck X", "39.99")])
        .await;
    assert_eq!(repeat.duplicates, 1);
    assert_eq!(pipeline.log.messages(TOPIC).len(), 1);

    let discounted = publisher
        .publish("shopA", vec![candidate("123", "Deck X", "34.99")])
        .await;
    assert_eq!(discounted.success, 1);

    pipeline
        .run_worker(&partition, pipeline.ledger.clone())
        .await
        .unwrap();

    let products = pipeline.store.products();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].source, "shopA");
    assert_eq!(products[0].external_id, "123");
    assert_eq!(products[0].sale_price, price("34.99"));

    let history = pipeline.store.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].change_kind, PriceChangeKind::SaleStarted);
    assert_eq!(history[0].sale_price, price("34.99"));
    assert_eq!(pipeline.ledger.get(GROUP, &partition), Some(1));
}

#[tokio::test]
async fn fingerprint_cache_outage_only_costs_duplicates() {
    let pipeline = Pipeline::new(1);
    let publisher = pipeline.publisher(MockRedisClient::unreachable());
    let partition = pipeline.partition_of("shopA");

    for _ in 0..2 {
        let summary = publisher
            .publish("shopA", vec![candidate("123", "Deck X", "39.99")])
            .await;
        assert_eq!(summary.success, 1);
    }
    assert_eq!(pipeline.log.messages(TOPIC).len(), 2);

    pipeline
        .run_worker(&partition, pipeline.ledger.clone())
        .await
        .unwrap();

    // Both events applied, the canonical state is the same as with one
    assert_eq!(pipeline.store.products().len(), 1);
    assert!(pipeline.store.history().is_empty());
    assert!(pipeline.log.messages(DEAD_LETTER_TOPIC).is_empty());
}

#[tokio::test]
async fn redelivered_log_is_applied_once() {
    let pipeline = Pipeline::new(1);
    let partition = Partition::new(TOPIC, 0);
    let publisher = pipeline.publisher(MockRedisClient::new());
    publisher
        .publish(
            "shopA",
            vec![
                candidate("1", "Deck X", "39.99"),
                candidate("2", "Truck Y", "54.00"),
            ],
        )
        .await;

    // The same bytes appended again, as after a producer retry outside a transaction
    for message in pipeline.log.partition_messages(&partition) {
        pipeline
            .log
            .append_raw(TOPIC, 0, message.key.as_deref(), &message.payload);
    }

    pipeline
        .run_worker(&partition, pipeline.ledger.clone())
        .await
        .unwrap();

    assert_eq!(pipeline.store.applies(), 2);
    assert_eq!(pipeline.processor.stats().duplicates, 2);
    assert_eq!(pipeline.ledger.get(GROUP, &partition), Some(3));
}

/// Reference events: inserts, a price drop, a sold out and a restock.
fn scenario_events(source: &str) -> Vec<Vec<u8>> {
    let records = [
        ("1", "Deck X", "39.99", "in_stock"),
        ("2", "Truck Y", "54.00", "in_stock"),
        ("1", "Deck X", "34.99", "in_stock"),
        ("1", "Deck X", "34.99", "out_of_stock"),
        ("2", "Truck Y", "49.00", "in_stock"),
        ("1", "Deck X", "39.99", "in_stock"),
    ];
    records
        .iter()
        .enumerate()
        .map(|(i, (external_id, title, sale_price, availability))| {
            let mut candidate = candidate(external_id, title, sale_price);
            candidate.availability = serde_json::from_value(serde_json::json!(availability)).ok();
            let normalized = candidate.normalize(source).unwrap();
            let event = ProductEvent::new(
                normalized,
                uuid::Uuid::now_v7(),
                common::NOW_MILLIS + i as i64,
            );
            event.to_bytes().unwrap()
        })
        .collect()
}

fn scenario(pipeline: &Pipeline) -> Partition {
    for payload in scenario_events("shopA") {
        pipeline.log.append_raw(TOPIC, 0, Some("shopA"), &payload);
    }
    Partition::new(TOPIC, 0)
}

fn canonical_state(pipeline: &Pipeline) -> Vec<(String, Decimal, String)> {
    pipeline
        .store
        .products()
        .into_iter()
        .map(|p: CanonicalProduct| (p.external_id, p.sale_price, p.availability))
        .collect()
}

#[tokio::test]
async fn exactly_once_across_every_crash_point() {
    let reference = Pipeline::new(1);
    let partition = scenario(&reference);
    reference
        .run_worker(&partition, reference.ledger.clone())
        .await
        .unwrap();
    let expected_state = canonical_state(&reference);
    let expected_history = reference.store.history().len();
    assert_eq!(reference.store.applies(), 6);
    assert_eq!(expected_history, 4);

    for crash_at in 0..6 {
        for lose_cache in [false, true] {
            let pipeline = Pipeline::new(1);
            // Same bytes, same event ids as the reference run
            for message in reference.log.partition_messages(&partition) {
                pipeline
                    .log
                    .append_raw(TOPIC, 0, message.key.as_deref(), &message.payload);
            }

            let crashing = Arc::new(CrashingLedger::new(pipeline.ledger.clone(), crash_at));
            let crashed = pipeline.run_worker(&partition, crashing).await;
            assert!(matches!(crashed, Err(WorkerError::Ledger(_))));

            if lose_cache {
                pipeline.cache.clear();
            }
            let resumed = pipeline
                .run_worker(&partition, pipeline.ledger.clone())
                .await
                .unwrap();

            assert_eq!(resumed, Some(5), "crash at {crash_at}");
            assert_eq!(pipeline.store.applies(), 6, "crash at {crash_at}");
            assert_eq!(canonical_state(&pipeline), expected_state);
            assert_eq!(pipeline.store.history().len(), expected_history);

            // The ledger only ever moved forward
            let offsets: Vec<i64> = pipeline
                .ledger
                .commits()
                .iter()
                .map(|commit| commit.offset)
                .collect();
            assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]), "{offsets:?}");
        }
    }
}

#[tokio::test]
async fn offsets_recorded_with_the_store_write() {
    let reference = Pipeline::new(1);
    let partition = scenario(&reference);

    let pipeline = Pipeline::transactional(1);
    for message in reference.log.partition_messages(&partition) {
        pipeline
            .log
            .append_raw(TOPIC, 0, message.key.as_deref(), &message.payload);
    }

    // One ledger write per event, all made by the store
    let crashing = Arc::new(CrashingLedger::new(pipeline.ledger.clone(), 0));
    let result = pipeline.run_worker(&partition, crashing).await;
    assert_eq!(result.unwrap(), Some(5));
    assert_eq!(pipeline.ledger.commits().len(), 6);
}

#[tokio::test]
async fn poison_message_does_not_block_the_partition() {
    let pipeline = Pipeline::new(1);
    let partition = Partition::new(TOPIC, 0);
    let publisher = pipeline.publisher(MockRedisClient::new());

    publisher
        .publish("shopA", vec![candidate("1", "Deck X", "39.99")])
        .await;
    pipeline
        .log
        .append_raw(TOPIC, 0, Some("shopA"), b"{\"event_id\": \"not-a-uuid\"}");
    publisher
        .publish("shopA", vec![candidate("2", "Truck Y", "54.00")])
        .await;

    pipeline
        .run_worker(&partition, pipeline.ledger.clone())
        .await
        .unwrap();

    assert_eq!(pipeline.store.products().len(), 2);
    assert_eq!(pipeline.ledger.get(GROUP, &partition), Some(2));

    let quarantined = pipeline.log.messages(DEAD_LETTER_TOPIC);
    assert_eq!(quarantined.len(), 1);
    let record: DeadLetterRecord = serde_json::from_slice(&quarantined[0].payload).unwrap();
    assert_eq!(record.offset, 1);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.error_type, "malformed_payload");
}

#[tokio::test]
async fn dead_letter_outage_still_advances() {
    let pipeline = Pipeline::new(1);
    let partition = Partition::new(TOPIC, 0);
    pipeline.log.append_raw(TOPIC, 0, Some("shopA"), b"garbage");
    pipeline.log.set_unavailable(true);

    pipeline
        .run_worker(&partition, pipeline.ledger.clone())
        .await
        .unwrap();

    assert_eq!(pipeline.ledger.get(GROUP, &partition), Some(0));
    assert_eq!(pipeline.processor.stats().dead_lettered, 1);
}

#[tokio::test]
async fn partitions_fail_independently() {
    let pipeline = Pipeline::new(2);
    let healthy = Partition::new(TOPIC, 0);
    let broken = Partition::new(TOPIC, 1);
    let publisher = pipeline.publisher(MockRedisClient::new());
    publisher
        .publish("shopA", vec![candidate("1", "Deck X", "39.99")])
        .await;
    for message in pipeline.log.messages(TOPIC) {
        let target = 1 - message.partition.partition_number();
        pipeline
            .log
            .append_raw(TOPIC, target, message.key.as_deref(), &message.payload);
    }

    let ledger = Arc::new(PartitionDownLedger {
        inner: pipeline.ledger.clone(),
        down: broken.clone(),
    });
    let (broken_result, healthy_result) = tokio::join!(
        pipeline.run_worker(&broken, ledger.clone()),
        pipeline.run_worker(&healthy, ledger.clone()),
    );

    assert!(matches!(broken_result, Err(WorkerError::Ledger(_))));
    assert_eq!(healthy_result.unwrap(), Some(0));
    assert_eq!(pipeline.ledger.get(GROUP, &healthy), Some(0));
    assert_eq!(pipeline.ledger.get(GROUP, &broken), None);
}

#[tokio::test]
async fn unreadable_ledger_stops_the_worker_before_reading() {
    let pipeline = Pipeline::new(1);
    let partition = Partition::new(TOPIC, 0);
    pipeline.log.append_raw(TOPIC, 0, Some("shopA"), b"garbage");
    pipeline.ledger.fail_reads(true);

    let result = pipeline
        .run_worker(&partition, pipeline.ledger.clone())
        .await;
    assert!(matches!(result, Err(WorkerError::Ledger(_))));
    assert!(pipeline.log.messages(DEAD_LETTER_TOPIC).is_empty());
}

fn sorted_state(pipeline: &Pipeline) -> (Vec<CanonicalProduct>, Vec<PriceHistory>) {
    let mut products = pipeline.store.products();
    products.sort_by(|a, b| (&a.source, &a.external_id).cmp(&(&b.source, &b.external_id)));
    let mut history = pipeline.store.history();
    history.sort_by(|a, b| {
        (&a.source, &a.external_id, a.event_id).cmp(&(&b.source, &b.external_id, b.event_id))
    });
    (products, history)
}

#[tokio::test]
async fn sources_on_different_partitions_do_not_interfere() {
    let shop_a = scenario_events("shopA");
    let shop_b = scenario_events("shopB");
    let first = Partition::new(TOPIC, 0);
    let second = Partition::new(TOPIC, 1);

    // One partition after the other
    let reference = Pipeline::new(2);
    for payload in &shop_a {
        reference.log.append_raw(TOPIC, 0, Some("shopA"), payload);
    }
    for payload in &shop_b {
        reference.log.append_raw(TOPIC, 1, Some("shopB"), payload);
    }
    reference
        .run_worker(&first, reference.ledger.clone())
        .await
        .unwrap();
    reference
        .run_worker(&second, reference.ledger.clone())
        .await
        .unwrap();
    let expected = sorted_state(&reference);
    assert_eq!(expected.0.len(), 4);
    assert_eq!(expected.1.len(), 8);

    for alternate in [false, true] {
        let pipeline = Pipeline::new(2);
        if alternate {
            for (a, b) in shop_a.iter().zip(&shop_b) {
                pipeline.log.append_raw(TOPIC, 1, Some("shopB"), b);
                pipeline.log.append_raw(TOPIC, 0, Some("shopA"), a);
            }
        } else {
            for payload in &shop_a {
                pipeline.log.append_raw(TOPIC, 0, Some("shopA"), payload);
            }
            for payload in &shop_b {
                pipeline.log.append_raw(TOPIC, 1, Some("shopB"), payload);
            }
        }

        let (a, b) = if alternate {
            let (b, a) = tokio::join!(
                pipeline.run_worker(&second, pipeline.ledger.clone()),
                pipeline.run_worker(&first, pipeline.ledger.clone()),
            );
            (a, b)
        } else {
            tokio::join!(
                pipeline.run_worker(&first, pipeline.ledger.clone()),
                pipeline.run_worker(&second, pipeline.ledger.clone()),
            )
        };

        assert_eq!(a.unwrap(), Some(5), "alternate {alternate}");
        assert_eq!(b.unwrap(), Some(5), "alternate {alternate}");
        assert_eq!(sorted_state(&pipeline), expected, "alternate {alternate}");
        assert_eq!(pipeline.store.applies(), 12);
    }
}
