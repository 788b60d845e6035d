use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use switchmq::{
    config::Config,
    consumer::Consumer,
    exchange::{ExchangeKind, TOPIC_EXCHANGE},
    filter::SELECTOR_ARGUMENT,
    message::{Headers, Message, Metadata, ORIGIN_EXCHANGE_HEADER, ORIGIN_QUEUE_HEADER},
    queue::{Queue, DEAD_LETTER_QUEUE},
    store::MemoryBackend,
    transaction::Xid,
    Broker,
};
use tokio::time::timeout;

fn config() -> Config {
    Config {
        delivery_workers: Some(2),
        idle_delay_ms: Some(5),
        expiry_interval_ms: Some(5),
        ..Default::default()
    }
}

async fn setup() -> (Broker, MemoryBackend) {
    let backend = MemoryBackend::new();
    let broker = Broker::builder()
        .backend(Arc::new(backend.clone()))
        .config(config())
        .build()
        .unwrap();
    broker.activate().await.unwrap();

    (broker, backend)
}

async fn durable_queue(broker: &Broker, name: &str) {
    broker
        .create_queue(Queue::builder().name(name).durable(true).build())
        .await
        .unwrap();
}

fn persistent(exchange: &str, routing_key: &str, body: &'static str) -> Message {
    Message::new(
        Metadata::builder()
            .exchange(exchange)
            .routing_key(routing_key)
            .persistent(true)
            .build(),
        vec![Bytes::from_static(body.as_bytes())],
    )
}

#[tokio::test]
async fn test_publish_consume_acknowledge() {
    let (broker, backend) = setup().await;
    broker
        .create_exchange("orders", ExchangeKind::Topic)
        .await
        .unwrap();
    durable_queue(&broker, "all-orders").await;
    durable_queue(&broker, "created").await;
    durable_queue(&broker, "billing").await;
    broker
        .bind("orders", "all-orders", "orders.*", Headers::new())
        .await
        .unwrap();
    broker
        .bind("orders", "created", "orders.created", Headers::new())
        .await
        .unwrap();
    broker
        .bind("orders", "billing", "invoices.#", Headers::new())
        .await
        .unwrap();

    let message = persistent("orders", "orders.created", "order 1");
    let id = message.id();
    assert_eq!(broker.publish(message).await.unwrap(), 2);
    broker.flush().await.unwrap();
    assert_eq!(
        backend.message_queues(id),
        vec!["all-orders".to_owned(), "created".to_owned()]
    );

    let (consumer, mut rx) = Consumer::channel("created", false, 4);
    broker.add_consumer(consumer).await.unwrap();
    broker.start_message_delivery().await;

    let delivered = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.id(), id);
    assert_eq!(delivered.queue(), Some("created"));
    assert_eq!(delivered.body(), Some(Bytes::from_static(b"order 1")));

    broker.acknowledge(&delivered).await.unwrap();
    broker.flush().await.unwrap();
    assert_eq!(backend.message_queues(id), vec!["all-orders".to_owned()]);

    let billing = broker.handler("billing").await.unwrap();
    assert_eq!(billing.message_count(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_message_deleted_after_last_acknowledgement() {
    let (broker, backend) = setup().await;
    let queues = ["a", "b", "c"];
    for name in queues {
        durable_queue(&broker, name).await;
        broker
            .bind(TOPIC_EXCHANGE, name, "fanout.#", Headers::new())
            .await
            .unwrap();
    }

    let message = persistent(TOPIC_EXCHANGE, "fanout.event", "shared");
    let id = message.id();
    assert_eq!(broker.publish(message).await.unwrap(), 3);

    for (acked, name) in queues.iter().enumerate() {
        let handler = broker.handler(name).await.unwrap();
        let copy = handler.take_for_delivery().await.unwrap();
        broker.acknowledge(&copy).await.unwrap();
        broker.flush().await.unwrap();

        let remaining = queues.len() - acked - 1;
        assert_eq!(backend.message_queues(id).len(), remaining);
        assert_eq!(backend.contains_message(id), remaining > 0);
    }

    broker.shutdown().await;
}

#[tokio::test]
async fn test_local_transaction_is_atomic() {
    let (broker, backend) = setup().await;
    durable_queue(&broker, "source").await;
    durable_queue(&broker, "target").await;

    let original = persistent("", "source", "work");
    let original_id = original.id();
    broker.publish(original).await.unwrap();
    let source = broker.handler("source").await.unwrap();
    let target = broker.handler("target").await.unwrap();
    let delivered = source.take_for_delivery().await.unwrap();

    let mut transaction = broker.begin();
    transaction
        .dequeue("source", delivered.clone())
        .await
        .unwrap();
    assert_eq!(
        transaction
            .enqueue(persistent("", "target", "result"))
            .await
            .unwrap(),
        1
    );

    transaction.rollback().await.unwrap();
    broker.flush().await.unwrap();
    assert_eq!(target.message_count(), 0);
    assert!(backend.contains_message(original_id));

    transaction
        .dequeue("source", delivered)
        .await
        .unwrap();
    let result = persistent("", "target", "result");
    let result_id = result.id();
    transaction.enqueue(result).await.unwrap();
    transaction.commit().await.unwrap();
    broker.flush().await.unwrap();

    assert_eq!(target.message_count(), 1);
    assert!(!backend.contains_message(original_id));
    assert!(backend.contains_message(result_id));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_prepared_transaction_survives_restart() {
    let (broker, backend) = setup().await;
    durable_queue(&broker, "ledger").await;

    let xid = Xid::new(7, b"global".to_vec(), b"branch".to_vec());
    broker.branch(xid.clone()).unwrap();
    let entry = persistent("", "ledger", "entry");
    let id = entry.id();
    assert_eq!(broker.enqueue(&xid, entry).await.unwrap(), 1);
    broker.prepare(&xid).await.unwrap();
    assert_eq!(broker.recover().await, vec![xid.clone()]);
    broker.shutdown().await;

    let restarted = Broker::builder()
        .backend(Arc::new(backend.clone()))
        .config(config())
        .build()
        .unwrap();
    restarted.activate().await.unwrap();

    assert_eq!(restarted.recover().await, vec![xid.clone()]);
    let ledger = restarted.handler("ledger").await.unwrap();
    assert_eq!(ledger.message_count(), 0);

    restarted.commit(&xid, false).await.unwrap();
    assert_eq!(ledger.message_count(), 1);
    assert!(restarted.recover().await.is_empty());
    assert_eq!(backend.message_queues(id), vec!["ledger".to_owned()]);

    restarted.shutdown().await;
}

#[tokio::test]
async fn test_durable_state_reloads_on_activation() {
    let (broker, backend) = setup().await;
    broker
        .create_exchange("events", ExchangeKind::Topic)
        .await
        .unwrap();
    durable_queue(&broker, "audit").await;
    durable_queue(&broker, "mirror").await;
    broker
        .bind("events", "audit", "#", Headers::new())
        .await
        .unwrap();
    broker
        .bind("events", "mirror", "user.*", Headers::new())
        .await
        .unwrap();
    broker
        .publish(persistent("events", "user.login", "login"))
        .await
        .unwrap();
    broker.shutdown().await;

    let restarted = Broker::builder()
        .backend(Arc::new(backend))
        .config(config())
        .build()
        .unwrap();
    restarted.activate().await.unwrap();

    assert_eq!(restarted.all_bindings_for_exchange("events").await.unwrap().len(), 2);
    let audit = restarted.handler("audit").await.unwrap();
    let mirror = restarted.handler("mirror").await.unwrap();
    assert_eq!(audit.message_count(), 1);
    assert_eq!(mirror.message_count(), 1);

    let from_audit = audit.take_for_delivery().await.unwrap();
    assert_eq!(from_audit.body(), Some(Bytes::from_static(b"login")));
    restarted.acknowledge(&from_audit).await.unwrap();
    assert_eq!(from_audit.owning_queues(), vec!["mirror".to_owned()]);

    restarted.shutdown().await;
}

#[tokio::test]
async fn test_delivery_waits_for_activation() {
    let broker = Broker::builder().config(config()).build().unwrap();
    broker
        .create_queue(Queue::builder().name("inbox").build())
        .await
        .unwrap();
    let (consumer, mut rx) = Consumer::channel("inbox", false, 1);
    broker.add_consumer(consumer).await.unwrap();

    broker.start_message_delivery().await;
    broker
        .publish(persistent("", "inbox", "hello"))
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());

    broker.activate().await.unwrap();
    let delivered = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.body(), Some(Bytes::from_static(b"hello")));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_topology_rules() {
    let (broker, _backend) = setup().await;
    durable_queue(&broker, "q").await;

    assert!(broker
        .bind(TOPIC_EXCHANGE, "q", "a.*", Headers::new())
        .await
        .unwrap());
    assert!(!broker
        .bind(TOPIC_EXCHANGE, "q", "a.*", Headers::new())
        .await
        .unwrap());
    assert_eq!(
        broker
            .all_bindings_for_exchange(TOPIC_EXCHANGE)
            .await
            .unwrap()
            .len(),
        1
    );

    assert!(broker
        .delete_exchange(TOPIC_EXCHANGE, false)
        .await
        .unwrap_err()
        .is_validation());
    assert!(broker
        .create_queue(Queue::builder().name("q").build())
        .await
        .unwrap_err()
        .is_validation());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_selector_filters_bindings() {
    let (broker, _backend) = setup().await;
    durable_queue(&broker, "eu").await;
    durable_queue(&broker, "rest").await;

    let mut arguments = Headers::new();
    arguments.insert(SELECTOR_ARGUMENT, "region = 'eu'");
    broker
        .bind(TOPIC_EXCHANGE, "eu", "orders.#", arguments)
        .await
        .unwrap();
    let mut arguments = Headers::new();
    arguments.insert(SELECTOR_ARGUMENT, "region <> 'eu'");
    broker
        .bind(TOPIC_EXCHANGE, "rest", "orders.#", arguments)
        .await
        .unwrap();

    for region in ["eu", "us", "apac"] {
        let message = Message::new(
            Metadata::builder()
                .exchange(TOPIC_EXCHANGE)
                .routing_key("orders.created")
                .headers([("region", region)].into_iter().collect())
                .build(),
            vec![],
        );
        assert_eq!(broker.publish(message).await.unwrap(), 1);
    }

    assert_eq!(broker.handler("eu").await.unwrap().message_count(), 1);
    assert_eq!(broker.handler("rest").await.unwrap().message_count(), 2);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_expired_messages_move_to_dead_letter_channel() {
    let (broker, _backend) = setup().await;
    broker
        .create_queue(
            Queue::builder()
                .name("short-lived")
                .durable(true)
                .dead_letter_expired(true)
                .build(),
        )
        .await
        .unwrap();
    broker
        .bind(TOPIC_EXCHANGE, "short-lived", "ttl.#", Headers::new())
        .await
        .unwrap();

    let message = Message::new(
        Metadata::builder()
            .exchange(TOPIC_EXCHANGE)
            .routing_key("ttl.test")
            .expiration(Utc::now() - chrono::Duration::seconds(1))
            .persistent(true)
            .build(),
        vec![Bytes::from_static(b"stale")],
    );
    broker.publish(message).await.unwrap();
    broker.start_message_delivery().await;

    let dead_letters = broker.handler(DEAD_LETTER_QUEUE).await.unwrap();
    let source = broker.handler("short-lived").await.unwrap();
    timeout(Duration::from_secs(2), async {
        while dead_letters.message_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    broker.stop_message_delivery().await;

    assert_eq!(source.message_count(), 0);
    let dead = dead_letters.take_for_delivery().await.unwrap();
    let headers = dead.metadata().headers();
    assert_eq!(headers.get(ORIGIN_QUEUE_HEADER), Some("short-lived"));
    assert_eq!(headers.get(ORIGIN_EXCHANGE_HEADER), Some(TOPIC_EXCHANGE));
    assert_eq!(dead.body(), Some(Bytes::from_static(b"stale")));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_purge_reports_count() {
    let (broker, backend) = setup().await;
    durable_queue(&broker, "backlog").await;
    for body in ["one", "two", "three"] {
        broker
            .publish(persistent("", "backlog", body))
            .await
            .unwrap();
    }
    broker.flush().await.unwrap();
    assert_eq!(backend.message_count(), 3);

    assert_eq!(broker.purge_queue("backlog").await.unwrap(), 3);
    broker.flush().await.unwrap();
    assert_eq!(broker.handler("backlog").await.unwrap().message_count(), 0);
    assert_eq!(backend.message_count(), 0);

    assert!(broker
        .purge_queue("missing")
        .await
        .unwrap_err()
        .is_not_found());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_reactivation_keeps_unacknowledged_messages_out() {
    let (broker, backend) = setup().await;
    durable_queue(&broker, "work").await;

    let message = persistent("", "work", "job");
    let id = message.id();
    broker.publish(message).await.unwrap();
    let work = broker.handler("work").await.unwrap();
    let delivered = work.take_for_delivery().await.unwrap();

    broker.deactivate().await;
    broker.activate().await.unwrap();

    assert_eq!(work.message_count(), 0);
    assert!(work.take_for_delivery().await.is_none());

    broker.acknowledge(&delivered).await.unwrap();
    broker.flush().await.unwrap();
    assert!(!backend.contains_message(id));

    broker.shutdown().await;
}

/// Publishes a persistent message to `queue` and takes it back out, unacknowledged.
async fn delivered_from(broker: &Broker, queue: &str, body: &'static str) -> Message {
    broker.publish(persistent("", queue, body)).await.unwrap();
    broker
        .handler(queue)
        .await
        .unwrap()
        .take_for_delivery()
        .await
        .unwrap()
}

async fn restart(backend: &MemoryBackend) -> Broker {
    let broker = Broker::builder()
        .backend(Arc::new(backend.clone()))
        .config(config())
        .build()
        .unwrap();
    broker.activate().await.unwrap();
    broker
}

#[tokio::test]
async fn test_recovered_dequeue_returns_on_rollback() {
    let (broker, backend) = setup().await;
    durable_queue(&broker, "q").await;
    let delivered = delivered_from(&broker, "q", "held").await;
    let id = delivered.id();

    let xid = Xid::new(3, b"dequeue".to_vec(), b"1".to_vec());
    broker.branch(xid.clone()).unwrap();
    broker.dequeue(&xid, "q", delivered).await.unwrap();
    broker.prepare(&xid).await.unwrap();
    broker.shutdown().await;

    let restarted = restart(&backend).await;
    let queue = restarted.handler("q").await.unwrap();
    assert_eq!(queue.message_count(), 0);

    restarted.rollback(&xid).await.unwrap();
    assert_eq!(queue.message_count(), 1);
    assert_eq!(queue.take_for_delivery().await.unwrap().id(), id);
    assert_eq!(backend.message_queues(id), vec!["q".to_owned()]);

    restarted.shutdown().await;
}

#[tokio::test]
async fn test_recovered_dequeue_deletes_on_commit() {
    let (broker, backend) = setup().await;
    durable_queue(&broker, "q").await;
    let delivered = delivered_from(&broker, "q", "done").await;
    let id = delivered.id();

    let xid = Xid::new(3, b"dequeue".to_vec(), b"2".to_vec());
    broker.branch(xid.clone()).unwrap();
    broker.dequeue(&xid, "q", delivered).await.unwrap();
    broker.prepare(&xid).await.unwrap();
    broker.shutdown().await;

    let restarted = restart(&backend).await;
    restarted.commit(&xid, false).await.unwrap();

    assert_eq!(restarted.handler("q").await.unwrap().message_count(), 0);
    assert!(!backend.contains_message(id));

    restarted.shutdown().await;
}

/// Stages two enqueues into `a` and `b` and the removal of a message held by `c`.
async fn stage_three_queues(broker: &Broker, xid: &Xid) -> (u64, [u64; 2]) {
    for name in ["a", "b", "c"] {
        durable_queue(broker, name).await;
    }
    let held = delivered_from(broker, "c", "held").await;
    let held_id = held.id();

    broker.branch(xid.clone()).unwrap();
    let to_a = persistent("", "a", "to a");
    let to_b = persistent("", "b", "to b");
    let enqueued = [to_a.id(), to_b.id()];
    assert_eq!(broker.enqueue(xid, to_a).await.unwrap(), 1);
    assert_eq!(broker.enqueue(xid, to_b).await.unwrap(), 1);
    broker.dequeue(xid, "c", held).await.unwrap();
    broker.prepare(xid).await.unwrap();

    (held_id, enqueued)
}

async fn counts(broker: &Broker) -> Vec<usize> {
    let mut counts = Vec::new();
    for name in ["a", "b", "c"] {
        counts.push(broker.handler(name).await.unwrap().message_count());
    }
    counts
}

#[tokio::test]
async fn test_distributed_rollback_leaves_three_queues_untouched() {
    let (broker, backend) = setup().await;
    let xid = Xid::new(5, b"three".to_vec(), b"rollback".to_vec());
    let (held_id, enqueued) = stage_three_queues(&broker, &xid).await;
    broker.flush().await.unwrap();
    let before = counts(&broker).await;

    broker.rollback(&xid).await.unwrap();
    broker.flush().await.unwrap();

    assert_eq!(counts(&broker).await, before);
    assert_eq!(before, vec![0, 0, 0]);
    assert_eq!(backend.message_count(), 1);
    assert_eq!(backend.message_queues(held_id), vec!["c".to_owned()]);
    for id in enqueued {
        assert!(!backend.contains_message(id));
    }

    broker.shutdown().await;
}

#[tokio::test]
async fn test_distributed_commit_applies_three_queues_together() {
    let (broker, backend) = setup().await;
    let xid = Xid::new(5, b"three".to_vec(), b"commit".to_vec());
    let (held_id, enqueued) = stage_three_queues(&broker, &xid).await;
    assert_eq!(counts(&broker).await, vec![0, 0, 0]);

    broker.commit(&xid, false).await.unwrap();
    broker.flush().await.unwrap();

    assert_eq!(counts(&broker).await, vec![1, 1, 0]);
    assert!(!backend.contains_message(held_id));
    assert_eq!(backend.message_queues(enqueued[0]), vec!["a".to_owned()]);
    assert_eq!(backend.message_queues(enqueued[1]), vec!["b".to_owned()]);

    broker.shutdown().await;
}
