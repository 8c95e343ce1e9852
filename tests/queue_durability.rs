use std::sync::Arc;
use std::thread;

use micromq::store::QueueStore;
use micromq::{BasicProperties, BrokerConfig, ManualClock, QueueMeta, VirtualHost};
use tempfile::tempdir;

fn props(id: &str) -> BasicProperties {
    BasicProperties {
        id: id.to_string(),
        ..BasicProperties::default()
    }
}

fn live_ids(store: &QueueStore) -> Vec<String> {
    store
        .messages()
        .expect("messages")
        .into_iter()
        .map(|m| m.properties.id)
        .collect()
}

#[test]
fn fifo_consume_order() {
    let dir = tempdir().expect("tempdir");
    let host = VirtualHost::open(
        &BrokerConfig::with_data_dir(dir.path()),
        Arc::new(ManualClock::new(1)),
    )
    .expect("open host");
    host.declare_queue(QueueMeta::new("Q")).expect("declare");

    for body in [b"a", b"b", b"c"] {
        host.basic_publish("Q", BasicProperties::default(), body)
            .expect("publish");
    }
    let consumed: Vec<_> = (0..3)
        .map(|_| host.basic_consume("Q").expect("consume").expect("message").body)
        .collect();
    assert_eq!(consumed, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    assert!(host.basic_consume("Q").expect("consume empty").is_none());
}

#[test]
fn durable_messages_survive_destroy_and_recover_cycles() {
    let dir = tempdir().expect("tempdir");
    {
        let store = QueueStore::new(dir.path(), "orders", false);
        for id in ["1", "2", "3", "4"] {
            store
                .insert(props(id), id.as_bytes().to_vec(), true)
                .expect("insert");
        }
        store.remove("2").expect("remove 2");
    }

    let store = QueueStore::new(dir.path(), "orders", false);
    assert_eq!(store.recovery().expect("recover"), 3);
    assert_eq!(live_ids(&store), vec!["1", "3", "4"]);

    store.remove("").expect("remove head");
    drop(store);

    let store = QueueStore::new(dir.path(), "orders", false);
    store.recovery().expect("recover again");
    assert_eq!(live_ids(&store), vec!["3", "4"]);
    let bodies: Vec<_> = store
        .messages()
        .expect("messages")
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec![b"3".to_vec(), b"4".to_vec()]);
}

#[test]
fn compaction_then_recovery_keeps_live_set() {
    let dir = tempdir().expect("tempdir");
    let store = QueueStore::new(dir.path(), "events", false);
    for i in 0..20 {
        store
            .insert(props(&i.to_string()), vec![i as u8; 32], true)
            .expect("insert");
    }
    for i in (0..20).step_by(3) {
        store.remove(&i.to_string()).expect("remove");
    }
    let before = live_ids(&store);
    assert!(store.stats().expect("stats").invalid_ratio > 0.0);

    let report = store.compact().expect("compact");
    assert_eq!(report.live_records, before.len());
    assert!(report.bytes_after < report.bytes_before);
    assert_eq!(store.stats().expect("stats").invalid_ratio, 0.0);
    drop(store);

    let store = QueueStore::new(dir.path(), "events", false);
    store.recovery().expect("recover");
    assert_eq!(live_ids(&store), before);

    // A second compaction of an already compact log changes nothing.
    let again = store.compact().expect("compact again");
    assert_eq!(again.bytes_before, again.bytes_after);
}

#[test]
fn transient_queue_loses_messages_on_reopen() {
    let dir = tempdir().expect("tempdir");
    let config = BrokerConfig::with_data_dir(dir.path());
    {
        let host = VirtualHost::open(&config, Arc::new(ManualClock::new(1))).expect("open");
        host.declare_queue(QueueMeta::new("durable").durable(true))
            .expect("declare durable");
        host.declare_queue(QueueMeta::new("scratch"))
            .expect("declare transient");
        host.basic_publish("durable", BasicProperties::default(), b"kept")
            .expect("publish durable");
        host.basic_publish("scratch", BasicProperties::default(), b"lost")
            .expect("publish transient");
    }

    let host = VirtualHost::open(&config, Arc::new(ManualClock::new(2))).expect("reopen");
    assert_eq!(host.queue_depth("durable").expect("depth"), 1);
    assert!(!host.queue_exists("scratch").expect("exists"));
    let message = host
        .basic_consume("durable")
        .expect("consume")
        .expect("message");
    assert_eq!(message.body, b"kept");
    assert!(message.is_durable());
}

#[test]
fn concurrent_consumers_each_take_distinct_messages() {
    let dir = tempdir().expect("tempdir");
    let host = Arc::new(
        VirtualHost::open(
            &BrokerConfig::with_data_dir(dir.path()),
            Arc::new(ManualClock::new(1)),
        )
        .expect("open host"),
    );
    host.declare_queue(QueueMeta::new("work").durable(true))
        .expect("declare");

    let mut published: Vec<String> = (0..500)
        .map(|i| {
            host.basic_publish("work", BasicProperties::default(), format!("m{i}").as_bytes())
                .expect("publish")
        })
        .collect();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let host = Arc::clone(&host);
            thread::spawn(move || {
                let mut taken = Vec::new();
                while let Some(message) = host.basic_consume("work").expect("consume") {
                    taken.push(message.properties.id);
                }
                taken
            })
        })
        .collect();
    let mut consumed: Vec<String> = workers
        .into_iter()
        .flat_map(|worker| worker.join().expect("worker"))
        .collect();

    published.sort();
    consumed.sort();
    assert_eq!(consumed, published);
    assert_eq!(host.queue_depth("work").expect("depth"), 0);
}
