//! Broker-backed tests, gated on `DURABBIT_TEST_URL` (e.g.
//! `amqp://localhost`). Silently skipped when the variable is unset so the
//! unit suite runs anywhere.

use crate::{
    Auth, Channel, Connection, ConnectionOptions, ConnectionTuning, ConsumerHandler,
    ConsumerOptions, Delivery, Endpoint, QueueDeclareOptions, QueueDeleteOptions,
};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};

mod recovery;

static PRINT_WARNING: Once = Once::new();

fn with_test_endpoint<F: FnOnce(Endpoint)>(f: F) {
    let _ = env_logger::builder().is_test(true).try_init();
    match env::var("DURABBIT_TEST_URL") {
        Ok(url) => f(Endpoint::parse(&url).unwrap()),
        Err(env::VarError::NotPresent) => PRINT_WARNING.call_once(|| {
            println!("DURABBIT_TEST_URL not defined - skipping integration tests");
        }),
        Err(env::VarError::NotUnicode(_)) => {
            panic!("DURABBIT_TEST_URL exists but is not valid unicode")
        }
    }
}

fn with_conn<F: FnOnce(&mut Connection)>(f: F) {
    with_test_endpoint(|endpoint| {
        let mut conn = Connection::connect(
            &endpoint,
            ConnectionOptions::<Auth>::default(),
            ConnectionTuning::default(),
        )
        .unwrap();
        f(&mut conn);
        conn.close().unwrap();
    })
}

fn with_chan<F: FnOnce(&Channel)>(f: F) {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        f(&chan)
    })
}

/// Consumer that records what it sees, for asserting on deliveries and
/// cancellations.
pub(crate) struct TestConsumer {
    pub(crate) deliveries: Mutex<Vec<Delivery>>,
    pub(crate) cancellations: AtomicUsize,
}

impl TestConsumer {
    pub(crate) fn new() -> TestConsumer {
        TestConsumer {
            deliveries: Mutex::new(Vec::new()),
            cancellations: AtomicUsize::new(0),
        }
    }

    pub(crate) fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

impl ConsumerHandler for TestConsumer {
    fn on_delivery(&self, delivery: Delivery) {
        self.deliveries.lock().unwrap().push(delivery);
    }

    fn on_cancelled(&self, _consumer_tag: &str) {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn open_close_roundtrip() {
    with_conn(|conn| {
        assert!(conn.is_open());
        assert!(conn.server_properties().contains_key("product"));
    });
}

#[test]
fn open_skips_unreachable_endpoints() {
    with_test_endpoint(|reachable| {
        use crate::{RecoveringConnection, RecoveryOptions};
        // 203.0.113.0/24 is TEST-NET-3; nothing answers there
        let endpoints = vec![Endpoint::new("203.0.113.1", 5672), reachable];
        let conn = RecoveringConnection::open(
            endpoints,
            ConnectionOptions::<Auth>::default()
                .connection_timeout(Some(Duration::from_millis(500))),
            RecoveryOptions::default(),
            ConnectionTuning::default(),
        )
        .unwrap();
        assert!(conn.is_open());
        conn.close().unwrap();
    });
}

#[test]
fn declare_publish_consume_roundtrip() {
    use std::sync::Arc;
    with_chan(|chan| {
        let queue = chan
            .queue_declare("durabbit-test-roundtrip", QueueDeclareOptions::default())
            .unwrap();

        let consumer = Arc::new(TestConsumer::new());
        let tag = chan
            .basic_consume(
                queue.clone(),
                "",
                ConsumerOptions {
                    no_ack: true,
                    ..ConsumerOptions::default()
                },
                consumer.clone(),
            )
            .unwrap();
        assert!(!tag.is_empty());

        chan.basic_publish(
            b"hello".as_ref(),
            "",
            queue.clone(),
            false,
            &crate::AmqpProperties::default(),
        )
        .unwrap();

        wait_until("delivery", Duration::from_secs(10), || {
            consumer.delivery_count() == 1
        });
        assert_eq!(consumer.deliveries.lock().unwrap()[0].content, b"hello");

        chan.basic_cancel(tag).unwrap();
        wait_until("cancellation callback", Duration::from_secs(10), || {
            consumer.cancellations.load(Ordering::SeqCst) == 1
        });

        chan.queue_delete(queue, QueueDeleteOptions::default()).unwrap();
    });
}

#[test]
fn rpc_against_missing_entity_closes_channel() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        let err = chan
            .queue_declare_passive("durabbit-does-not-exist")
            .unwrap_err();
        match err {
            crate::Error::ServerClosedChannel { code, .. } => assert_eq!(code, 404),
            err => panic!("unexpected error {}", err),
        }
        // the channel handle is dead now, and says so
        match chan.queue_declare_passive("anything").unwrap_err() {
            crate::Error::AlreadyClosed { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    });
}

#[test]
fn explicit_channel_ids() {
    with_conn(|conn| {
        let chan7 = conn.open_channel(Some(7)).unwrap();
        assert_eq!(chan7.channel_id(), 7);
        match conn.open_channel(Some(7)).unwrap_err() {
            crate::Error::UnavailableChannelId { channel_id } => assert_eq!(channel_id, 7),
            err => panic!("unexpected error {}", err),
        }
        chan7.close().unwrap();
    });
}
