//! Recovery tests: connection loss is provoked by sending the server a
//! frame it must answer with connection.close, so no broker restarts are
//! needed.

use super::{wait_until, with_test_endpoint, TestConsumer};
use crate::{
    Auth, ConnectionOptions, ConnectionTuning, ConsumerOptions, Error, ExchangeDeclareOptions,
    ExchangeType, FieldTable, NotificationListener, QueueDeclareOptions, RecoveringConnection,
    RecoveryEvent, RecoveryOptions,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const FAST_RETRY: Duration = Duration::from_millis(200);

fn with_recovering<F: FnOnce(&RecoveringConnection)>(f: F) {
    with_test_endpoint(|endpoint| {
        let conn = RecoveringConnection::open(
            vec![endpoint],
            ConnectionOptions::<Auth>::default(),
            RecoveryOptions::default().network_recovery_interval(FAST_RETRY),
            ConnectionTuning::default(),
        )
        .unwrap();
        f(&conn);
        let _ = conn.abort();
    });
}

// Drain the listener until RecoverySucceeded shows up, returning every event
// seen on the way.
fn await_recovery(listener: &NotificationListener<RecoveryEvent>) -> Vec<RecoveryEvent> {
    let mut seen = Vec::new();
    loop {
        match listener
            .receiver()
            .recv_timeout(Duration::from_secs(30))
        {
            Ok(RecoveryEvent::RecoverySucceeded) => {
                seen.push(RecoveryEvent::RecoverySucceeded);
                return seen;
            }
            Ok(event) => seen.push(event),
            Err(_) => panic!("timed out waiting for recovery to succeed"),
        }
    }
}

#[test]
fn recovery_restores_declared_queue() {
    with_recovering(|conn| {
        let listener = conn.register_recovery_listener();
        let chan = conn.create_channel().unwrap();
        let queue = chan
            .queue_declare("durabbit-test-q1", QueueDeclareOptions::default())
            .unwrap();
        assert_eq!(conn.topology().queue_count(), 1);

        conn.force_disconnect();
        await_recovery(&listener);

        // channel handle is still valid, queue still exists server-side
        let status = chan.queue_declare_passive(queue.clone()).unwrap();
        assert_eq!(status.queue, queue);
        assert_eq!(conn.topology().queue_count(), 1);

        chan.queue_delete(queue, Default::default()).unwrap();
    });
}

#[test]
fn channel_recovery_event_follows_connection_event() {
    with_recovering(|conn| {
        let conn_listener = conn.register_recovery_listener();
        let chan = conn.create_channel().unwrap();
        let chan_listener = chan.register_recovery_listener();

        conn.force_disconnect();
        await_recovery(&conn_listener);

        // the channel-level event is emitted strictly after the
        // connection-level one, so it must be observable shortly after
        match chan_listener
            .receiver()
            .recv_timeout(Duration::from_secs(5))
        {
            Ok(RecoveryEvent::RecoverySucceeded) => (),
            _ => panic!("expected channel-level recovery event"),
        }
    });
}

#[test]
fn server_named_queue_is_renamed_and_rebound() {
    with_recovering(|conn| {
        let listener = conn.register_recovery_listener();
        let chan = conn.create_channel().unwrap();

        let original = chan
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .unwrap();
        assert!(original.starts_with("amq.gen-"));
        chan.queue_bind(original.clone(), "amq.fanout", "", FieldTable::new())
            .unwrap();

        let consumer = Arc::new(TestConsumer::new());
        chan.basic_consume(
            original.clone(),
            "",
            ConsumerOptions {
                no_ack: true,
                ..ConsumerOptions::default()
            },
            consumer.clone(),
        )
        .unwrap();

        conn.force_disconnect();
        let events = await_recovery(&listener);

        let renamed = events.iter().find_map(|event| match event {
            RecoveryEvent::QueueNameChanged { before, after } if *before == original => {
                Some(after.clone())
            }
            _ => None,
        });
        let renamed = renamed.expect("expected a queue rename event");
        assert!(renamed.starts_with("amq.gen-"));
        assert_ne!(renamed, original);

        // the binding and consumer followed the rename: a publish through
        // amq.fanout lands exactly one message on the renamed queue
        chan.basic_publish(
            b"after-recovery".as_ref(),
            "amq.fanout",
            "",
            false,
            &crate::AmqpProperties::default(),
        )
        .unwrap();
        wait_until("delivery after recovery", Duration::from_secs(10), || {
            consumer.delivery_count() == 1
        });
    });
}

#[test]
fn consumers_survive_recovery() {
    with_recovering(|conn| {
        let listener = conn.register_recovery_listener();
        let chan = conn.create_channel().unwrap();
        let queue = chan
            .queue_declare("durabbit-test-consumers", QueueDeclareOptions::default())
            .unwrap();

        const CONSUMERS: u32 = 1024;

        let consumer = Arc::new(TestConsumer::new());
        for _ in 0..CONSUMERS {
            chan.basic_consume(
                queue.clone(),
                "",
                ConsumerOptions {
                    no_ack: true,
                    ..ConsumerOptions::default()
                },
                consumer.clone(),
            )
            .unwrap();
        }
        assert_eq!(conn.topology().consumer_count(), CONSUMERS as usize);

        conn.force_disconnect();
        await_recovery(&listener);

        let status = chan.queue_declare_passive(queue.clone()).unwrap();
        assert_eq!(status.consumer_count, CONSUMERS);
        assert_eq!(conn.topology().consumer_count(), CONSUMERS as usize);

        // cancelling one and recovering again leaves one fewer
        let recorded: Vec<String> = conn.topology().consumer_tags();
        chan.basic_cancel(recorded[0].clone()).unwrap();
        let listener = conn.register_recovery_listener();
        conn.force_disconnect();
        await_recovery(&listener);

        let status = chan.queue_declare_passive(queue.clone()).unwrap();
        assert_eq!(status.consumer_count, CONSUMERS - 1);

        chan.queue_delete(queue, Default::default()).unwrap();
    });
}

#[test]
fn deleted_exchange_is_not_recovered() {
    with_recovering(|conn| {
        let listener = conn.register_recovery_listener();
        let chan = conn.create_channel().unwrap();
        chan.exchange_declare(
            ExchangeType::Fanout,
            "durabbit-test-deleted",
            ExchangeDeclareOptions::default(),
        )
        .unwrap();
        chan.exchange_delete("durabbit-test-deleted", false).unwrap();
        assert_eq!(conn.topology().exchange_count(), 0);

        conn.force_disconnect();
        await_recovery(&listener);

        match chan
            .exchange_declare_passive("durabbit-test-deleted")
            .unwrap_err()
        {
            Error::ServerClosedChannel { code, .. } => assert_eq!(code, 404),
            err => panic!("unexpected error {}", err),
        }
    });
}

#[test]
fn close_stops_recovery_for_good() {
    with_recovering(|conn| {
        let chan = conn.create_channel().unwrap();
        chan.queue_declare(
            "durabbit-test-close",
            QueueDeclareOptions {
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
        )
        .unwrap();

        conn.force_disconnect();
        // give the forced shutdown a moment to land so close() observes a
        // connection that is dead or mid-recovery
        std::thread::sleep(Duration::from_millis(300));
        conn.close().unwrap_or_else(|err| {
            // depending on who won the race, close may find the connection
            // already gone (or already replaced and re-killed)
            match err {
                Error::AlreadyClosed { .. } | Error::RpcTimeout => (),
                err => panic!("unexpected error {}", err),
            }
        });

        match conn.create_channel().unwrap_err() {
            Error::AlreadyClosed { .. } => (),
            err => panic!("unexpected error {}", err),
        }

        // no recovery chatter after close has completed: drain whatever was
        // in flight, then expect silence for 10x the retry interval
        let listener = conn.register_recovery_listener();
        std::thread::sleep(Duration::from_millis(300));
        while listener.receiver().try_recv().is_ok() {}
        std::thread::sleep(FAST_RETRY * 10);
        assert!(
            listener.receiver().try_recv().is_err(),
            "recovery activity continued after close"
        );

        // second close reports the connection already closed
        match conn.close().unwrap_err() {
            Error::AlreadyClosed { .. } => (),
            err => panic!("unexpected error {}", err),
        }
        // abort stays quiet about it
        conn.abort().unwrap();
    });
}

#[test]
fn blocked_operations_resume_after_recovery() {
    with_test_endpoint(|endpoint| {
        let conn = RecoveringConnection::open(
            vec![endpoint],
            ConnectionOptions::<Auth>::default(),
            RecoveryOptions::default()
                .network_recovery_interval(FAST_RETRY)
                .block_while_recovering(true),
            ConnectionTuning::default(),
        )
        .unwrap();

        let chan = conn.create_channel().unwrap();
        let queue = chan
            .queue_declare("durabbit-test-blocking", QueueDeclareOptions::default())
            .unwrap();

        conn.force_disconnect();
        // With blocking enabled a call made mid-recovery waits the recovery
        // out instead of failing. The call can still race the monitor thread
        // and hit the dying connection before the recovering phase begins;
        // retry those until we land in (or after) the blocking window.
        let status = loop {
            match chan.queue_declare_passive(queue.clone()) {
                Ok(status) => break status,
                Err(Error::AlreadyClosed { .. }) => {
                    std::thread::sleep(Duration::from_millis(50))
                }
                Err(err) => panic!("unexpected error {}", err),
            }
        };
        assert_eq!(status.queue, queue);

        chan.queue_delete(queue, Default::default()).unwrap();
        let _ = conn.abort();
    });
}

#[test]
fn consumer_handlers_hear_about_unrecovered_cancellation() {
    with_recovering(|conn| {
        let chan = conn.create_channel().unwrap();
        let queue = chan
            .queue_declare(
                "durabbit-test-cancel-note",
                QueueDeclareOptions {
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .unwrap();
        let consumer = Arc::new(TestConsumer::new());
        let tag = chan
            .basic_consume(queue, "", ConsumerOptions::default(), consumer.clone())
            .unwrap();
        chan.basic_cancel(tag).unwrap();
        wait_until("cancellation callback", Duration::from_secs(10), || {
            consumer.cancellations.load(Ordering::SeqCst) == 1
        });
        assert_eq!(conn.topology().consumer_count(), 0);
    });
}
