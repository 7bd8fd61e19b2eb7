use crate::errors::*;
use crate::{ConsumerHandler, Delivery};
use crossbeam_channel::Receiver;
use log::{debug, error, trace};
use snafu::ResultExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::Builder;

/// Work item for a channel's consumer dispatch queue. The I/O loop resolves
/// the consumer tag to its handler before enqueueing, so workers never touch
/// the loop's consumer table.
pub(crate) enum Dispatch {
    Delivery(Arc<dyn ConsumerHandler>, Delivery),
    Cancelled(Arc<dyn ConsumerHandler>, String),
}

/// Spawn the consumer dispatch workers for one channel.
///
/// Each channel gets its own queue and at least one worker; `concurrency`
/// workers share the queue, bounding the channel to that many in-flight
/// callbacks. With the default of 1 the broker's delivery order is preserved
/// within the channel; higher values trade ordering for parallelism.
/// Cross-channel ordering is never promised.
///
/// Workers exit when the I/O loop drops the sending side of the queue, which
/// happens when the channel (or the whole connection) goes away.
pub(crate) fn spawn_workers(channel_id: u16, rx: Receiver<Dispatch>, concurrency: usize) -> Result<()> {
    let concurrency = usize::max(concurrency, 1);
    for worker in 0..concurrency {
        let rx = rx.clone();
        Builder::new()
            .name(format!("durabbit-dispatch-{}.{}", channel_id, worker))
            .spawn(move || run_worker(channel_id, rx))
            .context(ForkFailedSnafu)?;
    }
    Ok(())
}

fn run_worker(channel_id: u16, rx: Receiver<Dispatch>) {
    for dispatch in rx.iter() {
        // a handler panic must not take down the worker (or, worse, poison
        // anything the i/o loop depends on); log it and move on.
        let result = catch_unwind(AssertUnwindSafe(|| match dispatch {
            Dispatch::Delivery(handler, delivery) => {
                trace!("dispatching delivery on channel {}", channel_id);
                handler.on_delivery(delivery);
            }
            Dispatch::Cancelled(handler, consumer_tag) => {
                debug!(
                    "dispatching cancellation of consumer {} on channel {}",
                    consumer_tag, channel_id
                );
                handler.on_cancelled(&consumer_tag);
            }
        }));
        if result.is_err() {
            error!("consumer callback on channel {} panicked", channel_id);
        }
    }
    trace!("dispatch worker for channel {} exiting", channel_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AmqpProperties;
    use amq_protocol::protocol::basic::Deliver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recording {
        tags: Mutex<Vec<u64>>,
        cancelled: AtomicUsize,
    }

    impl ConsumerHandler for Recording {
        fn on_delivery(&self, delivery: Delivery) {
            self.tags.lock().unwrap().push(delivery.delivery_tag());
        }

        fn on_cancelled(&self, _consumer_tag: &str) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl ConsumerHandler for Panicking {
        fn on_delivery(&self, _delivery: Delivery) {
            panic!("callback failure");
        }
    }

    fn delivery(tag: u64) -> Delivery {
        let deliver = Deliver {
            consumer_tag: "tag".to_string(),
            delivery_tag: tag,
            redelivered: false,
            exchange: "".to_string(),
            routing_key: "key".to_string(),
        };
        Delivery::new(deliver, Vec::new(), AmqpProperties::default()).1
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within 1s");
    }

    #[test]
    fn deliveries_preserve_order_with_one_worker() {
        let handler = Arc::new(Recording {
            tags: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_workers(7, rx, 1).unwrap();

        for tag in 0..100u64 {
            tx.send(Dispatch::Delivery(handler.clone(), delivery(tag)))
                .unwrap();
        }
        drop(tx);

        wait_until(|| handler.tags.lock().unwrap().len() == 100);
        let tags = handler.tags.lock().unwrap();
        assert_eq!(*tags, (0..100).collect::<Vec<u64>>());
    }

    #[test]
    fn panicking_handler_does_not_kill_worker() {
        let panicking: Arc<dyn ConsumerHandler> = Arc::new(Panicking);
        let handler = Arc::new(Recording {
            tags: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_workers(8, rx, 1).unwrap();

        tx.send(Dispatch::Delivery(panicking.clone(), delivery(1)))
            .unwrap();
        tx.send(Dispatch::Delivery(handler.clone(), delivery(2)))
            .unwrap();
        tx.send(Dispatch::Cancelled(handler.clone(), "tag".to_string()))
            .unwrap();
        drop(tx);

        wait_until(|| handler.cancelled.load(Ordering::SeqCst) == 1);
        assert_eq!(*handler.tags.lock().unwrap(), vec![2]);
    }
}
