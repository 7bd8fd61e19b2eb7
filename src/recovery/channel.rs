use super::connection::{Phase, Shared};
use super::RecoveryEvent;
use crate::errors::*;
use crate::notification_listeners::{NotificationListener, NotificationListeners};
use crate::queue::QueueStatus;
use crate::shutdown::ShutdownReason;
use crate::topology::{
    BindingDestination, RecordedBinding, RecordedConsumer, RecordedExchange, RecordedQueue,
};
use crate::{
    AmqpProperties, Channel, ConsumerHandler, ConsumerOptions, ExchangeDeclareOptions,
    ExchangeType, FieldTable, QueueDeclareOptions, QueueDeleteOptions,
};
use std::sync::{Arc, Mutex};

/// Shared body of a recovering channel: the currently live underlying
/// channel (absent while a recovery is in flight or after this channel was
/// closed) plus this channel's own event listeners, which survive
/// reconnects. The topology recorder holds only weak references to this, so
/// dropping the user handle makes the channel (and its consumers) eligible
/// for cleanup instead of keeping it alive forever.
pub(crate) struct ChannelCore {
    shared: Arc<Shared>,
    slot: Mutex<Option<Channel>>,
    events: NotificationListeners<RecoveryEvent>,
}

impl ChannelCore {
    pub(super) fn new(shared: Arc<Shared>, channel: Channel) -> ChannelCore {
        ChannelCore {
            shared,
            slot: Mutex::new(Some(channel)),
            events: NotificationListeners::new(),
        }
    }

    /// Tear out the dead underlying channel at the start of a recovery.
    pub(super) fn suspend(&self) {
        *self.slot.lock().unwrap() = None;
    }

    /// Install the freshly opened underlying channel.
    pub(super) fn resume(&self, channel: Channel) {
        *self.slot.lock().unwrap() = Some(channel);
    }

    pub(super) fn emit_recovered(&self) {
        self.events.broadcast(RecoveryEvent::RecoverySucceeded);
    }

    /// Re-issue a recorded consume on the just-resumed channel. Used only by
    /// the replay pass, which runs while the connection phase is still
    /// Recovering and therefore bypasses the user-facing gate.
    pub(super) fn consume_for_replay(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumerOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String> {
        let slot = self.slot.lock().unwrap();
        match &*slot {
            Some(channel) => channel.basic_consume(queue, consumer_tag, options, handler),
            None => AlreadyClosedSnafu {
                reason: ShutdownReason::application(),
            }
            .fail(),
        }
    }

    // Gate every user operation on the connection's phase: proceed when
    // running, fail (or optionally block) while recovering, and fail
    // permanently once the user closed the connection or recovery gave up.
    fn with_channel<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Channel) -> Result<T>,
    {
        loop {
            let state = self.shared.state.lock().unwrap();
            match state.phase {
                Phase::Running => {}
                Phase::Recovering => {
                    if self.shared.block_while_recovering {
                        let _woken = self.shared.cond.wait(state).unwrap();
                        continue;
                    }
                    return AlreadyClosedSnafu {
                        reason: state.current_reason(),
                    }
                    .fail();
                }
                Phase::GivenUp | Phase::Closed => {
                    return AlreadyClosedSnafu {
                        reason: state.current_reason(),
                    }
                    .fail();
                }
            }
            drop(state);

            let slot = self.slot.lock().unwrap();
            return match &*slot {
                Some(channel) => f(channel),
                // the connection is running but this channel was closed
                // individually
                None => AlreadyClosedSnafu {
                    reason: ShutdownReason::application(),
                }
                .fail(),
            };
        }
    }
}

/// A channel handle that stays usable across connection recovery.
///
/// Calls are forwarded to the currently live underlying channel; declarative
/// calls additionally update the connection's topology recorder so the
/// declared state can be replayed after a reconnect. While a recovery is in
/// flight, calls fail with `AlreadyClosed` (or block, per
/// [`RecoveryOptions::block_while_recovering`](struct.RecoveryOptions.html#method.block_while_recovering)).
pub struct RecoveringChannel {
    core: Arc<ChannelCore>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RecoveringChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveringChannel").finish()
    }
}

impl Drop for RecoveringChannel {
    fn drop(&mut self) {
        // consumers of a dropped channel must not be replayed
        self.shared
            .topology
            .delete_consumers_of_channel(&Arc::downgrade(&self.core));
    }
}

impl RecoveringChannel {
    pub(super) fn new(core: Arc<ChannelCore>, shared: Arc<Shared>) -> RecoveringChannel {
        RecoveringChannel { core, shared }
    }

    /// Subscribe to this channel's recovery notifications
    /// (`RecoverySucceeded` after each successful recovery).
    pub fn register_recovery_listener(&self) -> NotificationListener<RecoveryEvent> {
        self.core.events.register_listener()
    }

    /// Declare an exchange and record it for replay.
    pub fn exchange_declare<S: Into<String>>(
        &self,
        type_: ExchangeType,
        name: S,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        let name = name.into();
        let record = RecordedExchange {
            name: name.clone(),
            type_: type_.as_ref().to_string(),
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            arguments: options.arguments.clone(),
        };
        self.core
            .with_channel(|channel| channel.exchange_declare(type_, name, options))?;
        self.shared.topology.record_exchange(record);
        Ok(())
    }

    /// Passively verify an exchange; never recorded.
    pub fn exchange_declare_passive<S: Into<String>>(&self, name: S) -> Result<()> {
        let name = name.into();
        self.core
            .with_channel(|channel| channel.exchange_declare_passive(name))
    }

    /// Delete an exchange and erase it (and its bindings) from the recorded
    /// topology.
    pub fn exchange_delete<S: Into<String>>(&self, name: S, if_unused: bool) -> Result<()> {
        let name = name.into();
        self.core
            .with_channel(|channel| channel.exchange_delete(name.clone(), if_unused))?;
        self.shared.topology.delete_exchange(&name);
        Ok(())
    }

    /// Bind one exchange to another and record the binding.
    pub fn exchange_bind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let destination = destination.into();
        let source = source.into();
        let routing_key = routing_key.into();
        let record = RecordedBinding {
            source: source.clone(),
            destination: BindingDestination::Exchange(destination.clone()),
            routing_key: routing_key.clone(),
            arguments: arguments.clone(),
        };
        self.core.with_channel(|channel| {
            channel.exchange_bind(destination, source, routing_key, arguments)
        })?;
        self.shared.topology.record_binding(record);
        Ok(())
    }

    /// Remove an exchange-to-exchange binding from the broker and the
    /// recorded topology.
    pub fn exchange_unbind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let destination = destination.into();
        let source = source.into();
        let routing_key = routing_key.into();
        let record = RecordedBinding {
            source: source.clone(),
            destination: BindingDestination::Exchange(destination.clone()),
            routing_key: routing_key.clone(),
            arguments: arguments.clone(),
        };
        self.core.with_channel(|channel| {
            channel.exchange_unbind(destination, source, routing_key, arguments)
        })?;
        self.shared.topology.delete_binding(&record);
        Ok(())
    }

    /// Declare a queue and record it for replay. Declaring with an empty
    /// name records a server-named queue: on recovery it is re-declared with
    /// an empty name and all dependent bindings/consumers follow the fresh
    /// server-assigned name.
    pub fn queue_declare<S: Into<String>>(
        &self,
        name: S,
        options: QueueDeclareOptions,
    ) -> Result<String> {
        let name = name.into();
        let server_named = name.is_empty();
        let declared = self
            .core
            .with_channel(|channel| channel.queue_declare(name, options.clone()))?;
        self.shared.topology.record_queue(RecordedQueue {
            name: declared.clone(),
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            server_named,
            arguments: options.arguments,
        });
        Ok(declared)
    }

    /// Passively verify a queue; never recorded.
    pub fn queue_declare_passive<S: Into<String>>(&self, name: S) -> Result<QueueStatus> {
        let name = name.into();
        self.core
            .with_channel(|channel| channel.queue_declare_passive(name))
    }

    /// Delete a queue and erase it (plus bindings and consumers) from the
    /// recorded topology.
    pub fn queue_delete<S: Into<String>>(
        &self,
        name: S,
        options: QueueDeleteOptions,
    ) -> Result<u32> {
        let name = name.into();
        let count = self
            .core
            .with_channel(|channel| channel.queue_delete(name.clone(), options))?;
        self.shared.topology.delete_queue(&name);
        Ok(count)
    }

    /// Bind a queue to an exchange and record the binding.
    pub fn queue_bind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let queue = queue.into();
        let exchange = exchange.into();
        let routing_key = routing_key.into();
        let record = RecordedBinding {
            source: exchange.clone(),
            destination: BindingDestination::Queue(queue.clone()),
            routing_key: routing_key.clone(),
            arguments: arguments.clone(),
        };
        self.core
            .with_channel(|channel| channel.queue_bind(queue, exchange, routing_key, arguments))?;
        self.shared.topology.record_binding(record);
        Ok(())
    }

    /// Remove a queue binding from the broker and the recorded topology.
    pub fn queue_unbind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let queue = queue.into();
        let exchange = exchange.into();
        let routing_key = routing_key.into();
        let record = RecordedBinding {
            source: exchange.clone(),
            destination: BindingDestination::Queue(queue.clone()),
            routing_key: routing_key.clone(),
            arguments: arguments.clone(),
        };
        self.core.with_channel(|channel| {
            channel.queue_unbind(queue, exchange, routing_key, arguments)
        })?;
        self.shared.topology.delete_binding(&record);
        Ok(())
    }

    /// Drop all messages in a queue.
    pub fn queue_purge<S: Into<String>>(&self, name: S) -> Result<u32> {
        let name = name.into();
        self.core.with_channel(|channel| channel.queue_purge(name))
    }

    /// Set the prefetch window. Forwarded but not recorded; prefetch is not
    /// topology and does not survive recovery.
    pub fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        self.core
            .with_channel(|channel| channel.basic_qos(prefetch_size, prefetch_count, global))
    }

    /// Publish a message on the current underlying channel.
    pub fn basic_publish<T: AsRef<[u8]>, S0: Into<String>, S1: Into<String>>(
        &self,
        content: T,
        exchange: S0,
        routing_key: S1,
        mandatory: bool,
        properties: &AmqpProperties,
    ) -> Result<()> {
        let exchange = exchange.into();
        let routing_key = routing_key.into();
        self.core.with_channel(|channel| {
            channel.basic_publish(content.as_ref(), exchange, routing_key, mandatory, properties)
        })
    }

    /// Start a consumer and record it for replay. The returned tag is the
    /// server-confirmed one; a consumer started with an empty tag gets a new
    /// server-assigned tag after each recovery (announced via
    /// [`RecoveryEvent::ConsumerTagChanged`](enum.RecoveryEvent.html)).
    pub fn basic_consume<S0: Into<String>, S1: Into<String>>(
        &self,
        queue: S0,
        consumer_tag: S1,
        options: ConsumerOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String> {
        let queue = queue.into();
        let consumer_tag = consumer_tag.into();
        let server_named_tag = consumer_tag.is_empty();
        let confirmed_tag = self.core.with_channel(|channel| {
            channel.basic_consume(
                queue.clone(),
                consumer_tag,
                options.clone(),
                Arc::clone(&handler),
            )
        })?;
        self.shared.topology.record_consumer(RecordedConsumer {
            consumer_tag: confirmed_tag.clone(),
            queue,
            options,
            server_named_tag,
            handler,
            channel: Arc::downgrade(&self.core),
        });
        Ok(confirmed_tag)
    }

    /// Cancel a consumer and forget its recording.
    pub fn basic_cancel<S: Into<String>>(&self, consumer_tag: S) -> Result<()> {
        let consumer_tag = consumer_tag.into();
        self.core
            .with_channel(|channel| channel.basic_cancel(consumer_tag.clone()))?;
        self.shared.topology.delete_consumer(&consumer_tag);
        Ok(())
    }

    /// Acknowledge a delivery. Tags are forwarded verbatim; a tag captured
    /// before a recovery is not an error client-side, though the broker may
    /// fault the channel for it.
    pub fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.core
            .with_channel(|channel| channel.basic_ack(delivery_tag, multiple))
    }

    /// Negatively acknowledge one or more deliveries.
    pub fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.core
            .with_channel(|channel| channel.basic_nack(delivery_tag, multiple, requeue))
    }

    /// Reject a delivery.
    pub fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.core
            .with_channel(|channel| channel.basic_reject(delivery_tag, requeue))
    }

    /// Close this channel. Its recorded consumers are forgotten; recorded
    /// exchanges/queues/bindings belong to the connection and survive.
    pub fn close(self) -> Result<()> {
        self.shared
            .topology
            .delete_consumers_of_channel(&Arc::downgrade(&self.core));
        let channel = self.core.slot.lock().unwrap().take();
        match channel {
            Some(channel) => channel.close(),
            None => Ok(()),
        }
    }
}
