use crate::dispatch;
use crate::errors::*;
use crate::io_loop::ChannelHandle;
use crate::queue::QueueStatus;
use crate::shutdown::ShutdownReason;
use crate::{
    AmqpProperties, ConsumerHandler, ConsumerOptions, ExchangeDeclareOptions, ExchangeType,
    FieldTable, QueueDeclareOptions, QueueDeleteOptions,
};
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::{Ack, Cancel, CancelOk, Nack, Publish, Qos, QosOk, Reject};
use amq_protocol::protocol::exchange;
use amq_protocol::protocol::exchange::AMQPMethod as AmqpExchange;
use amq_protocol::protocol::queue;
use amq_protocol::protocol::queue::AMQPMethod as AmqpQueue;
use std::sync::{Arc, Mutex};

/// A single AMQP channel multiplexed over its connection's socket.
///
/// Synchronous methods (declares, binds, consume, cancel, close) block until
/// the server's matching -ok arrives or the channel's RPC timeout elapses;
/// asynchronous methods (publish, ack, nack, reject) enqueue their frames and
/// return. All methods take `&self`; calls from multiple threads are
/// serialized per channel, preserving the order they acquire the lock.
pub struct Channel {
    inner: Arc<Mutex<Inner>>,
    channel_id: u16,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

enum Inner {
    Open(ChannelHandle),
    Closed(ShutdownReason),
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}

impl Channel {
    pub(crate) fn new(mut handle: ChannelHandle, dispatch_concurrency: usize) -> Result<Channel> {
        let channel_id = handle.channel_id();
        if let Some(dispatch_rx) = handle.take_dispatch_rx() {
            dispatch::spawn_workers(channel_id, dispatch_rx, dispatch_concurrency)?;
        }
        Ok(Channel {
            inner: Arc::new(Mutex::new(Inner::Open(handle))),
            channel_id,
        })
    }

    /// This channel's number on its connection.
    #[inline]
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Close the channel with a close/close-ok handshake. Dropping a channel
    /// closes it implicitly, discarding any error.
    pub fn close(self) -> Result<()> {
        self.close_impl()
    }

    fn close_impl(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Open(handle) => {
                let result = handle.close();
                // Mark the channel closed even if the handshake failed; the
                // caller can't retry and this keeps drop from trying again.
                *inner = Inner::Closed(ShutdownReason::application());
                result
            }
            Inner::Closed(_) => Ok(()),
        }
    }

    fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ChannelHandle) -> Result<T>,
    {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Open(handle) => {
                let result = f(handle);
                if let Err(err) = &result {
                    if let Some(reason) = fatal_channel_reason(err) {
                        *inner = Inner::Closed(reason);
                    }
                }
                result
            }
            Inner::Closed(reason) => AlreadyClosedSnafu {
                reason: reason.clone(),
            }
            .fail(),
        }
    }

    /// Declare an exchange.
    pub fn exchange_declare<S: Into<String>>(
        &self,
        type_: ExchangeType,
        name: S,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        let declare = options.into_declare(type_, name.into(), false, false);
        self.call(|handle| {
            handle
                .call::<_, exchange::DeclareOk>(AmqpExchange::Declare(declare))
                .map(|_| ())
        })
    }

    /// Verify an exchange exists without creating it; the server closes the
    /// channel with a 404 if it does not.
    pub fn exchange_declare_passive<S: Into<String>>(&self, name: S) -> Result<()> {
        let declare =
            ExchangeDeclareOptions::default().into_declare(ExchangeType::Direct, name.into(), true, false);
        self.call(|handle| {
            handle
                .call::<_, exchange::DeclareOk>(AmqpExchange::Declare(declare))
                .map(|_| ())
        })
    }

    /// Delete an exchange. With `if_unused`, the server only deletes it if it
    /// has no bindings.
    pub fn exchange_delete<S: Into<String>>(&self, name: S, if_unused: bool) -> Result<()> {
        let delete = exchange::Delete {
            ticket: 0,
            exchange: name.into(),
            if_unused,
            nowait: false,
        };
        self.call(|handle| {
            handle
                .call::<_, exchange::DeleteOk>(AmqpExchange::Delete(delete))
                .map(|_| ())
        })
    }

    /// Bind `destination` to receive messages routed by `source`
    /// (exchange-to-exchange binding).
    pub fn exchange_bind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let bind = exchange::Bind {
            ticket: 0,
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            nowait: false,
            arguments,
        };
        self.call(|handle| {
            handle
                .call::<_, exchange::BindOk>(AmqpExchange::Bind(bind))
                .map(|_| ())
        })
    }

    /// Remove an exchange-to-exchange binding.
    pub fn exchange_unbind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        destination: S0,
        source: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let unbind = exchange::Unbind {
            ticket: 0,
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            nowait: false,
            arguments,
        };
        self.call(|handle| {
            handle
                .call::<_, exchange::UnbindOk>(AmqpExchange::Unbind(unbind))
                .map(|_| ())
        })
    }

    /// Declare a queue. An empty name asks the server to generate one; the
    /// name actually declared is returned either way.
    pub fn queue_declare<S: Into<String>>(
        &self,
        name: S,
        options: QueueDeclareOptions,
    ) -> Result<String> {
        let declare = options.into_declare(name.into(), false, false);
        self.call(|handle| {
            let ok = handle.call::<_, queue::DeclareOk>(AmqpQueue::Declare(declare))?;
            Ok(ok.queue)
        })
    }

    /// Verify a queue exists without creating it, returning its current
    /// message and consumer counts. The server closes the channel with a 404
    /// if it does not exist.
    pub fn queue_declare_passive<S: Into<String>>(&self, name: S) -> Result<QueueStatus> {
        let declare = QueueDeclareOptions::default().into_declare(name.into(), true, false);
        self.call(|handle| {
            let ok = handle.call::<_, queue::DeclareOk>(AmqpQueue::Declare(declare))?;
            Ok(QueueStatus {
                queue: ok.queue,
                message_count: ok.message_count,
                consumer_count: ok.consumer_count,
            })
        })
    }

    /// Delete a queue, returning the number of messages it held.
    pub fn queue_delete<S: Into<String>>(
        &self,
        name: S,
        options: QueueDeleteOptions,
    ) -> Result<u32> {
        let delete = options.into_delete(name.into(), false);
        self.call(|handle| {
            let ok = handle.call::<_, queue::DeleteOk>(AmqpQueue::Delete(delete))?;
            Ok(ok.message_count)
        })
    }

    /// Bind a queue to an exchange.
    pub fn queue_bind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let bind = queue::Bind {
            ticket: 0,
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            nowait: false,
            arguments,
        };
        self.call(|handle| {
            handle
                .call::<_, queue::BindOk>(AmqpQueue::Bind(bind))
                .map(|_| ())
        })
    }

    /// Remove a queue-to-exchange binding.
    pub fn queue_unbind<S0: Into<String>, S1: Into<String>, S2: Into<String>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        let unbind = queue::Unbind {
            ticket: 0,
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments,
        };
        self.call(|handle| {
            handle
                .call::<_, queue::UnbindOk>(AmqpQueue::Unbind(unbind))
                .map(|_| ())
        })
    }

    /// Drop all messages currently in a queue, returning how many there were.
    pub fn queue_purge<S: Into<String>>(&self, name: S) -> Result<u32> {
        let purge = queue::Purge {
            ticket: 0,
            queue: name.into(),
            nowait: false,
        };
        self.call(|handle| {
            let ok = handle.call::<_, queue::PurgeOk>(AmqpQueue::Purge(purge))?;
            Ok(ok.message_count)
        })
    }

    /// Set the channel's prefetch window.
    pub fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        let qos = Qos {
            prefetch_size,
            prefetch_count,
            global,
        };
        self.call(|handle| handle.call::<_, QosOk>(AmqpBasic::Qos(qos)).map(|_| ()))
    }

    /// Publish a message. `mandatory` asks the server to return unroutable
    /// messages; returned messages are logged and discarded.
    pub fn basic_publish<T: AsRef<[u8]>, S0: Into<String>, S1: Into<String>>(
        &self,
        content: T,
        exchange: S0,
        routing_key: S1,
        mandatory: bool,
        properties: &AmqpProperties,
    ) -> Result<()> {
        let publish = Publish {
            ticket: 0,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory,
            immediate: false,
        };
        self.call(|handle| {
            handle.send_nowait(AmqpBasic::Publish(publish))?;
            handle.send_content(content.as_ref(), Publish::get_class_id(), properties)
        })
    }

    /// Start a consumer on `queue`, delivering messages to `handler` on the
    /// channel's dispatch workers. An empty `consumer_tag` asks the server to
    /// generate one; the active tag is returned either way.
    pub fn basic_consume<S0: Into<String>, S1: Into<String>>(
        &self,
        queue: S0,
        consumer_tag: S1,
        options: ConsumerOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String> {
        let consume = options.into_consume(queue.into(), consumer_tag.into());
        self.call(|handle| handle.consume(consume, handler))
    }

    /// Cancel a consumer. Its handler receives a final cancellation callback
    /// once the server confirms.
    pub fn basic_cancel<S: Into<String>>(&self, consumer_tag: S) -> Result<()> {
        let cancel = Cancel {
            consumer_tag: consumer_tag.into(),
            nowait: false,
        };
        self.call(|handle| {
            handle
                .call::<_, CancelOk>(AmqpBasic::Cancel(cancel))
                .map(|_| ())
        })
    }

    /// Acknowledge a delivery. The tag is forwarded verbatim; the server is
    /// the arbiter of whether it is still meaningful (it will not be after a
    /// reconnect).
    pub fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let ack = Ack {
            delivery_tag,
            multiple,
        };
        self.call(|handle| handle.send_nowait(AmqpBasic::Ack(ack)))
    }

    /// Negatively acknowledge one or more deliveries, optionally requeueing
    /// them.
    pub fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let nack = Nack {
            delivery_tag,
            multiple,
            requeue,
        };
        self.call(|handle| handle.send_nowait(AmqpBasic::Nack(nack)))
    }

    /// Reject a single delivery, optionally requeueing it.
    pub fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let reject = Reject {
            delivery_tag,
            requeue,
        };
        self.call(|handle| handle.send_nowait(AmqpBasic::Reject(reject)))
    }
}

// Errors that mean this channel handle is permanently dead. A server channel
// close is scoped to the channel; an AlreadyClosed bubbling up from the I/O
// layer means the whole connection is gone.
fn fatal_channel_reason(err: &Error) -> Option<ShutdownReason> {
    match err {
        Error::ServerClosedChannel {
            channel_id,
            code,
            message,
        } => Some(ShutdownReason::peer(
            *code,
            message.clone(),
            Error::ServerClosedChannel {
                channel_id: *channel_id,
                code: *code,
                message: message.clone(),
            },
        )),
        Error::AlreadyClosed { reason } => Some(reason.clone()),
        _ => None,
    }
}
