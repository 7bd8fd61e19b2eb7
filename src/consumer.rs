use crate::{Delivery, FieldTable};
use amq_protocol::protocol::basic::Consume;

/// Callback object invoked for messages arriving on a consumer.
///
/// Handlers are shared (`Arc`) between the channel that registered them and
/// the connection's recovery machinery, which re-attaches the same handler
/// when a consumer is replayed onto a fresh connection. Deliveries for one
/// channel are invoked in broker order as long as the channel's dispatch
/// concurrency is 1 (the default).
///
/// A panic inside a handler is caught and logged; it cancels nothing and
/// never unwinds into the connection's I/O thread.
pub trait ConsumerHandler: Send + Sync + 'static {
    /// A message arrived for this consumer.
    fn on_delivery(&self, delivery: Delivery);

    /// The consumer was cancelled, either by the client (`basic_cancel`), by
    /// the server (e.g., its queue was deleted), or because its channel or
    /// connection went away without recovery.
    fn on_cancelled(&self, _consumer_tag: &str) {}
}

/// Options passed to the server when starting a consumer.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to
/// false and has an empty set of arguments.
#[derive(Clone, Debug, Default)]
pub struct ConsumerOptions {
    /// If true, the server will not send this consumer messages that were
    /// published by the consumer's own connection.
    pub no_local: bool,

    /// If true, the server assumes all delivered messages are acknowledged,
    /// and the client should not acknowledge messages.
    pub no_ack: bool,

    /// If true, requires that this consumer is the only one attached to the
    /// queue. If other consumers are active, the server will close the
    /// channel.
    pub exclusive: bool,

    /// Extra arguments; these are optional in general, but may be needed for
    /// some plugins or server-specific features.
    pub arguments: FieldTable,
}

impl ConsumerOptions {
    pub(crate) fn into_consume(self, queue: String, consumer_tag: String) -> Consume {
        Consume {
            ticket: 0,
            queue,
            consumer_tag,
            no_local: self.no_local,
            no_ack: self.no_ack,
            exclusive: self.exclusive,
            nowait: false,
            arguments: self.arguments,
        }
    }
}
