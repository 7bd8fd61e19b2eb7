use crate::AmqpProperties;
use amq_protocol::protocol::basic::Deliver;

/// A message delivered to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    delivery_tag: u64,
    /// True if this message was previously delivered and requeued.
    pub redelivered: bool,
    /// The exchange the message was published to.
    pub exchange: String,
    /// The routing key the message was published with.
    pub routing_key: String,
    /// The message body.
    pub content: Vec<u8>,
    /// Message properties supplied by the publisher.
    pub properties: AmqpProperties,
}

impl Delivery {
    pub(crate) fn new(
        deliver: Deliver,
        content: Vec<u8>,
        properties: AmqpProperties,
    ) -> (String, Delivery) {
        (
            deliver.consumer_tag,
            Delivery {
                delivery_tag: deliver.delivery_tag,
                redelivered: deliver.redelivered,
                exchange: deliver.exchange,
                routing_key: deliver.routing_key,
                content,
                properties,
            },
        )
    }

    /// The server-assigned delivery tag, scoped to the channel the delivery
    /// arrived on. Pass it to `basic_ack`/`basic_nack`/`basic_reject`.
    ///
    /// Tags do not survive a channel or connection recovery; acking a tag
    /// captured before a reconnect is forwarded to the server as-is, which
    /// may choose to ignore or fault it.
    #[inline]
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}
