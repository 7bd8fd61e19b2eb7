//! durabbit is an AMQP 0-9-1 client whose connections and channels survive
//! network and broker failures: the [`RecoveringConnection`] handle watches
//! its underlying connection, reconnects through a configurable endpoint
//! list when it dies, and replays every exchange, queue, binding and
//! consumer the application declared.
//!
//! The protocol engine underneath ([`Connection`]/[`Channel`]) is a plain
//! synchronous client: one I/O thread per connection drives the socket and
//! heartbeats, channels multiplex over it, and synchronous calls block until
//! the server answers. It can be used on its own when reconnection is
//! handled elsewhere.
//!
//! ```no_run
//! use durabbit::{
//!     ConnectionOptions, ConnectionTuning, Endpoint, QueueDeclareOptions,
//!     RecoveringConnection, RecoveryOptions,
//! };
//!
//! # fn main() -> durabbit::Result<()> {
//! let conn = RecoveringConnection::open(
//!     vec![Endpoint::parse("amqp://localhost")?],
//!     ConnectionOptions::default(),
//!     RecoveryOptions::default(),
//!     ConnectionTuning::default(),
//! )?;
//! let channel = conn.create_channel()?;
//! let queue = channel.queue_declare("jobs", QueueDeclareOptions::default())?;
//! # let _ = queue;
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod connection;
mod connection_options;
mod consumer;
mod delivery;
mod dispatch;
mod errors;
mod exchange;
mod frame_buffer;
mod heartbeats;
mod io_loop;
mod notification_listeners;
mod queue;
mod recovery;
mod serialize;
mod shutdown;
mod stream;
mod topology;

#[cfg(test)]
mod integration_tests;

pub use crate::auth::{Auth, Sasl};
pub use crate::channel::Channel;
pub use crate::connection::{Connection, ConnectionTuning};
pub use crate::connection_options::{ConnectionOptions, Endpoint};
pub use crate::consumer::{ConsumerHandler, ConsumerOptions};
pub use crate::delivery::Delivery;
pub use crate::errors::{Error, Result};
pub use crate::exchange::{ExchangeDeclareOptions, ExchangeType};
pub use crate::notification_listeners::NotificationListener;
pub use crate::queue::{QueueDeclareOptions, QueueDeleteOptions, QueueStatus};
pub use crate::recovery::{
    RecoveringChannel, RecoveringConnection, RecoveryEvent, RecoveryOptions,
};
pub use crate::shutdown::{ShutdownInitiator, ShutdownListener, ShutdownReason};
pub use crate::stream::IoStream;

pub use amq_protocol::protocol::basic::AMQPProperties as AmqpProperties;
pub use amq_protocol::types::AMQPValue as AmqpValue;
pub use amq_protocol::types::FieldTable;

#[allow(dead_code)]
mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
