//! Automatic connection recovery: user-visible connection and channel
//! handles that stay valid across socket loss by replaying recorded topology
//! onto a fresh connection.

use crate::Error;
use std::sync::Arc;
use std::time::Duration;

pub(crate) mod channel;
mod connection;

pub use channel::RecoveringChannel;
pub use connection::RecoveringConnection;

/// Options controlling the reconnect loop and topology replay.
///
/// `RecoveryOptions` uses the builder pattern; the defaults retry every five
/// seconds, replay topology, and fail calls made while a recovery is in
/// progress.
#[derive(Clone, Debug)]
pub struct RecoveryOptions {
    pub(crate) network_recovery_interval: Duration,
    pub(crate) topology_recovery: bool,
    pub(crate) block_while_recovering: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        RecoveryOptions {
            network_recovery_interval: Duration::from_secs(5),
            topology_recovery: true,
            block_while_recovering: false,
        }
    }
}

impl RecoveryOptions {
    /// Delay between reconnect attempts.
    pub fn network_recovery_interval(self, network_recovery_interval: Duration) -> Self {
        RecoveryOptions {
            network_recovery_interval,
            ..self
        }
    }

    /// Whether recorded exchanges, queues, bindings and consumers are
    /// replayed after a reconnect. When off, channels come back open but the
    /// server side is whatever the broker still has; passive declares of
    /// entities the broker dropped will legitimately fail.
    pub fn topology_recovery(self, topology_recovery: bool) -> Self {
        RecoveryOptions {
            topology_recovery,
            ..self
        }
    }

    /// When true, operations issued during a recovery block until it
    /// completes instead of failing with `AlreadyClosed`.
    pub fn block_while_recovering(self, block_while_recovering: bool) -> Self {
        RecoveryOptions {
            block_while_recovering,
            ..self
        }
    }
}

/// Notifications emitted by a recovering connection (and, for
/// `RecoverySucceeded`, by each recovering channel once its own channel is
/// live again). The connection-level `RecoverySucceeded` always precedes the
/// channel-level ones for the same recovery.
#[derive(Clone)]
pub enum RecoveryEvent {
    /// A reconnect attempt or the replay of one recorded entity failed. The
    /// reconnect loop keeps going either way.
    RecoveryFailed { detail: String, error: Arc<Error> },

    /// The connection (or channel, on channel-level listeners) is live
    /// again, with topology replayed per the options.
    RecoverySucceeded,

    /// A server-named queue came back under a new name. All recorded
    /// bindings and consumers were rewritten before being replayed.
    QueueNameChanged { before: String, after: String },

    /// A consumer with a server-assigned tag came back under a new tag.
    ConsumerTagChanged { before: String, after: String },
}
