use crate::FieldTable;
use amq_protocol::protocol::queue::{Declare, Delete};

/// Options passed to the server when declaring a queue.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to
/// false and has an empty set of arguments.
#[derive(Clone, Debug, Default)]
pub struct QueueDeclareOptions {
    /// If true, declares queue as durable (survives server restarts); if
    /// false, declares queue as transient (will be deleted on a server
    /// restart).
    pub durable: bool,

    /// If true, declares queue as exclusive: the queue may only be accessed
    /// by the current connection, and it will be deleted when the connection
    /// closes.
    pub exclusive: bool,

    /// If true, declares queue as auto-delete: the server will delete it once
    /// its last consumer is cancelled (or its channel is closed).
    pub auto_delete: bool,

    /// Extra arguments; these are optional in general, but may be needed for
    /// some plugins or server-specific features (e.g., `x-message-ttl`).
    pub arguments: FieldTable,
}

impl QueueDeclareOptions {
    pub(crate) fn into_declare(self, name: String, passive: bool, nowait: bool) -> Declare {
        Declare {
            ticket: 0,
            queue: name,
            passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait,
            arguments: self.arguments,
        }
    }
}

/// Snapshot of a queue returned by a passive declare: its name plus the
/// server's current message and consumer counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    /// The queue's name.
    pub queue: String,
    /// Number of messages ready for delivery.
    pub message_count: u32,
    /// Number of active consumers.
    pub consumer_count: u32,
}

/// Options passed to the server when deleting a queue.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to
/// false.
#[derive(Clone, Debug, Default)]
pub struct QueueDeleteOptions {
    /// If true, the server will only delete the queue if it has no consumers.
    pub if_unused: bool,

    /// If true, the server will only delete the queue if it has no messages.
    pub if_empty: bool,
}

impl QueueDeleteOptions {
    pub(crate) fn into_delete(self, name: String, nowait: bool) -> Delete {
        Delete {
            ticket: 0,
            queue: name,
            if_unused: self.if_unused,
            if_empty: self.if_empty,
            nowait,
        }
    }
}
