use crate::Error;
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Which party initiated a connection or channel shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    /// The application asked for the shutdown (e.g., by calling `close`).
    Application,

    /// The client library shut down on its own (I/O error, missed
    /// heartbeats, protocol violation).
    Library,

    /// The server sent us a close.
    Peer,
}

/// The final, immutable description of why a connection or channel shut down.
#[derive(Clone, Debug)]
pub struct ShutdownReason {
    /// Who initiated the shutdown.
    pub initiator: ShutdownInitiator,

    /// AMQP reply code; 200 for a clean close, 0 when no code applies (e.g.,
    /// the socket simply went away).
    pub reply_code: u16,

    /// Human-readable reply text.
    pub reply_text: String,

    /// The underlying error, if the shutdown was caused by one.
    pub cause: Option<Arc<Error>>,
}

impl ShutdownReason {
    pub(crate) fn application() -> ShutdownReason {
        ShutdownReason {
            initiator: ShutdownInitiator::Application,
            reply_code: 200,
            reply_text: "goodbye".to_string(),
            cause: None,
        }
    }

    pub(crate) fn peer(reply_code: u16, reply_text: String, cause: Error) -> ShutdownReason {
        ShutdownReason {
            initiator: ShutdownInitiator::Peer,
            reply_code,
            reply_text,
            cause: Some(Arc::new(cause)),
        }
    }

    pub(crate) fn library(cause: Error) -> ShutdownReason {
        ShutdownReason {
            initiator: ShutdownInitiator::Library,
            reply_code: 0,
            reply_text: cause.to_string(),
            cause: Some(Arc::new(cause)),
        }
    }

    // For error paths where the original error object must be surfaced to a
    // different caller and only its rendering can be kept here.
    pub(crate) fn library_text(reply_text: String) -> ShutdownReason {
        ShutdownReason {
            initiator: ShutdownInitiator::Library,
            reply_code: 0,
            reply_text,
            cause: None,
        }
    }

    pub(crate) fn end_of_stream(cause: Error) -> ShutdownReason {
        ShutdownReason {
            initiator: ShutdownInitiator::Library,
            reply_code: 0,
            reply_text: "end of stream".to_string(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// True if the application asked for this shutdown.
    pub fn is_application_initiated(&self) -> bool {
        self.initiator == ShutdownInitiator::Application
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "initiator={:?} code={} text={}",
            self.initiator, self.reply_code, self.reply_text
        )
    }
}

/// Write-once latch for a shutdown reason with attached listeners.
///
/// The first `latch()` wins and broadcasts the reason to every registered
/// listener exactly once. Registering a listener after the latch has been set
/// delivers the existing reason to that listener immediately; registration
/// and latching share one lock, so a listener can never miss the reason or
/// see it twice.
pub(crate) struct ShutdownLatch {
    inner: Mutex<Inner>,
}

struct Inner {
    reason: Option<ShutdownReason>,
    next_id: u64,
    listeners: HashMap<u64, Sender<ShutdownReason>>,
}

impl ShutdownLatch {
    pub(crate) fn new() -> Arc<ShutdownLatch> {
        Arc::new(ShutdownLatch {
            inner: Mutex::new(Inner {
                reason: None,
                next_id: 0,
                listeners: HashMap::new(),
            }),
        })
    }

    /// Set the reason if it is not already set. Returns true if this call won
    /// the latch; losers have no effect.
    pub(crate) fn latch(&self, reason: ShutdownReason) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.reason.is_some() {
            return false;
        }
        for tx in inner.listeners.values() {
            // a listener may have been dropped between deregistration and us
            // taking the lock; a failed send just means nobody is reading.
            let _ = tx.send(reason.clone());
        }
        inner.reason = Some(reason);
        true
    }

    pub(crate) fn reason(&self) -> Option<ShutdownReason> {
        self.inner.lock().unwrap().reason.clone()
    }

    pub(crate) fn is_latched(&self) -> bool {
        self.inner.lock().unwrap().reason.is_some()
    }

    pub(crate) fn register(self: &Arc<Self>) -> ShutdownListener {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        if let Some(reason) = &inner.reason {
            // cold delivery - the shutdown already happened.
            let _ = tx.send(reason.clone());
        } else {
            inner.listeners.insert(id, tx);
        }
        ShutdownListener {
            latch: Arc::clone(self),
            id,
            rx,
        }
    }
}

/// Receiving side of a shutdown subscription; delivers the final
/// [`ShutdownReason`](struct.ShutdownReason.html) exactly once.
pub struct ShutdownListener {
    latch: Arc<ShutdownLatch>,
    id: u64,
    rx: Receiver<ShutdownReason>,
}

impl ShutdownListener {
    /// The `crossbeam_channel::Receiver` the reason will arrive on.
    pub fn receiver(&self) -> &Receiver<ShutdownReason> {
        &self.rx
    }
}

impl Drop for ShutdownListener {
    fn drop(&mut self) {
        self.latch.inner.lock().unwrap().listeners.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason() -> ShutdownReason {
        ShutdownReason::application()
    }

    #[test]
    fn listener_registered_before_latch_gets_reason() {
        let latch = ShutdownLatch::new();
        let listener = latch.register();
        assert!(latch.latch(reason()));
        let got = listener.receiver().try_recv().unwrap();
        assert_eq!(got.reply_code, 200);
    }

    #[test]
    fn listener_registered_after_latch_gets_reason_immediately() {
        let latch = ShutdownLatch::new();
        assert!(latch.latch(reason()));
        let listener = latch.register();
        let got = listener.receiver().try_recv().unwrap();
        assert_eq!(got.initiator, ShutdownInitiator::Application);
    }

    #[test]
    fn second_latch_loses() {
        let latch = ShutdownLatch::new();
        let listener = latch.register();
        assert!(latch.latch(reason()));
        assert!(!latch.latch(ShutdownReason::library(crate::Error::UnexpectedSocketClose)));
        let got = listener.receiver().try_recv().unwrap();
        assert_eq!(got.initiator, ShutdownInitiator::Application);
        assert!(listener.receiver().try_recv().is_err());
    }

    #[test]
    fn dropped_listener_is_deregistered() {
        let latch = ShutdownLatch::new();
        let listener = latch.register();
        drop(listener);
        assert!(latch.latch(reason()));
    }
}
