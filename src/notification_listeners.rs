use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of broadcast listeners. Unlike a shutdown latch, notifications
/// here may be broadcast any number of times; listeners deregister themselves
/// on drop.
#[derive(Clone)]
pub(crate) struct NotificationListeners<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone> NotificationListeners<T> {
    pub(crate) fn new() -> Self {
        NotificationListeners {
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    pub(crate) fn register_listener(&self) -> NotificationListener<T> {
        let (id, rx) = self.inner.lock().unwrap().add_listener();
        let inner = Arc::clone(&self.inner);
        NotificationListener { inner, id, rx }
    }

    pub(crate) fn broadcast(&self, note: T) {
        let inner = self.inner.lock().unwrap();
        for tx in inner.listeners.values() {
            // listeners remove themselves on drop, but a drop can race our
            // lock acquisition; a failed send means nobody is reading.
            let _ = tx.send(note.clone());
        }
    }
}

struct Inner<T> {
    next_id: u64,
    listeners: HashMap<u64, Sender<T>>,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Inner {
            next_id: 0,
            listeners: HashMap::new(),
        }
    }

    fn add_listener(&mut self) -> (u64, Receiver<T>) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = crossbeam_channel::unbounded();
        self.listeners.insert(id, tx);

        (id, rx)
    }
}

/// Receiving side of an event subscription.
pub struct NotificationListener<T> {
    inner: Arc<Mutex<Inner<T>>>,
    id: u64,
    rx: Receiver<T>,
}

impl<T> NotificationListener<T> {
    /// The `crossbeam_channel::Receiver` notifications will arrive on.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

impl<T> Drop for NotificationListener<T> {
    fn drop(&mut self) {
        self.inner.lock().unwrap().listeners.remove(&self.id);
    }
}
