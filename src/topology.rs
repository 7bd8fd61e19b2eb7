use crate::consumer::{ConsumerHandler, ConsumerOptions};
use crate::recovery::channel::ChannelCore;
use crate::FieldTable;
use indexmap::IndexMap;
use log::debug;
use std::sync::{Arc, Mutex, Weak};

/// A client-declared exchange, as it must be re-declared after a reconnect.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RecordedExchange {
    pub(crate) name: String,
    pub(crate) type_: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) arguments: FieldTable,
}

/// A client-declared queue. `server_named` queues are re-declared with an
/// empty name on recovery and picked up under whatever name the server
/// assigns next.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RecordedQueue {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) server_named: bool,
    pub(crate) arguments: FieldTable,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum BindingDestination {
    Queue(String),
    Exchange(String),
}

/// A binding, identified by all four of its fields.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RecordedBinding {
    pub(crate) source: String,
    pub(crate) destination: BindingDestination,
    pub(crate) routing_key: String,
    pub(crate) arguments: FieldTable,
}

/// An active consumer and everything needed to re-establish it: its handler
/// and a weak reference to the recovering channel it belongs to. The weak
/// reference keeps the recorder out of the handle's ownership cycle; a
/// consumer whose channel is gone is pruned at replay time.
#[derive(Clone)]
pub(crate) struct RecordedConsumer {
    pub(crate) consumer_tag: String,
    pub(crate) queue: String,
    pub(crate) options: ConsumerOptions,
    pub(crate) server_named_tag: bool,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) channel: Weak<ChannelCore>,
}

/// Ordered clones of the recorded state for one replay pass.
pub(crate) struct TopologySnapshot {
    pub(crate) exchanges: Vec<RecordedExchange>,
    pub(crate) queues: Vec<RecordedQueue>,
}

// Exchanges the broker predeclares. They exist on every vhost, are never
// (re)declared by clients, and so are never recorded; bindings may still
// name them as a source.
fn is_predeclared_exchange(name: &str) -> bool {
    name.is_empty() || name.starts_with("amq.")
}

/// The topology recorder: everything this client has declared on the current
/// logical connection, in declaration order, ready to be replayed onto a
/// fresh connection.
///
/// One mutex guards all four collections because auto-delete pruning cascades
/// across them: deleting a consumer can prune its queue, which deletes
/// bindings, which can prune exchanges, recursively. The pruning rules mirror
/// what the broker does server-side while we are disconnected, so a replay
/// never re-declares an entity the broker already dropped.
pub(crate) struct TopologyRecorder {
    inner: Mutex<Recorded>,
}

#[derive(Default)]
struct Recorded {
    exchanges: IndexMap<String, RecordedExchange>,
    queues: IndexMap<String, RecordedQueue>,
    bindings: Vec<RecordedBinding>,
    consumers: IndexMap<String, RecordedConsumer>,
}

enum PruneCandidate {
    Exchange(String),
    Queue(String),
}

impl TopologyRecorder {
    pub(crate) fn new() -> TopologyRecorder {
        TopologyRecorder {
            inner: Mutex::new(Recorded::default()),
        }
    }

    pub(crate) fn record_exchange(&self, exchange: RecordedExchange) {
        if is_predeclared_exchange(&exchange.name) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.exchanges.insert(exchange.name.clone(), exchange);
    }

    pub(crate) fn delete_exchange(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let mut candidates = Vec::new();
        inner.remove_exchange_cascade(name, &mut candidates);
        inner.prune(candidates);
    }

    pub(crate) fn record_queue(&self, queue: RecordedQueue) {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.insert(queue.name.clone(), queue);
    }

    pub(crate) fn delete_queue(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let mut candidates = Vec::new();
        inner.remove_queue_cascade(name, &mut candidates);
        inner.prune(candidates);
    }

    pub(crate) fn record_binding(&self, binding: RecordedBinding) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.bindings.contains(&binding) {
            inner.bindings.push(binding);
        }
    }

    pub(crate) fn delete_binding(&self, binding: &RecordedBinding) {
        let mut inner = self.inner.lock().unwrap();
        let position = match inner.bindings.iter().position(|b| b == binding) {
            Some(position) => position,
            None => return,
        };
        let removed = inner.bindings.remove(position);
        let mut candidates = vec![PruneCandidate::Exchange(removed.source)];
        candidates.push(match removed.destination {
            BindingDestination::Queue(queue) => PruneCandidate::Queue(queue),
            BindingDestination::Exchange(exchange) => PruneCandidate::Exchange(exchange),
        });
        inner.prune(candidates);
    }

    pub(crate) fn record_consumer(&self, consumer: RecordedConsumer) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .consumers
            .insert(consumer.consumer_tag.clone(), consumer);
    }

    pub(crate) fn delete_consumer(&self, consumer_tag: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(consumer) = inner.consumers.shift_remove(consumer_tag) {
            inner.prune(vec![PruneCandidate::Queue(consumer.queue)]);
        }
    }

    /// Remove every consumer owned by `channel` (used when a recovering
    /// channel is closed or dropped; its consumers must not be replayed).
    pub(crate) fn delete_consumers_of_channel(&self, channel: &Weak<ChannelCore>) {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<String> = inner
            .consumers
            .values()
            .filter(|c| Weak::ptr_eq(&c.channel, channel))
            .map(|c| c.consumer_tag.clone())
            .collect();
        let mut candidates = Vec::new();
        for tag in doomed {
            if let Some(consumer) = inner.consumers.shift_remove(&tag) {
                candidates.push(PruneCandidate::Queue(consumer.queue));
            }
        }
        inner.prune(candidates);
    }

    /// Rewrite every reference to a renamed queue. Called during replay when
    /// a server-named queue comes back under a fresh name, before any of its
    /// bindings or consumers are issued.
    pub(crate) fn rename_queue(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut queue) = inner.queues.shift_remove(old) {
            queue.name = new.to_string();
            inner.queues.insert(new.to_string(), queue);
        }
        for binding in &mut inner.bindings {
            if let BindingDestination::Queue(queue) = &mut binding.destination {
                if queue == old {
                    *queue = new.to_string();
                }
            }
        }
        for consumer in inner.consumers.values_mut() {
            if consumer.queue == old {
                consumer.queue = new.to_string();
            }
        }
    }

    /// Rewrite a consumer's tag after the server assigned a fresh one during
    /// replay.
    pub(crate) fn rename_consumer(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut consumer) = inner.consumers.shift_remove(old) {
            consumer.consumer_tag = new.to_string();
            inner.consumers.insert(new.to_string(), consumer);
        }
    }

    /// Exchanges and queues to replay, in declaration order. Bindings and
    /// consumers are snapshotted separately ([`binding_snapshot`],
    /// [`consumer_snapshot`]) because queue renames during replay rewrite
    /// them in place.
    pub(crate) fn snapshot(&self) -> TopologySnapshot {
        let inner = self.inner.lock().unwrap();
        TopologySnapshot {
            exchanges: inner.exchanges.values().cloned().collect(),
            queues: inner.queues.values().cloned().collect(),
        }
    }

    pub(crate) fn binding_snapshot(&self) -> Vec<RecordedBinding> {
        self.inner.lock().unwrap().bindings.clone()
    }

    pub(crate) fn consumer_snapshot(&self) -> Vec<RecordedConsumer> {
        self.inner.lock().unwrap().consumers.values().cloned().collect()
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Recorded::default();
    }

    pub(crate) fn binding_count(&self) -> usize {
        self.inner.lock().unwrap().bindings.len()
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.inner.lock().unwrap().consumers.len()
    }
}

impl Recorded {
    // Prune rules mirror the broker's auto-delete behaviour:
    //  - a queue goes away when nothing consumes from it and nothing is
    //    bound to it;
    //  - an exchange goes away when no binding sources from it and no
    //    auto-delete exchange feeds into it.
    // Removal cascades into the bindings that referenced the entity, which
    // can make further entities eligible, so we work a candidate list to a
    // fixed point.
    fn prune(&mut self, mut candidates: Vec<PruneCandidate>) {
        while let Some(candidate) = candidates.pop() {
            match candidate {
                PruneCandidate::Queue(name) => {
                    if self.queue_is_prunable(&name) {
                        debug!("pruning auto-delete queue {}", name);
                        self.remove_queue_cascade(&name, &mut candidates);
                    }
                }
                PruneCandidate::Exchange(name) => {
                    if self.exchange_is_prunable(&name) {
                        debug!("pruning auto-delete exchange {}", name);
                        self.remove_exchange_cascade(&name, &mut candidates);
                    }
                }
            }
        }
    }

    fn queue_is_prunable(&self, name: &str) -> bool {
        let auto_delete = match self.queues.get(name) {
            Some(queue) => queue.auto_delete,
            None => return false,
        };
        auto_delete
            && !self.consumers.values().any(|c| c.queue == name)
            && !self
                .bindings
                .iter()
                .any(|b| b.destination == BindingDestination::Queue(name.to_string()))
    }

    fn exchange_is_prunable(&self, name: &str) -> bool {
        let auto_delete = match self.exchanges.get(name) {
            Some(exchange) => exchange.auto_delete,
            None => return false,
        };
        let sources_anything = self.bindings.iter().any(|b| b.source == name);
        let fed_by_auto_delete = self.bindings.iter().any(|b| {
            b.destination == BindingDestination::Exchange(name.to_string())
                && self
                    .exchanges
                    .get(&b.source)
                    .map_or(false, |source| source.auto_delete)
        });
        auto_delete && !sources_anything && !fed_by_auto_delete
    }

    fn remove_queue_cascade(&mut self, name: &str, candidates: &mut Vec<PruneCandidate>) {
        self.queues.shift_remove(name);
        self.consumers.retain(|_, c| c.queue != name);
        let destination = BindingDestination::Queue(name.to_string());
        let mut remaining = Vec::with_capacity(self.bindings.len());
        for binding in self.bindings.drain(..) {
            if binding.destination == destination {
                candidates.push(PruneCandidate::Exchange(binding.source));
            } else {
                remaining.push(binding);
            }
        }
        self.bindings = remaining;
    }

    fn remove_exchange_cascade(&mut self, name: &str, candidates: &mut Vec<PruneCandidate>) {
        self.exchanges.shift_remove(name);
        let as_destination = BindingDestination::Exchange(name.to_string());
        let mut remaining = Vec::with_capacity(self.bindings.len());
        for binding in self.bindings.drain(..) {
            if binding.source == name {
                candidates.push(match binding.destination {
                    BindingDestination::Queue(queue) => PruneCandidate::Queue(queue),
                    BindingDestination::Exchange(exchange) => PruneCandidate::Exchange(exchange),
                });
            } else if binding.destination == as_destination {
                candidates.push(PruneCandidate::Exchange(binding.source));
            } else {
                remaining.push(binding);
            }
        }
        self.bindings = remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Delivery;

    struct NullHandler;

    impl ConsumerHandler for NullHandler {
        fn on_delivery(&self, _delivery: Delivery) {}
    }

    fn exchange(name: &str, auto_delete: bool) -> RecordedExchange {
        RecordedExchange {
            name: name.to_string(),
            type_: "fanout".to_string(),
            durable: false,
            auto_delete,
            internal: false,
            arguments: FieldTable::new(),
        }
    }

    fn queue(name: &str, auto_delete: bool) -> RecordedQueue {
        RecordedQueue {
            name: name.to_string(),
            durable: false,
            exclusive: false,
            auto_delete,
            server_named: false,
            arguments: FieldTable::new(),
        }
    }

    fn queue_binding(source: &str, queue: &str) -> RecordedBinding {
        RecordedBinding {
            source: source.to_string(),
            destination: BindingDestination::Queue(queue.to_string()),
            routing_key: "key".to_string(),
            arguments: FieldTable::new(),
        }
    }

    fn exchange_binding(source: &str, destination: &str) -> RecordedBinding {
        RecordedBinding {
            source: source.to_string(),
            destination: BindingDestination::Exchange(destination.to_string()),
            routing_key: "key".to_string(),
            arguments: FieldTable::new(),
        }
    }

    fn consumer(tag: &str, queue: &str) -> RecordedConsumer {
        RecordedConsumer {
            consumer_tag: tag.to_string(),
            queue: queue.to_string(),
            options: ConsumerOptions::default(),
            server_named_tag: false,
            handler: Arc::new(NullHandler),
            channel: Weak::new(),
        }
    }

    #[test]
    fn declare_then_delete_restores_counts() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("logs", false));
        recorder.record_queue(queue("q1", false));
        assert_eq!(recorder.exchange_count(), 1);
        assert_eq!(recorder.queue_count(), 1);

        recorder.delete_exchange("logs");
        recorder.delete_queue("q1");
        assert_eq!(recorder.exchange_count(), 0);
        assert_eq!(recorder.queue_count(), 0);
    }

    #[test]
    fn record_exchange_and_binding_are_idempotent() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("logs", false));
        recorder.record_exchange(exchange("logs", false));
        recorder.record_binding(queue_binding("logs", "q1"));
        recorder.record_binding(queue_binding("logs", "q1"));
        assert_eq!(recorder.exchange_count(), 1);
        assert_eq!(recorder.binding_count(), 1);
    }

    #[test]
    fn predeclared_exchanges_are_never_recorded() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("", false));
        recorder.record_exchange(exchange("amq.fanout", false));
        assert_eq!(recorder.exchange_count(), 0);

        // bindings may still reference them as a source
        recorder.record_queue(queue("q1", false));
        recorder.record_binding(queue_binding("amq.fanout", "q1"));
        assert_eq!(recorder.binding_count(), 1);
    }

    #[test]
    fn delete_exchange_cascades_bindings() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("logs", false));
        recorder.record_queue(queue("q1", false));
        recorder.record_binding(queue_binding("logs", "q1"));

        recorder.delete_exchange("logs");
        assert_eq!(recorder.binding_count(), 0);
        assert_eq!(recorder.queue_count(), 1); // q1 is not auto-delete
    }

    #[test]
    fn delete_queue_cascades_bindings_and_consumers() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("logs", false));
        recorder.record_queue(queue("q1", false));
        recorder.record_binding(queue_binding("logs", "q1"));
        recorder.record_consumer(consumer("tag-1", "q1"));

        recorder.delete_queue("q1");
        assert_eq!(recorder.binding_count(), 0);
        assert_eq!(recorder.consumer_count(), 0);
        assert_eq!(recorder.exchange_count(), 1);
    }

    #[test]
    fn auto_delete_queue_pruned_after_last_reference() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("logs", false));
        recorder.record_queue(queue("q1", true));
        recorder.record_binding(queue_binding("logs", "q1"));
        recorder.record_consumer(consumer("tag-1", "q1"));

        // still referenced by the binding after the consumer goes
        recorder.delete_consumer("tag-1");
        assert_eq!(recorder.queue_count(), 1);

        recorder.delete_binding(&queue_binding("logs", "q1"));
        assert_eq!(recorder.queue_count(), 0);
    }

    #[test]
    fn auto_delete_exchange_pruned_after_last_unbind() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("events", true));
        recorder.record_queue(queue("q1", false));
        recorder.record_binding(queue_binding("events", "q1"));

        recorder.delete_binding(&queue_binding("events", "q1"));
        assert_eq!(recorder.exchange_count(), 0);
        assert_eq!(recorder.queue_count(), 1);
    }

    #[test]
    fn prune_recurses_through_exchange_chains() {
        let recorder = TopologyRecorder::new();
        // y (auto-delete) feeds x (auto-delete) feeds q1 (auto-delete,
        // one consumer)
        recorder.record_exchange(exchange("x", true));
        recorder.record_exchange(exchange("y", true));
        recorder.record_queue(queue("q1", true));
        recorder.record_binding(exchange_binding("y", "x"));
        recorder.record_binding(queue_binding("x", "q1"));
        recorder.record_consumer(consumer("tag-1", "q1"));

        // q1 still has its binding, so nothing is pruned yet
        recorder.delete_consumer("tag-1");
        assert_eq!(recorder.queue_count(), 1);
        assert_eq!(recorder.exchange_count(), 2);

        // dropping the q1 binding prunes q1; x loses its only sourced
        // binding but is still fed by auto-delete y, so the y->x binding
        // keeps both alive until it goes too
        recorder.delete_binding(&queue_binding("x", "q1"));
        assert_eq!(recorder.queue_count(), 0);
        assert_eq!(recorder.exchange_count(), 2);

        recorder.delete_binding(&exchange_binding("y", "x"));
        assert_eq!(recorder.exchange_count(), 0);
        assert_eq!(recorder.binding_count(), 0);
    }

    #[test]
    fn deleting_queue_prunes_auto_delete_source_exchange() {
        let recorder = TopologyRecorder::new();
        recorder.record_exchange(exchange("events", true));
        recorder.record_queue(queue("q1", false));
        recorder.record_binding(queue_binding("events", "q1"));

        recorder.delete_queue("q1");
        assert_eq!(recorder.exchange_count(), 0);
        assert_eq!(recorder.binding_count(), 0);
    }

    #[test]
    fn rename_queue_rewrites_bindings_and_consumers() {
        let recorder = TopologyRecorder::new();
        let mut q = queue("amq.gen-old", true);
        q.server_named = true;
        recorder.record_queue(q);
        recorder.record_binding(queue_binding("amq.fanout", "amq.gen-old"));
        recorder.record_consumer(consumer("tag-1", "amq.gen-old"));

        recorder.rename_queue("amq.gen-old", "amq.gen-new");

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.queues.len(), 1);
        assert_eq!(snapshot.queues[0].name, "amq.gen-new");
        assert!(snapshot.queues[0].server_named);

        let bindings = recorder.binding_snapshot();
        assert_eq!(
            bindings[0].destination,
            BindingDestination::Queue("amq.gen-new".to_string())
        );

        let consumers = recorder.consumer_snapshot();
        assert_eq!(consumers[0].queue, "amq.gen-new");
    }

    #[test]
    fn rename_consumer_rekeys_the_record() {
        let recorder = TopologyRecorder::new();
        recorder.record_queue(queue("q1", false));
        recorder.record_consumer(consumer("old-tag", "q1"));

        recorder.rename_consumer("old-tag", "new-tag");
        let consumers = recorder.consumer_snapshot();
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].consumer_tag, "new-tag");

        recorder.delete_consumer("new-tag");
        assert_eq!(recorder.consumer_count(), 0);
    }

    #[test]
    fn snapshot_preserves_declaration_order() {
        let recorder = TopologyRecorder::new();
        for i in 0..10 {
            recorder.record_exchange(exchange(&format!("ex-{}", i), false));
            recorder.record_queue(queue(&format!("q-{}", i), false));
        }
        let snapshot = recorder.snapshot();
        for i in 0..10 {
            assert_eq!(snapshot.exchanges[i].name, format!("ex-{}", i));
            assert_eq!(snapshot.queues[i].name, format!("q-{}", i));
        }
    }

    // Tiny deterministic PRNG so the sequence test needs no dev-dependency.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn below(&mut self, bound: usize) -> usize {
            (self.next() % bound as u64) as usize
        }
    }

    // Random declare/bind/unbind/delete sequences; afterwards remove every
    // remaining consumer and binding and verify all auto-delete entities
    // are gone while durable ones survive. Binding endpoints must stay
    // consistent with the recorded set throughout.
    #[test]
    fn random_sequences_leave_no_orphaned_auto_delete_entities() {
        let mut rng = XorShift(0x9e3779b97f4a7c15);
        for round in 0..200 {
            let recorder = TopologyRecorder::new();
            let mut tag_counter = 0u32;
            for _ in 0..100 {
                match rng.below(8) {
                    0 => {
                        let name = format!("ex-{}", rng.below(4));
                        recorder.record_exchange(exchange(&name, rng.below(2) == 0));
                    }
                    1 => {
                        let name = format!("q-{}", rng.below(4));
                        recorder.record_queue(queue(&name, rng.below(2) == 0));
                    }
                    2 => {
                        let source = format!("ex-{}", rng.below(4));
                        let dest = format!("q-{}", rng.below(4));
                        if recorder.has_exchange(&source) && recorder.has_queue(&dest) {
                            recorder.record_binding(queue_binding(&source, &dest));
                        }
                    }
                    3 => {
                        let queue_name = format!("q-{}", rng.below(4));
                        if recorder.has_queue(&queue_name) {
                            tag_counter += 1;
                            let tag = format!("tag-{}", tag_counter);
                            recorder.record_consumer(consumer(&tag, &queue_name));
                        }
                    }
                    4 => recorder.delete_exchange(&format!("ex-{}", rng.below(4))),
                    5 => recorder.delete_queue(&format!("q-{}", rng.below(4))),
                    6 => {
                        let source = format!("ex-{}", rng.below(4));
                        let dest = format!("q-{}", rng.below(4));
                        recorder.delete_binding(&queue_binding(&source, &dest));
                    }
                    _ => {
                        let tags: Vec<String> = recorder
                            .consumer_snapshot()
                            .into_iter()
                            .map(|c| c.consumer_tag)
                            .collect();
                        if !tags.is_empty() {
                            let victim = &tags[rng.below(tags.len())];
                            recorder.delete_consumer(victim);
                        }
                    }
                }

                // bindings must never dangle
                for binding in recorder.binding_snapshot() {
                    assert!(
                        is_predeclared_exchange(&binding.source)
                            || recorder.has_exchange(&binding.source),
                        "round {}: binding source {} not recorded",
                        round,
                        binding.source
                    );
                    match &binding.destination {
                        BindingDestination::Queue(q) => assert!(recorder.has_queue(q)),
                        BindingDestination::Exchange(e) => assert!(recorder.has_exchange(e)),
                    }
                }
            }

            // drain the remaining references; every auto-delete entity must
            // disappear with them
            for c in recorder.consumer_snapshot() {
                recorder.delete_consumer(&c.consumer_tag);
            }
            for b in recorder.binding_snapshot() {
                recorder.delete_binding(&b);
            }
            let snapshot = recorder.snapshot();
            assert!(
                snapshot.queues.iter().all(|q| !q.auto_delete),
                "round {}: auto-delete queue survived",
                round
            );
            assert!(
                snapshot.exchanges.iter().all(|e| !e.auto_delete),
                "round {}: auto-delete exchange survived",
                round
            );
            assert_eq!(recorder.binding_count(), 0);
            assert_eq!(recorder.consumer_count(), 0);
        }
    }
}

#[cfg(test)]
impl TopologyRecorder {
    pub(crate) fn exchange_count(&self) -> usize {
        self.inner.lock().unwrap().exchanges.len()
    }

    pub(crate) fn queue_count(&self) -> usize {
        self.inner.lock().unwrap().queues.len()
    }

    pub(crate) fn consumer_tags(&self) -> Vec<String> {
        self.inner.lock().unwrap().consumers.keys().cloned().collect()
    }

    fn has_exchange(&self, name: &str) -> bool {
        self.inner.lock().unwrap().exchanges.contains_key(name)
    }

    fn has_queue(&self, name: &str) -> bool {
        self.inner.lock().unwrap().queues.contains_key(name)
    }
}
