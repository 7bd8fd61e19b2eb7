use super::channel::{ChannelCore, RecoveringChannel};
use super::{RecoveryEvent, RecoveryOptions};
use crate::connection::{Connection, ConnectionTuning};
use crate::connection_options::{ConnectionOptions, Endpoint};
use crate::errors::*;
use crate::notification_listeners::{NotificationListener, NotificationListeners};
use crate::shutdown::{ShutdownListener, ShutdownReason};
use crate::topology::{RecordedBinding, RecordedExchange, RecordedQueue, TopologyRecorder};
use crate::{Auth, Channel, ExchangeDeclareOptions, ExchangeType, QueueDeclareOptions, Sasl};
use log::{debug, error, info, warn};
use snafu::{ensure, ResultExt};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::Builder;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Phase {
    Running,
    Recovering,
    GivenUp,
    Closed,
}

pub(super) struct State {
    pub(super) phase: Phase,
    pub(super) connection: Option<Connection>,
    // The shutdown that kicked off the current (or last) recovery; carried
    // on AlreadyClosed errors raised while not running.
    pub(super) last_reason: Option<ShutdownReason>,
}

impl State {
    pub(super) fn current_reason(&self) -> ShutdownReason {
        match self.phase {
            Phase::Closed => ShutdownReason::application(),
            _ => self
                .last_reason
                .clone()
                .unwrap_or_else(ShutdownReason::application),
        }
    }
}

/// State shared between the user-facing handles, the recovering channels,
/// and the monitor thread. Deliberately not generic over the SASL mechanism
/// so channel handles stay plain types.
pub(super) struct Shared {
    pub(super) state: Mutex<State>,
    pub(super) cond: Condvar,
    pub(super) topology: TopologyRecorder,
    pub(super) channels: Mutex<Vec<Weak<ChannelCore>>>,
    pub(super) events: NotificationListeners<RecoveryEvent>,
    pub(super) block_while_recovering: bool,
}

impl Shared {
    fn live_channels(&self) -> Vec<Arc<ChannelCore>> {
        let mut channels = self.channels.lock().unwrap();
        channels.retain(|weak| weak.upgrade().is_some());
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Closed
    }

    // Broadcast a failure unless the user has already closed us; taking the
    // state lock here means a completed close() strictly precedes or
    // strictly follows, so no failure event can trail a completed close.
    fn emit_failure(&self, detail: String, error: Error) {
        let state = self.state.lock().unwrap();
        if state.phase == Phase::Closed {
            return;
        }
        self.events.broadcast(RecoveryEvent::RecoveryFailed {
            detail,
            error: Arc::new(error),
        });
    }
}

struct Core<A: Sasl> {
    endpoints: Vec<Endpoint>,
    options: ConnectionOptions<A>,
    tuning: ConnectionTuning,
    recovery: RecoveryOptions,
    shared: Arc<Shared>,
}

/// A connection that transparently re-establishes itself (and its channels,
/// and its recorded topology) after network or broker failure.
///
/// The handle is cheap to clone-share across threads via `&self` methods; it
/// stays valid across reconnects. A shutdown initiated by the application
/// (`close`/`abort`) is final: no recovery is attempted afterwards, and any
/// further use fails with `AlreadyClosed`.
pub struct RecoveringConnection<A: Sasl = Auth> {
    core: Arc<Core<A>>,
}

impl<A: Sasl> RecoveringConnection<A> {
    /// Connect to the first reachable endpoint and start monitoring for
    /// failures. The endpoint list is kept and walked in order again on
    /// every reconnect attempt.
    pub fn open(
        endpoints: Vec<Endpoint>,
        options: ConnectionOptions<A>,
        recovery: RecoveryOptions,
        tuning: ConnectionTuning,
    ) -> Result<RecoveringConnection<A>> {
        ensure!(!endpoints.is_empty(), NoEndpointsSnafu);

        let connection = try_endpoints(&endpoints, &options, &tuning).map_err(|(err, _)| err)?;
        let listener = connection.register_shutdown_listener();

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                phase: Phase::Running,
                connection: Some(connection),
                last_reason: None,
            }),
            cond: Condvar::new(),
            topology: TopologyRecorder::new(),
            channels: Mutex::new(Vec::new()),
            events: NotificationListeners::new(),
            block_while_recovering: recovery.block_while_recovering,
        });
        let core = Arc::new(Core {
            endpoints,
            options,
            tuning,
            recovery,
            shared,
        });

        spawn_monitor(Arc::clone(&core), listener)?;
        Ok(RecoveringConnection { core })
    }

    /// Subscribe to connection-level recovery notifications.
    pub fn register_recovery_listener(&self) -> NotificationListener<RecoveryEvent> {
        self.core.shared.events.register_listener()
    }

    /// True while the underlying connection is open and recovery has neither
    /// been given up nor been ended by an application close.
    pub fn is_open(&self) -> bool {
        let state = self.core.shared.state.lock().unwrap();
        state.phase == Phase::Running
            && state
                .connection
                .as_ref()
                .map_or(false, Connection::is_open)
    }

    /// Open a recovering channel. While a recovery is in flight this fails
    /// with `AlreadyClosed` (or blocks, per the recovery options); after an
    /// application close it always fails.
    pub fn create_channel(&self) -> Result<RecoveringChannel> {
        let shared = &self.core.shared;
        loop {
            let mut state = shared.state.lock().unwrap();
            match state.phase {
                Phase::Running => {
                    let connection = match state.connection.as_mut() {
                        Some(connection) => connection,
                        None => {
                            return AlreadyClosedSnafu {
                                reason: state.current_reason(),
                            }
                            .fail()
                        }
                    };
                    let channel = connection.open_channel(None)?;
                    let core = Arc::new(ChannelCore::new(Arc::clone(shared), channel));
                    shared
                        .channels
                        .lock()
                        .unwrap()
                        .push(Arc::downgrade(&core));
                    return Ok(RecoveringChannel::new(core, Arc::clone(shared)));
                }
                Phase::Recovering => {
                    if shared.block_while_recovering {
                        let _woken = shared.cond.wait(state).unwrap();
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
        }
    }

    /// Close for good: the monitor stops, no further reconnects happen, and
    /// the underlying connection is closed gracefully. A second close fails
    /// with `AlreadyClosed`.
    pub fn close(&self) -> Result<()> {
        match self.shutdown_for_good() {
            Some(connection) => connection.close(),
            None => AlreadyClosedSnafu {
                reason: ShutdownReason::application(),
            }
            .fail(),
        }
    }

    /// Close for good, suppressing errors (including a repeated close).
    pub fn abort(&self) -> Result<()> {
        match self.shutdown_for_good() {
            Some(connection) => connection.abort(),
            None => Ok(()),
        }
    }

    // Flip to Closed exactly once and hand back the connection (if any) for
    // the caller to close its way. Waking the condvar kicks any blocked
    // operations and a sleeping reconnect loop.
    fn shutdown_for_good(&self) -> Option<Connection> {
        let shared = &self.core.shared;
        let mut state = shared.state.lock().unwrap();
        if state.phase == Phase::Closed {
            return None;
        }
        state.phase = Phase::Closed;
        state.last_reason = Some(ShutdownReason::application());
        let connection = state.connection.take();
        drop(state);
        shared.cond.notify_all();
        // closed mid-recovery leaves no connection behind; the close still
        // succeeded
        connection
    }

    #[cfg(test)]
    pub(crate) fn topology(&self) -> &TopologyRecorder {
        &self.core.shared.topology
    }

    /// Provoke a server-initiated connection close by sending an illegal
    /// frame, so tests can exercise recovery without control over the
    /// broker's lifetime.
    #[cfg(test)]
    pub(crate) fn force_disconnect(&self) {
        let mut state = self.core.shared.state.lock().unwrap();
        if let Some(connection) = state.connection.as_mut() {
            connection.send_illegal_frame_for_tests();
        }
    }
}

fn spawn_monitor<A: Sasl>(core: Arc<Core<A>>, listener: ShutdownListener) -> Result<()> {
    Builder::new()
        .name("durabbit-recovery".to_string())
        .spawn(move || monitor_main(core, listener))
        .context(ForkFailedSnafu)?;
    Ok(())
}

fn monitor_main<A: Sasl>(core: Arc<Core<A>>, mut listener: ShutdownListener) {
    loop {
        let reason = match listener.receiver().recv() {
            Ok(reason) => reason,
            Err(_) => return,
        };
        if reason.is_application_initiated() {
            debug!("connection closed by application; recovery monitor exiting");
            return;
        }
        warn!("connection lost ({}); starting recovery", reason);
        match recover(&core, reason) {
            Some(new_listener) => listener = new_listener,
            None => return,
        }
    }
}

// The reconnect loop. Returns the new connection's shutdown listener on
// success, or None when the user closed the recovering connection (or
// recovery hit a deterministic failure and gave up).
fn recover<A: Sasl>(core: &Arc<Core<A>>, reason: ShutdownReason) -> Option<ShutdownListener> {
    let shared = &core.shared;
    let dead = {
        let mut state = shared.state.lock().unwrap();
        if state.phase == Phase::Closed {
            return None;
        }
        state.phase = Phase::Recovering;
        state.last_reason = Some(reason);
        state.connection.take()
    };
    // dropped outside the state lock: disposing of the dead connection joins
    // its I/O thread
    drop(dead);

    let channels = shared.live_channels();
    for channel in &channels {
        channel.suspend();
    }

    let mut attempt: u64 = 1;
    loop {
        if shared.is_closed() {
            return None;
        }

        match try_endpoints(&core.endpoints, &core.options, &core.tuning) {
            Ok(mut connection) => {
                info!("reconnected on attempt {}", attempt);
                match restore(core, &mut connection, &channels) {
                    Ok(()) => {
                        let listener = connection.register_shutdown_listener();
                        {
                            let mut state = shared.state.lock().unwrap();
                            if state.phase == Phase::Closed {
                                let _ = connection.abort();
                                return None;
                            }
                            state.phase = Phase::Running;
                            state.connection = Some(connection);
                        }
                        shared.cond.notify_all();
                        shared.events.broadcast(RecoveryEvent::RecoverySucceeded);
                        for channel in &channels {
                            channel.emit_recovered();
                        }
                        return Some(listener);
                    }
                    Err(err) => {
                        // the fresh connection died while we were rebuilding
                        // on it; treat as a failed attempt
                        warn!("recovery attempt {} failed mid-restore: {}", attempt, err);
                        for channel in &channels {
                            channel.suspend();
                        }
                        let _ = connection.abort();
                        shared.emit_failure(format!("restore on attempt {} failed", attempt), err);
                    }
                }
            }
            Err((err, all_deterministic)) => {
                warn!("reconnect attempt {} failed: {}", attempt, err);
                if all_deterministic {
                    error!("recovery cannot succeed ({}); giving up", err);
                    shared.emit_failure("giving up".to_string(), err);
                    let mut state = shared.state.lock().unwrap();
                    if state.phase != Phase::Closed {
                        state.phase = Phase::GivenUp;
                    }
                    drop(state);
                    shared.cond.notify_all();
                    return None;
                }
                shared.emit_failure(format!("reconnect attempt {} failed", attempt), err);
            }
        }

        if sleep_interruptibly(shared, core.recovery.network_recovery_interval) {
            return None;
        }
        attempt += 1;
    }
}

// Returns true if the connection was closed while we slept.
fn sleep_interruptibly(shared: &Shared, interval: Duration) -> bool {
    let state = shared.state.lock().unwrap();
    if state.phase == Phase::Closed {
        return true;
    }
    let (state, _timeout) = shared.cond.wait_timeout(state, interval).unwrap();
    state.phase == Phase::Closed
}

// Walk the endpoint list in order; first success wins. On failure, returns
// the last error and whether every endpoint failed deterministically (a
// failure no amount of retrying will fix).
fn try_endpoints<A: Sasl>(
    endpoints: &[Endpoint],
    options: &ConnectionOptions<A>,
    tuning: &ConnectionTuning,
) -> std::result::Result<Connection, (Error, bool)> {
    let mut last_err = None;
    let mut all_deterministic = true;
    for endpoint in endpoints {
        match Connection::connect(endpoint, options.clone(), tuning.clone()) {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                debug!("endpoint {} failed: {}", endpoint, err);
                all_deterministic &= is_deterministic_failure(&err);
                last_err = Some(err);
            }
        }
    }
    let err = last_err.unwrap_or(Error::NoEndpoints);
    Err((err, all_deterministic))
}

// Failures retrying cannot fix: the server and we will disagree just as
// much on the next attempt.
fn is_deterministic_failure(err: &Error) -> bool {
    match err {
        Error::ProtocolVersionMismatch { .. }
        | Error::InvalidCredentials
        | Error::UnsupportedAuthMechanism { .. }
        | Error::UnsupportedLocale { .. }
        | Error::FrameMaxTooSmall { .. } => true,
        _ => false,
    }
}

// Rebuild everything on a fresh connection: one new underlying channel per
// live recovering channel, then the recorded topology in dependency order
// (exchanges, queues, bindings, consumers). Entity-level replay failures are
// reported and skipped; connection-level failures abort the attempt.
fn restore<A: Sasl>(
    core: &Arc<Core<A>>,
    connection: &mut Connection,
    channels: &[Arc<ChannelCore>],
) -> Result<()> {
    for channel in channels {
        let fresh = connection.open_channel(None)?;
        channel.resume(fresh);
    }

    if core.recovery.topology_recovery {
        replay_topology(core, connection)
    } else {
        // the user has been promised no replay; recorded state is void now
        core.shared.topology.clear();
        Ok(())
    }
}

// A channel dedicated to replaying declarations. The server closes a channel
// that faults (e.g. re-declaring with mismatched arguments); when that
// happens the next replay step transparently opens a new one.
struct Replayer<'a> {
    connection: &'a mut Connection,
    channel: Option<Channel>,
}

impl<'a> Replayer<'a> {
    fn new(connection: &'a mut Connection) -> Replayer<'a> {
        Replayer {
            connection,
            channel: None,
        }
    }

    fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Channel) -> Result<T>,
    {
        if self.channel.is_none() {
            self.channel = Some(self.connection.open_channel(None)?);
        }
        // unwrap is safe; just installed above if absent.
        let result = f(self.channel.as_ref().unwrap());
        if result.is_err() {
            self.channel = None;
        }
        result
    }
}

// An error that means the connection under the replay is gone (as opposed to
// the server vetoing one entity).
fn is_connection_fatal(err: &Error) -> bool {
    match err {
        Error::AlreadyClosed { .. }
        | Error::EventLoopDropped
        | Error::EventLoopClientDropped
        | Error::RpcTimeout
        | Error::ExhaustedChannelIds => true,
        _ => false,
    }
}

fn replay_topology<A: Sasl>(core: &Arc<Core<A>>, connection: &mut Connection) -> Result<()> {
    let shared = &core.shared;
    let topology = &shared.topology;
    let mut replayer = Replayer::new(connection);

    // Exchanges and queues first; queue renames rewrite recorded bindings
    // and consumers, so those are snapshotted only after this phase.
    let snapshot = topology.snapshot();
    debug!(
        "replaying topology: {} exchanges, {} queues, {} bindings, {} consumers",
        snapshot.exchanges.len(),
        snapshot.queues.len(),
        topology.binding_count(),
        topology.consumer_count()
    );

    for exchange in snapshot.exchanges {
        let result = replayer.run(|channel| replay_exchange(channel, &exchange));
        if let Err(err) = result {
            if is_connection_fatal(&err) {
                return Err(err);
            }
            shared.emit_failure(format!("recovering exchange {}", exchange.name), err);
        }
    }

    for queue in snapshot.queues {
        let result = replayer.run(|channel| replay_queue(channel, &queue));
        match result {
            Ok(declared) => {
                if queue.server_named && declared != queue.name {
                    info!(
                        "server-named queue {} came back as {}",
                        queue.name, declared
                    );
                    topology.rename_queue(&queue.name, &declared);
                    shared.events.broadcast(RecoveryEvent::QueueNameChanged {
                        before: queue.name.clone(),
                        after: declared,
                    });
                }
            }
            Err(err) => {
                if is_connection_fatal(&err) {
                    return Err(err);
                }
                shared.emit_failure(format!("recovering queue {}", queue.name), err);
            }
        }
    }

    for binding in topology.binding_snapshot() {
        let result = replayer.run(|channel| replay_binding(channel, &binding));
        if let Err(err) = result {
            if is_connection_fatal(&err) {
                return Err(err);
            }
            shared.emit_failure(
                format!("recovering binding from {}", binding.source),
                err,
            );
        }
    }

    for consumer in topology.consumer_snapshot() {
        let channel = match consumer.channel.upgrade() {
            Some(channel) => channel,
            None => {
                // owning channel handle is gone; the consumer goes with it
                topology.delete_consumer(&consumer.consumer_tag);
                continue;
            }
        };
        let requested_tag = if consumer.server_named_tag {
            ""
        } else {
            consumer.consumer_tag.as_str()
        };
        match channel.consume_for_replay(
            &consumer.queue,
            requested_tag,
            consumer.options.clone(),
            Arc::clone(&consumer.handler),
        ) {
            Ok(confirmed_tag) => {
                if confirmed_tag != consumer.consumer_tag {
                    topology.rename_consumer(&consumer.consumer_tag, &confirmed_tag);
                    shared.events.broadcast(RecoveryEvent::ConsumerTagChanged {
                        before: consumer.consumer_tag.clone(),
                        after: confirmed_tag,
                    });
                }
            }
            Err(err) => {
                if is_connection_fatal(&err) {
                    return Err(err);
                }
                shared.emit_failure(
                    format!("recovering consumer {}", consumer.consumer_tag),
                    err,
                );
            }
        }
    }

    Ok(())
}

fn replay_exchange(channel: &Channel, exchange: &RecordedExchange) -> Result<()> {
    channel.exchange_declare(
        ExchangeType::Custom(exchange.type_.clone()),
        exchange.name.clone(),
        ExchangeDeclareOptions {
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            internal: exchange.internal,
            arguments: exchange.arguments.clone(),
        },
    )
}

fn replay_queue(channel: &Channel, queue: &RecordedQueue) -> Result<String> {
    let name = if queue.server_named {
        String::new()
    } else {
        queue.name.clone()
    };
    channel.queue_declare(
        name,
        QueueDeclareOptions {
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            arguments: queue.arguments.clone(),
        },
    )
}

fn replay_binding(channel: &Channel, binding: &RecordedBinding) -> Result<()> {
    use crate::topology::BindingDestination;
    match &binding.destination {
        BindingDestination::Queue(queue) => channel.queue_bind(
            queue.clone(),
            binding.source.clone(),
            binding.routing_key.clone(),
            binding.arguments.clone(),
        ),
        BindingDestination::Exchange(exchange) => channel.exchange_bind(
            exchange.clone(),
            binding.source.clone(),
            binding.routing_key.clone(),
            binding.arguments.clone(),
        ),
    }
}
