use crate::connection_options::{ConnectionOptions, Endpoint};
use crate::errors::*;
use crate::io_loop::{Channel0Handle, IoLoop};
use crate::shutdown::{ShutdownLatch, ShutdownListener, ShutdownReason};
use crate::stream::connect_tcp;
use crate::{Channel, FieldTable, IoStream, Sasl};
use log::{debug, warn};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Perf-oriented knobs for a connection's I/O machinery. The defaults are
/// reasonable for most workloads.
#[derive(Clone, Debug)]
pub struct ConnectionTuning {
    /// Bound on the in-memory channels feeding the I/O thread.
    pub mem_channel_bound: usize,

    /// Once this many bytes of serialized frames are waiting to be written,
    /// the I/O thread stops accepting data from non-0 channels...
    pub buffered_writes_high_water: usize,

    /// ...until the backlog drains below this.
    pub buffered_writes_low_water: usize,

    /// Number of dispatch workers per channel; each bounds its channel to
    /// that many concurrently running consumer callbacks. Values above 1
    /// give up delivery ordering within the channel.
    pub consumer_dispatch_concurrency: usize,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        ConnectionTuning {
            mem_channel_bound: 16,
            buffered_writes_high_water: 16 << 20,
            buffered_writes_low_water: 0,
            consumer_dispatch_concurrency: 1,
        }
    }
}

impl ConnectionTuning {
    pub fn mem_channel_bound(self, mem_channel_bound: usize) -> Self {
        ConnectionTuning {
            mem_channel_bound,
            ..self
        }
    }

    pub fn buffered_writes_high_water(self, buffered_writes_high_water: usize) -> Self {
        ConnectionTuning {
            buffered_writes_high_water,
            ..self
        }
    }

    pub fn buffered_writes_low_water(self, buffered_writes_low_water: usize) -> Self {
        ConnectionTuning {
            buffered_writes_low_water,
            ..self
        }
    }

    pub fn consumer_dispatch_concurrency(self, consumer_dispatch_concurrency: usize) -> Self {
        ConnectionTuning {
            consumer_dispatch_concurrency,
            ..self
        }
    }
}

/// A single AMQP connection: one socket, one I/O thread, multiplexed
/// channels. This handle does not reconnect; the recovery layer wraps it
/// with one that does.
pub struct Connection {
    join_handle: Option<JoinHandle<Result<()>>>,
    channel0: Channel0Handle,
    shutdown: Arc<ShutdownLatch>,
    server_properties: FieldTable,
    dispatch_concurrency: usize,
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close_impl(true);
    }
}

impl Connection {
    /// Run the AMQP handshake over an already-connected stream. Returns once
    /// the connection is open (or the handshake failed).
    pub fn open<Auth: Sasl, S: IoStream>(
        stream: S,
        options: ConnectionOptions<Auth>,
        tuning: ConnectionTuning,
    ) -> Result<Connection> {
        let shutdown = ShutdownLatch::new();
        let dispatch_concurrency = tuning.consumer_dispatch_concurrency;
        let io_loop = IoLoop::new(&tuning, Arc::clone(&shutdown))?;
        let (join_handle, server_properties, channel0) = io_loop.start(stream, options)?;
        Ok(Connection {
            join_handle: Some(join_handle),
            channel0,
            shutdown,
            server_properties,
            dispatch_concurrency,
        })
    }

    /// Dial an endpoint over TCP and open a connection on it. The options'
    /// connection timeout bounds the TCP connect as well as the handshake.
    pub fn connect<Auth: Sasl>(
        endpoint: &Endpoint,
        options: ConnectionOptions<Auth>,
        tuning: ConnectionTuning,
    ) -> Result<Connection> {
        debug!("connecting to {}", endpoint);
        let stream = connect_tcp(endpoint, options.connection_timeout)?;
        Connection::open(stream, options, tuning)
    }

    /// Properties the server reported in its connection.start.
    pub fn server_properties(&self) -> &FieldTable {
        &self.server_properties
    }

    /// Subscribe to the connection's final shutdown reason. The reason is
    /// delivered exactly once per listener; subscribing after shutdown
    /// delivers it immediately.
    pub fn register_shutdown_listener(&self) -> ShutdownListener {
        self.shutdown.register()
    }

    /// The reason this connection shut down, if it has.
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shutdown.reason()
    }

    /// True until the connection has shut down for any reason.
    pub fn is_open(&self) -> bool {
        !self.shutdown.is_latched()
    }

    /// Open a channel. `channel_id` of None picks the lowest free number;
    /// an explicit id fails if it is taken or out of range.
    pub fn open_channel(&mut self, channel_id: Option<u16>) -> Result<Channel> {
        let handle = self.channel0.open_channel(channel_id)?;
        Channel::new(handle, self.dispatch_concurrency)
    }

    /// Close with a connection.close handshake, surfacing any failure. If
    /// the server's close-ok doesn't arrive within the RPC timeout, the
    /// socket is torn down anyway and `RpcTimeout` is returned.
    pub fn close(mut self) -> Result<()> {
        self.close_impl(false)
    }

    /// Close, suppressing already-closed and I/O errors. Preferred when the
    /// connection is already known (or suspected) to be dead.
    pub fn abort(mut self) -> Result<()> {
        self.close_impl(true)
    }

    #[cfg(test)]
    pub(crate) fn send_illegal_frame_for_tests(&mut self) {
        self.channel0.send_illegal_frame();
    }

    fn close_impl(&mut self, suppress_errors: bool) -> Result<()> {
        let join_handle = match self.join_handle.take() {
            Some(join_handle) => join_handle,
            // someone already closed us; only possible from Drop after an
            // explicit close, and drop doesn't care what we return.
            None => return Ok(()),
        };

        debug!("closing connection");
        let close_result = self.channel0.close_connection();
        if close_result.is_err() {
            // Graceful handshake failed (loop dead, or close-ok never
            // came). Make sure the loop exits so the join below can't hang.
            warn!("graceful close failed; aborting I/O loop");
            self.channel0.abort_connection();
        }

        let join_result = match join_handle.join() {
            Ok(result) => result,
            Err(_) => return IoThreadPanicSnafu.fail(),
        };

        if suppress_errors {
            return Ok(());
        }
        close_result?;
        join_result
    }
}
