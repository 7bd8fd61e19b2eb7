use crate::connection::ConnectionTuning;
use crate::connection_options::ConnectionOptions;
use crate::dispatch::Dispatch;
use crate::errors::*;
use crate::frame_buffer::FrameBuffer;
use crate::serialize::{IntoAmqpClass, OutputBuffer, SealableOutputBuffer};
use crate::shutdown::{ShutdownLatch, ShutdownReason};
use crate::{ConsumerHandler, IoStream, Sasl};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::connection::TuneOk;
use amq_protocol::types::FieldTable;
use crossbeam_channel::Receiver as CrossbeamReceiver;
use crossbeam_channel::SendError;
use crossbeam_channel::Sender as CrossbeamSender;
use log::{debug, error, trace, warn};
use mio::{Event, Events, Poll, PollOpt, Ready, Token};
use mio_extras::channel::sync_channel as mio_sync_channel;
use mio_extras::channel::Receiver as MioReceiver;
use snafu::ResultExt;
use std::collections::hash_map::HashMap;
use std::io;
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

mod channel_handle;
mod channel_slots;
mod connection_state;
mod content_collector;
mod handshake_state;
mod heartbeat_timers;
mod io_loop_handle;

pub(crate) use channel_handle::{Channel0Handle, ChannelHandle};
use channel_slots::ChannelSlots;
use connection_state::ConnectionState;
use content_collector::{CollectorResult, ContentCollector};
use handshake_state::HandshakeState;
use heartbeat_timers::{HeartbeatKind, HeartbeatState, HeartbeatTimers};
use io_loop_handle::IoLoopHandle;

const STREAM: Token = Token(u16::max_value() as usize + 1);
const HEARTBEAT: Token = Token(u16::max_value() as usize + 2);

/// Synchronous calls: the caller blocks on its channel's rendezvous until the
/// matching response (or channel death) comes back.
pub(crate) enum IoLoopRpc {
    ConnectionClose(OutputBuffer),
    Call(OutputBuffer),
    Consume(OutputBuffer, Arc<dyn ConsumerHandler>),
}

/// Fire-and-forget messages into the I/O loop.
pub(crate) enum IoLoopCommand {
    AllocateChannel(Option<u16>, CrossbeamSender<Result<IoLoopHandle>>),
    SendNowait(OutputBuffer),
    Abort,
}

pub(crate) enum IoLoopMessage {
    Rpc(IoLoopRpc),
    Command(IoLoopCommand),
}

pub(crate) enum ChannelMessage {
    Method(amq_protocol::protocol::AMQPClass),
    ConsumeOk(String),
}

struct ChannelSlot {
    rx: MioReceiver<IoLoopMessage>,
    tx: CrossbeamSender<Result<ChannelMessage>>,
    collector: ContentCollector,
    consumers: HashMap<String, Arc<dyn ConsumerHandler>>,
    // Handler waiting for its consume-ok; at most one exists because
    // synchronous calls on a channel are serialized by the rendezvous.
    pending_consumer: Option<Arc<dyn ConsumerHandler>>,
    dispatch_tx: CrossbeamSender<Dispatch>,
}

impl ChannelSlot {
    fn new(
        mio_channel_bound: usize,
        channel_id: u16,
        shutdown: Arc<ShutdownLatch>,
        rpc_timeout: Option<Duration>,
    ) -> (ChannelSlot, IoLoopHandle) {
        let (mio_tx, mio_rx) = mio_sync_channel(mio_channel_bound);

        // Bound of 2 is intentional here. The normal case for this channel is
        // that it will have at most 1 message in it (the response to a
        // synchronous RPC call). However, we might asynchronously receive a
        // channel-close message from the server, and there should be room to
        // push that into this channel as well. If we try to send to this
        // channel and get blocked, we will exit the I/O loop quickly as
        // something has gone wrong internally; either a channel client has
        // tried to send 2 RPC synchronous calls without waiting for the
        // answer to the first, or the server has sent us multiple messages
        // unrelated to RPC requests. Either way, the connection is in a bad
        // state - bail out.
        let (tx, rx) = crossbeam_channel::bounded(2);

        // Unbounded so the I/O thread never blocks behind a slow consumer
        // callback; the dispatch workers drain this.
        let (dispatch_tx, dispatch_rx) = crossbeam_channel::unbounded();

        let channel_slot = ChannelSlot {
            rx: mio_rx,
            tx,
            collector: ContentCollector::new(),
            consumers: HashMap::new(),
            pending_consumer: None,
            dispatch_tx,
        };

        let loop_handle =
            IoLoopHandle::new(channel_id, mio_tx, rx, dispatch_rx, shutdown, rpc_timeout);

        (channel_slot, loop_handle)
    }
}

pub(crate) struct IoLoop {
    poll: Poll,
    connection_timeout: Option<Duration>,
    frame_buffer: FrameBuffer,
    inner: Inner,

    // Bound for buffered outgoing writes. If we have more than this much data
    // enqueued, we will stop polling non-0 channels' requests for us to send
    // more data.
    buffered_writes_high_water: usize,
    buffered_writes_low_water: usize,
}

impl IoLoop {
    pub(crate) fn new(tuning: &ConnectionTuning, shutdown: Arc<ShutdownLatch>) -> Result<Self> {
        let heartbeats = HeartbeatTimers::default();

        let poll = Poll::new().context(CreatePollHandleSnafu)?;
        poll.register(
            &heartbeats.timer,
            HEARTBEAT,
            Ready::readable(),
            PollOpt::edge(),
        )
        .context(RegisterWithPollHandleSnafu)?;

        Ok(IoLoop {
            poll,
            frame_buffer: FrameBuffer::new(),
            inner: Inner::new(heartbeats, tuning.mem_channel_bound, shutdown),
            buffered_writes_high_water: tuning.buffered_writes_high_water,
            buffered_writes_low_water: tuning.buffered_writes_low_water,
            connection_timeout: None,
        })
    }

    pub(crate) fn start<Auth: Sasl, S: IoStream>(
        mut self,
        stream: S,
        mut options: ConnectionOptions<Auth>,
    ) -> Result<(JoinHandle<Result<()>>, FieldTable, Channel0Handle)> {
        self.poll
            .register(&stream, STREAM, Ready::writable(), PollOpt::edge())
            .context(RegisterWithPollHandleSnafu)?;

        self.connection_timeout = options.connection_timeout.take();
        self.inner.rpc_timeout = options.rpc_timeout;

        let (handshake_done_tx, handshake_done_rx) = crossbeam_channel::bounded(1);
        let (ch0_slot, ch0_handle) = ChannelSlot::new(
            self.inner.mio_channel_bound,
            0,
            Arc::clone(&self.inner.shutdown),
            self.inner.rpc_timeout,
        );

        let join_handle = Builder::new()
            .name("durabbit-io".to_string())
            .spawn(move || self.thread_main(stream, options, handshake_done_tx, ch0_slot))
            .context(ForkFailedSnafu)?;

        IoLoop::wait_for_amqp_handshake(ch0_handle, join_handle, handshake_done_rx)
    }

    fn wait_for_amqp_handshake(
        ch0_handle: IoLoopHandle,
        join_handle: JoinHandle<Result<()>>,
        handshake_done_rx: CrossbeamReceiver<(usize, FieldTable)>,
    ) -> Result<(JoinHandle<Result<()>>, FieldTable, Channel0Handle)> {
        match handshake_done_rx.recv() {
            Ok((frame_max, server_properties)) => Ok((
                join_handle,
                server_properties,
                Channel0Handle::new(ch0_handle, frame_max),
            )),

            // If the sender was dropped without sending, the I/O thread has
            // failed; peel out its final error.
            Err(_) => match join_handle.join() {
                Ok(Ok(())) => {
                    unreachable!("I/O thread ended successfully without completing handshake")
                }
                Ok(Err(err)) => Err(err),
                Err(_) => IoThreadPanicSnafu.fail(),
            },
        }
    }

    fn thread_main<Auth: Sasl, S: IoStream>(
        mut self,
        stream: S,
        options: ConnectionOptions<Auth>,
        handshake_done_tx: crossbeam_channel::Sender<(usize, FieldTable)>,
        ch0_slot: ChannelSlot,
    ) -> Result<()> {
        let shutdown = Arc::clone(&self.inner.shutdown);
        let result = self.run(stream, options, handshake_done_tx, ch0_slot);
        match &result {
            Ok(()) => {
                shutdown.latch(ShutdownReason::application());
            }
            Err(err) => {
                shutdown.latch(shutdown_reason_for(err));
            }
        }
        result
    }

    fn run<Auth: Sasl, S: IoStream>(
        &mut self,
        mut stream: S,
        options: ConnectionOptions<Auth>,
        handshake_done_tx: crossbeam_channel::Sender<(usize, FieldTable)>,
        ch0_slot: ChannelSlot,
    ) -> Result<()> {
        self.poll
            .register(&ch0_slot.rx, Token(0), Ready::readable(), PollOpt::edge())
            .context(RegisterWithPollHandleSnafu)?;
        self.inner.chan_slots.insert_channel0(ch0_slot);

        let (tune_ok, server_properties) = self.run_amqp_handshake(&mut stream, options)?;
        // 0 negotiated means both sides offered "unlimited"
        let channel_max = match tune_ok.channel_max {
            0 => u16::max_value(),
            channel_max => channel_max,
        };
        let frame_max = match tune_ok.frame_max {
            0 => u32::max_value() as usize,
            frame_max => frame_max as usize,
        };
        match handshake_done_tx.send((frame_max, server_properties)) {
            Ok(_) => (),
            Err(_) => return Ok(()),
        }
        self.inner.chan_slots.set_channel_max(channel_max);
        self.run_connection(&mut stream)
    }

    fn run_amqp_handshake<Auth: Sasl, S: IoStream>(
        &mut self,
        stream: &mut S,
        options: ConnectionOptions<Auth>,
    ) -> Result<(TuneOk, FieldTable)> {
        let mut state = HandshakeState::Start(options);
        let result = self.run_io_loop(
            stream,
            &mut state,
            Self::handle_handshake_event,
            false,
            Self::is_handshake_done,
        );
        match result {
            Ok(()) => (),
            Err(err) => {
                // If our credentials are bad, the socket is dropped without a
                // message, but we can detect that if we had gotten up to the
                // Secure state before failing.
                return match state {
                    HandshakeState::Secure(_, _) => InvalidCredentialsSnafu.fail(),
                    _ => Err(err),
                };
            }
        }
        self.connection_timeout = None;
        match state {
            HandshakeState::Start(_)
            | HandshakeState::Secure(_, _)
            | HandshakeState::Tune(_, _)
            | HandshakeState::Open(_, _) => unreachable!(),
            HandshakeState::Done(tune_ok, server_properties) => Ok((tune_ok, server_properties)),
            HandshakeState::ServerClosing(close) => ServerClosedConnectionSnafu {
                code: close.reply_code,
                message: close.reply_text,
            }
            .fail(),
        }
    }

    fn handle_handshake_event<Auth: Sasl, S: IoStream>(
        &mut self,
        stream: &mut S,
        state: &mut HandshakeState<Auth>,
        event: Event,
    ) -> Result<()> {
        match event.token() {
            STREAM => {
                if event.readiness().is_writable() {
                    self.inner.write_to_stream(stream)?;
                }
                if event.readiness().is_readable() {
                    self.inner
                        .read_from_stream(stream, &mut self.frame_buffer, |inner, frame| {
                            state.process(inner, frame)
                        })?;
                }
            }
            HEARTBEAT => self.inner.process_heartbeat_timers()?,
            _ => unreachable!("no channel rx can be readable during the handshake"),
        }
        Ok(())
    }

    fn is_handshake_done<Auth: Sasl>(&self, state: &HandshakeState<Auth>) -> bool {
        match state {
            HandshakeState::Start(_)
            | HandshakeState::Secure(_, _)
            | HandshakeState::Tune(_, _)
            | HandshakeState::Open(_, _) => false,
            HandshakeState::Done(_, _) => true,
            HandshakeState::ServerClosing(_) => {
                // server initiated a close (e.g., bad vhost). don't report
                // that we're done until all our writes have gone out
                assert!(
                    self.inner.are_writes_sealed(),
                    "writes should be sealed after getting a server close request"
                );
                !self.inner.has_data_to_write()
            }
        }
    }

    fn run_connection<S: IoStream>(&mut self, stream: &mut S) -> Result<()> {
        let mut state = ConnectionState::Steady;
        self.run_io_loop(
            stream,
            &mut state,
            Self::handle_steady_event,
            true,
            Self::is_connection_done,
        )?;
        match state {
            ConnectionState::Steady => {
                assert!(
                    self.inner.abort_requested,
                    "steady loop can only end early on an abort request"
                );
                Ok(())
            }
            ConnectionState::ServerClosing(close) => ServerClosedConnectionSnafu {
                code: close.reply_code,
                message: close.reply_text,
            }
            .fail(),
            ConnectionState::ClientException => ClientExceptionSnafu.fail(),
            ConnectionState::ClientClosed => Ok(()),
        }
    }

    fn handle_steady_event<S: IoStream>(
        &mut self,
        stream: &mut S,
        state: &mut ConnectionState,
        event: Event,
    ) -> Result<()> {
        match event.token() {
            STREAM => {
                if event.readiness().is_writable() {
                    self.inner.write_to_stream(stream)?;
                }
                if event.readiness().is_readable() {
                    self.inner
                        .read_from_stream(stream, &mut self.frame_buffer, |inner, frame| {
                            state.process(inner, frame)
                        })?;
                }
            }
            HEARTBEAT => self.inner.process_heartbeat_timers()?,
            Token(n) if n <= u16::max_value() as usize => {
                self.inner.handle_channel_readable(n as u16, &self.poll)?
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn is_connection_done(&self, state: &ConnectionState) -> bool {
        if self.inner.abort_requested {
            return true;
        }
        match state {
            ConnectionState::Steady => false,
            ConnectionState::ClientClosed => true,
            ConnectionState::ServerClosing(_) | ConnectionState::ClientException => {
                // we're mid-close, but not actually done until all our writes
                // have gone out
                assert!(
                    self.inner.are_writes_sealed(),
                    "writes should be sealed after getting a server close request"
                );
                !self.inner.has_data_to_write()
            }
        }
    }

    fn run_io_loop<State, S, F, G>(
        &mut self,
        stream: &mut S,
        state: &mut State,
        mut handle_event: F,
        mut have_written_to_socket: bool,
        is_done: G,
    ) -> Result<()>
    where
        S: IoStream,
        F: FnMut(&mut Self, &mut S, &mut State, Event) -> Result<()>,
        G: Fn(&Self, &State) -> bool,
    {
        // We're called twice (AMQP handshake, then the main loop), so the
        // socket may be registered readable-only at entry even though we have
        // data queued; reregister for writable too if so.
        //
        // HOWEVER - on Windows it's important not to reregister for readable
        // until we've actually written to the socket, or we can get spurious
        // readable wakeups that turn into NotConnected errors on read.
        // have_written_to_socket tracks that: false until the first
        // successful drain of the write buffer.
        if self.inner.has_data_to_write() && have_written_to_socket {
            trace!("reregistering socket for readable or writable");
            self.poll
                .reregister(
                    stream,
                    STREAM,
                    Ready::readable() | Ready::writable(),
                    PollOpt::edge(),
                )
                .context(RegisterWithPollHandleSnafu)?;
        }

        let mut events = Events::with_capacity(128);
        let mut listening_to_channels = true;
        loop {
            let start_poll = Instant::now();
            self.poll
                .poll(&mut events, self.connection_timeout)
                .context(FailedToPollSnafu)?;
            if events.is_empty() {
                if let Some(timeout) = &self.connection_timeout {
                    if start_poll.elapsed() > *timeout {
                        return ConnectionTimeoutSnafu.fail();
                    }
                }
                continue;
            }

            let had_data_to_write = self.inner.has_data_to_write();

            for event in events.iter() {
                handle_event(self, stream, state, event)?;
            }

            if is_done(self, state) {
                return Ok(());
            }

            // Avoid out-of-memory from very fast publishers. If we have more
            // than buffered_writes_high_water data enqueued to write already,
            // unregister all channels (other than channel 0), and don't
            // reregister until we're down to buffered_writes_low_water.
            if listening_to_channels && self.inner.outbuf.len() > self.buffered_writes_high_water {
                debug!("passed high water mark for buffered writes; pausing channels internally");
                self.inner.deregister_nonzero_channels(&self.poll)?;
                listening_to_channels = false;
            } else if !listening_to_channels
                && self.inner.outbuf.len() <= self.buffered_writes_low_water
            {
                debug!("returned below low water mark for buffered writes; resuming channels");
                self.inner.reregister_nonzero_channels(&self.poll)?;
                listening_to_channels = true;
            }

            // If we have data to write, reregister for readable|writable.
            // This may be a spurious reregistration, but also may not - if we
            // wrote all the data we have but didn't get a WouldBlock, and
            // then later in the processing loop added more data to write but
            // didn't write it, mio won't wake us back up again next pass
            // unless we reregister.
            //
            // If we don't have data to write, only reregister for readable
            // (without writable) if we had data to write after the last poll;
            // otherwise we know we were already registered as readable only
            // and don't need to rereg.
            if self.inner.has_data_to_write() && have_written_to_socket {
                trace!("reregistering socket for readable or writable");
                self.poll
                    .reregister(
                        stream,
                        STREAM,
                        Ready::readable() | Ready::writable(),
                        PollOpt::edge(),
                    )
                    .context(RegisterWithPollHandleSnafu)?;
            } else if had_data_to_write {
                trace!("reregistering socket for readable only");
                have_written_to_socket = true;
                self.poll
                    .reregister(stream, STREAM, Ready::readable(), PollOpt::edge())
                    .context(RegisterWithPollHandleSnafu)?;
            }
        }
    }
}

pub(super) struct Inner {
    // Buffer of data waiting to be written. May contain multiple serialized
    // frames. Once we've appended a connection close or close-ok, it will be
    // sealed (any future writes will be silently discarded).
    outbuf: SealableOutputBuffer,

    // Handle to I/O loop timers for tracking rx/tx heartbeats.
    heartbeats: HeartbeatTimers,

    // Slots for open channels; channel 0 is installed before the handshake.
    chan_slots: ChannelSlots<ChannelSlot>,

    // Bound for in-memory channels that send to our I/O thread. (Channels
    // going _from_ the I/O thread are unbounded to prevent blocking the I/O
    // thread on slow receivers.)
    mio_channel_bound: usize,

    // If true, non-0 channels are registered with mio. (Channel 0 is always
    // registered.)
    channels_are_registered: bool,

    // Set when the user gives up on a graceful close; the loop exits at the
    // next pass and the socket drops with it.
    abort_requested: bool,

    // Where the final shutdown reason is published. Slots hold a clone so
    // user handles can report why their channel died.
    shutdown: Arc<ShutdownLatch>,

    rpc_timeout: Option<Duration>,
}

impl Inner {
    fn new(
        heartbeats: HeartbeatTimers,
        mio_channel_bound: usize,
        shutdown: Arc<ShutdownLatch>,
    ) -> Self {
        Inner {
            outbuf: SealableOutputBuffer::new(OutputBuffer::with_protocol_header()),
            heartbeats,
            chan_slots: ChannelSlots::new(),
            mio_channel_bound,
            channels_are_registered: true,
            abort_requested: false,
            shutdown,
            rpc_timeout: None,
        }
    }

    #[inline]
    fn are_writes_sealed(&self) -> bool {
        self.outbuf.is_sealed()
    }

    #[inline]
    fn seal_writes(&mut self) {
        trace!("sealing writes - no more data should be enqueued");
        self.outbuf.seal();
    }

    #[inline]
    pub(super) fn push_method<M: IntoAmqpClass>(&mut self, channel_id: u16, method: M) -> Result<()> {
        self.outbuf.push_method(channel_id, method)
    }

    #[inline]
    pub(super) fn start_heartbeats(&mut self, interval: u16) {
        if interval > 0 {
            debug!("starting heartbeat timers ({} sec)", interval);
            self.heartbeats
                .start(Duration::from_secs(u64::from(interval)));
        }
    }

    #[inline]
    fn has_data_to_write(&self) -> bool {
        !self.outbuf.is_empty()
    }

    fn deregister_nonzero_channels(&mut self, poll: &Poll) -> Result<()> {
        for (id, slot) in self.chan_slots.iter() {
            if *id == 0 {
                continue;
            }
            poll.deregister(&slot.rx)
                .context(DeregisterWithPollHandleSnafu)?;
        }
        self.channels_are_registered = false;
        Ok(())
    }

    fn reregister_nonzero_channels(&mut self, poll: &Poll) -> Result<()> {
        for (id, slot) in self.chan_slots.iter() {
            if *id == 0 {
                continue;
            }
            poll.reregister(
                &slot.rx,
                Token(*id as usize),
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;
        }
        self.channels_are_registered = true;
        Ok(())
    }

    fn process_heartbeat_timers(&mut self) -> Result<()> {
        while let Some(kind) = self.heartbeats.timer.poll() {
            match kind {
                HeartbeatKind::Rx => match self.heartbeats.fire_rx() {
                    HeartbeatState::StillRunning => {
                        trace!("rx heartbeat timer fired, but have received data since last");
                    }
                    HeartbeatState::Expired => {
                        error!("missed heartbeats from server - closing connection");
                        return MissedServerHeartbeatsSnafu.fail();
                    }
                },
                HeartbeatKind::Tx => match self.heartbeats.fire_tx() {
                    HeartbeatState::StillRunning => {
                        trace!("tx heartbeat timer fired, but have sent data since last");
                    }
                    HeartbeatState::Expired => {
                        // if we already have data queued up to send, don't
                        // bother also enqueuing a heartbeat frame
                        if self.outbuf.is_empty() {
                            debug!("sending heartbeat");
                            self.outbuf.push_heartbeat();
                        } else {
                            warn!("tx heartbeat fired, but already have queued data to write - possible socket problem");
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn handle_channel_readable(&mut self, channel_id: u16, poll: &Poll) -> Result<()> {
        loop {
            let slot = match self.chan_slots.get(channel_id) {
                Some(slot) => slot,
                None => {
                    // We've been asked to poll a receiver for a channel we
                    // dropped; this is rare, but can happen if the server
                    // initiated a close in this same poll processing loop and
                    // we already saw it. The dropped channel propagates an
                    // appropriate message back to the channel handle.
                    return Ok(());
                }
            };
            match slot.rx.try_recv() {
                Ok(message) => self.process_channel_message(channel_id, message, poll)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return EventLoopClientDroppedSnafu.fail(),
            }
        }
    }

    fn process_channel_message(
        &mut self,
        channel_id: u16,
        message: IoLoopMessage,
        poll: &Poll,
    ) -> Result<()> {
        match message {
            IoLoopMessage::Rpc(IoLoopRpc::ConnectionClose(buf)) => {
                self.outbuf.append(buf);
                self.seal_writes();
            }
            IoLoopMessage::Rpc(IoLoopRpc::Call(buf)) => {
                self.outbuf.append(buf);
            }
            IoLoopMessage::Rpc(IoLoopRpc::Consume(buf, handler)) => {
                // unwrap is safe here; we can only be called if we just
                // received a message from this slot.
                let slot = self.chan_slots.get_mut(channel_id).unwrap();
                slot.pending_consumer = Some(handler);
                self.outbuf.append(buf);
            }
            IoLoopMessage::Command(IoLoopCommand::SendNowait(buf)) => {
                self.outbuf.append(buf);
            }
            IoLoopMessage::Command(IoLoopCommand::AllocateChannel(new_channel_id, tx)) => {
                self.allocate_channel(new_channel_id, tx, poll)?;
            }
            IoLoopMessage::Command(IoLoopCommand::Abort) => {
                warn!("aborting connection at user request");
                self.abort_requested = true;
            }
        }
        Ok(())
    }

    fn allocate_channel(
        &mut self,
        new_channel_id: Option<u16>,
        tx: CrossbeamSender<Result<IoLoopHandle>>,
        poll: &Poll,
    ) -> Result<()> {
        let mio_channel_bound = self.mio_channel_bound;
        let channels_are_registered = self.channels_are_registered;
        let shutdown = Arc::clone(&self.shutdown);
        let rpc_timeout = self.rpc_timeout;
        let result = self.chan_slots.insert(new_channel_id, |new_channel_id| {
            let (slot, handle) =
                ChannelSlot::new(mio_channel_bound, new_channel_id, shutdown, rpc_timeout);
            poll.register(
                &slot.rx,
                Token(new_channel_id as usize),
                Ready::readable(),
                PollOpt::edge(),
            )
            .context(RegisterWithPollHandleSnafu)?;
            if !channels_are_registered {
                // We're in a paused state (too much data to write); the
                // register+deregister dance lets us call reregister on this
                // new channel later even though it didn't exist when we
                // deregistered all the existing channels.
                poll.deregister(&slot.rx)
                    .context(DeregisterWithPollHandleSnafu)?;
            }
            Ok((slot, handle))
        });
        match tx.send(result) {
            Ok(()) => (),
            Err(SendError(Ok(handle))) => {
                // send failed - clear the allocated channel
                self.chan_slots.remove(handle.channel_id());
            }
            Err(SendError(Err(_))) => {
                // send failed, but so did channel creation. do nothing
            }
        }
        Ok(())
    }

    fn route_collector_result(&mut self, channel_id: u16, result: CollectorResult) -> Result<()> {
        match result {
            CollectorResult::Delivery((consumer_tag, delivery)) => {
                // unwrap is safe; the collector we just finished with lives
                // in this slot.
                let slot = self.chan_slots.get_mut(channel_id).unwrap();
                match slot.consumers.get(&consumer_tag) {
                    Some(handler) => {
                        // dispatch workers only stop when this slot (and with
                        // it the sending side) drops, so a failed send means
                        // the delivery goes down with the channel.
                        let _ = slot
                            .dispatch_tx
                            .send(Dispatch::Delivery(Arc::clone(handler), delivery));
                        Ok(())
                    }
                    None => UnknownConsumerTagSnafu {
                        channel_id,
                        consumer_tag,
                    }
                    .fail(),
                }
            }
            CollectorResult::Return(returned) => {
                debug!(
                    "discarding returned message on channel {} (code={} text={} exchange={} routing_key={})",
                    channel_id,
                    returned.reply_code,
                    returned.reply_text,
                    returned.exchange,
                    returned.routing_key
                );
                Ok(())
            }
        }
    }

    fn read_from_stream<S, F>(
        &mut self,
        stream: &mut S,
        frame_buffer: &mut FrameBuffer,
        mut handler: F,
    ) -> Result<()>
    where
        S: IoStream,
        F: FnMut(&mut Inner, AMQPFrame) -> Result<()>,
    {
        let n = frame_buffer.read_from(stream, |frame| {
            trace!("read frame {:?}", frame);
            handler(self, frame)
        })?;
        if n > 0 {
            self.heartbeats.record_rx_activity();
        }
        Ok(())
    }

    fn write_to_stream<S: IoStream>(&mut self, stream: &mut S) -> Result<()> {
        let len = self.outbuf.len();
        let mut pos = 0;

        // Keep writing until we've written all len bytes or we hit WouldBlock.
        while pos < len {
            trace!("trying to write {} bytes", len - pos);
            let n = match stream.write(&self.outbuf[pos..]) {
                Ok(n) => {
                    trace!("wrote {} bytes", n);
                    self.heartbeats.record_tx_activity();
                    n
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        self.outbuf.drain_written(pos);
                        return Ok(());
                    }
                    _ => return Err(err).context(IoErrorWritingSocketSnafu),
                },
            };
            pos += n;
        }

        // Wrote everything we have - use clear instead of .drain_written().
        self.outbuf.clear();
        Ok(())
    }
}

fn shutdown_reason_for(err: &Error) -> ShutdownReason {
    match err {
        Error::ServerClosedConnection { code, message } => ShutdownReason::peer(
            *code,
            message.clone(),
            Error::ServerClosedConnection {
                code: *code,
                message: message.clone(),
            },
        ),
        Error::UnexpectedSocketClose => ShutdownReason::end_of_stream(Error::UnexpectedSocketClose),
        Error::MissedServerHeartbeats => {
            ShutdownReason::end_of_stream(Error::MissedServerHeartbeats)
        }
        other => ShutdownReason::library_text(other.to_string()),
    }
}
