use super::{ChannelMessage, IoLoopCommand, IoLoopMessage, IoLoopRpc};
use crate::dispatch::Dispatch;
use crate::errors::*;
use crate::serialize::{IntoAmqpClass, OutputBuffer, TryFromAmqpClass};
use crate::shutdown::ShutdownLatch;
use crate::ConsumerHandler;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::{AMQPProperties, Consume};
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::Close as ConnectionClose;
use amq_protocol::protocol::connection::CloseOk as ConnectionCloseOk;
use crossbeam_channel::{Receiver as CrossbeamReceiver, RecvTimeoutError, TryRecvError};
use log::{error, warn};
use mio_extras::channel::SyncSender as MioSyncSender;
use std::sync::Arc;
use std::time::Duration;

/// User-thread side of one channel: serializes methods into buffers, hands
/// them to the I/O thread, and blocks on the rendezvous for synchronous
/// calls. One exists per channel (channel 0's belongs to the connection
/// handle).
pub(crate) struct IoLoopHandle {
    channel_id: u16,
    buf: OutputBuffer,
    tx: MioSyncSender<IoLoopMessage>,
    rx: CrossbeamReceiver<Result<ChannelMessage>>,
    dispatch_rx: Option<CrossbeamReceiver<Dispatch>>,
    shutdown: Arc<ShutdownLatch>,
    rpc_timeout: Option<Duration>,
}

impl IoLoopHandle {
    pub(super) fn new(
        channel_id: u16,
        tx: MioSyncSender<IoLoopMessage>,
        rx: CrossbeamReceiver<Result<ChannelMessage>>,
        dispatch_rx: CrossbeamReceiver<Dispatch>,
        shutdown: Arc<ShutdownLatch>,
        rpc_timeout: Option<Duration>,
    ) -> IoLoopHandle {
        IoLoopHandle {
            channel_id,
            buf: OutputBuffer::empty(),
            tx,
            rx,
            dispatch_rx: Some(dispatch_rx),
            shutdown,
            rpc_timeout,
        }
    }

    #[inline]
    pub(super) fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Hand out the dispatch queue so the channel can spawn its consumer
    /// workers. Taken at most once.
    pub(super) fn take_dispatch_rx(&mut self) -> Option<CrossbeamReceiver<Dispatch>> {
        self.dispatch_rx.take()
    }

    fn make_buf<M: IntoAmqpClass>(&mut self, method: M) -> Result<OutputBuffer> {
        debug_assert!(self.buf.is_empty());
        self.buf.push_method(self.channel_id, method)?;
        Ok(self.buf.drain_into_new_buf())
    }

    pub(super) fn call<M: IntoAmqpClass, T: TryFromAmqpClass>(&mut self, method: M) -> Result<T> {
        self.drain_stale_replies()?;
        let buf = self.make_buf(method)?;
        self.send(IoLoopMessage::Rpc(IoLoopRpc::Call(buf)))?;
        match self.recv()? {
            ChannelMessage::Method(method) => T::try_from(method),
            ChannelMessage::ConsumeOk(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn call_connection_close(
        &mut self,
        close: ConnectionClose,
    ) -> Result<ConnectionCloseOk> {
        self.drain_stale_replies()?;
        let buf = self.make_buf(AmqpConnection::Close(close))?;
        self.send(IoLoopMessage::Rpc(IoLoopRpc::ConnectionClose(buf)))?;
        match self.recv()? {
            ChannelMessage::Method(method) => TryFromAmqpClass::try_from(method),
            ChannelMessage::ConsumeOk(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn consume(
        &mut self,
        consume: Consume,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String> {
        self.drain_stale_replies()?;
        let buf = self.make_buf(AmqpBasic::Consume(consume))?;
        self.send(IoLoopMessage::Rpc(IoLoopRpc::Consume(buf, handler)))?;
        match self.recv()? {
            ChannelMessage::ConsumeOk(consumer_tag) => Ok(consumer_tag),
            ChannelMessage::Method(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn send_nowait<M: IntoAmqpClass>(&mut self, method: M) -> Result<()> {
        let buf = self.make_buf(method)?;
        self.send(IoLoopMessage::Command(IoLoopCommand::SendNowait(buf)))
    }

    pub(super) fn send_content_header(
        &mut self,
        class_id: u16,
        len: usize,
        properties: &AMQPProperties,
    ) -> Result<()> {
        debug_assert!(self.buf.is_empty());
        self.buf
            .push_content_header(self.channel_id, class_id, len, properties)?;
        let buf = self.buf.drain_into_new_buf();
        self.send(IoLoopMessage::Command(IoLoopCommand::SendNowait(buf)))
    }

    pub(super) fn send_content_body(&mut self, content: &[u8]) -> Result<()> {
        debug_assert!(self.buf.is_empty());
        self.buf.push_content_body(self.channel_id, content)?;
        let buf = self.buf.drain_into_new_buf();
        self.send(IoLoopMessage::Command(IoLoopCommand::SendNowait(buf)))
    }

    pub(super) fn send_command(&mut self, command: IoLoopCommand) -> Result<()> {
        self.send(IoLoopMessage::Command(command))
    }

    /// Ask the I/O loop to exit without waiting for the close handshake.
    /// Failure to deliver means the loop is already gone, which is what the
    /// caller wanted anyway.
    pub(super) fn abort(&mut self) {
        let _ = self.tx.send(IoLoopMessage::Command(IoLoopCommand::Abort));
    }

    fn send(&mut self, message: IoLoopMessage) -> Result<()> {
        match self.tx.send(message) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.check_recv_for_error()),
        }
    }

    fn recv(&mut self) -> Result<ChannelMessage> {
        let reply = match self.rpc_timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout) => return RpcTimeoutSnafu.fail(),
                Err(RecvTimeoutError::Disconnected) => return Err(self.closed_error()),
            },
            None => match self.rx.recv() {
                Ok(reply) => reply,
                Err(_) => return Err(self.closed_error()),
            },
        };
        reply
    }

    // A send to the I/O thread failed; possible causes are:
    //   1. Server closed this channel; there should be a relevant message
    //      waiting for us on rx.
    //   2. The I/O loop is actually gone.
    // In either case the rendezvous tells us which. If it somehow holds a
    // successful reply after a send failure, something is badly out of sync.
    fn check_recv_for_error(&mut self) -> Error {
        match self.rx.try_recv() {
            Ok(Ok(_)) => {
                error!("internal error - received unexpected frame after I/O thread disappeared");
                Error::FrameUnexpected
            }
            Ok(Err(err)) => err,
            Err(_) => self.closed_error(),
        }
    }

    fn closed_error(&self) -> Error {
        match self.shutdown.reason() {
            Some(reason) => Error::AlreadyClosed { reason },
            None => Error::EventLoopDropped,
        }
    }

    // A previous call may have timed out and abandoned its reply in the
    // rendezvous; drop stale successes so this call can't consume an answer
    // meant for an earlier question. Stale errors are still fatal to the
    // channel and surface immediately.
    fn drain_stale_replies(&mut self) -> Result<()> {
        loop {
            match self.rx.try_recv() {
                Ok(Ok(_)) => {
                    warn!(
                        "discarding stale RPC reply on channel {} (previous call timed out?)",
                        self.channel_id
                    );
                }
                Ok(Err(err)) => return Err(err),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(self.closed_error()),
            }
        }
    }
}
