use super::io_loop_handle::IoLoopHandle;
use super::IoLoopCommand;
use crate::dispatch::Dispatch;
use crate::errors::*;
use crate::serialize::{IntoAmqpClass, TryFromAmqpClass};
use crate::ConsumerHandler;
use amq_protocol::protocol::basic::{AMQPProperties, Consume};
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::Close as ChannelClose;
use amq_protocol::protocol::channel::CloseOk as ChannelCloseOk;
use amq_protocol::protocol::channel::Open as ChannelOpen;
use amq_protocol::protocol::channel::OpenOk as ChannelOpenOk;
use amq_protocol::protocol::connection::Close as ConnectionClose;
use amq_protocol::protocol::constants::REPLY_SUCCESS;
use crossbeam_channel::Receiver as CrossbeamReceiver;
use log::{debug, trace};
use std::sync::Arc;

// Frame overhead per content body frame: 7 byte header + 1 byte frame-end.
const FRAME_OVERHEAD: usize = 8;

/// The connection handle's grip on channel 0: the connection close handshake
/// and channel allocation both go through here.
pub(crate) struct Channel0Handle {
    handle: IoLoopHandle,
    frame_max: usize,
}

impl Channel0Handle {
    pub(super) fn new(handle: IoLoopHandle, frame_max: usize) -> Channel0Handle {
        assert!(
            handle.channel_id() == 0,
            "handle for Channel0 must be channel 0"
        );
        assert!(
            frame_max > FRAME_OVERHEAD,
            "negotiated frame_max cannot fit any content"
        );
        Channel0Handle { handle, frame_max }
    }

    pub(crate) fn close_connection(&mut self) -> Result<()> {
        let close = ConnectionClose {
            reply_code: REPLY_SUCCESS as u16,
            reply_text: "goodbye".to_string(),
            class_id: 0,
            method_id: 0,
        };

        let close_ok = self.handle.call_connection_close(close)?;
        trace!("got close-ok: {:?}", close_ok);
        Ok(())
    }

    pub(crate) fn abort_connection(&mut self) {
        self.handle.abort();
    }

    /// Send a frame the server must treat as a hard protocol error
    /// (basic.publish on channel 0), provoking a server-initiated
    /// connection.close. Lets tests exercise failure paths without control
    /// over the broker process.
    #[cfg(test)]
    pub(crate) fn send_illegal_frame(&mut self) {
        use amq_protocol::protocol::basic::{AMQPMethod as AmqpBasic, Publish};
        let _ = self.handle.send_nowait(AmqpBasic::Publish(Publish {
            ticket: 0,
            exchange: "".to_string(),
            routing_key: "".to_string(),
            mandatory: false,
            immediate: false,
        }));
    }

    pub(crate) fn open_channel(&mut self, channel_id: Option<u16>) -> Result<ChannelHandle> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.handle
            .send_command(IoLoopCommand::AllocateChannel(channel_id, tx))?;

        // double ?? - peel off recv error, then channel allocation error
        let mut handle = rx
            .recv()
            .map_err(|_| Error::EventLoopDropped)
            .and_then(|result| result)?;

        debug!("opening channel {}", handle.channel_id());
        let out_of_band = String::new();
        let open = AmqpChannel::Open(ChannelOpen { out_of_band });

        let open_ok = handle.call::<_, ChannelOpenOk>(open)?;
        trace!("got open-ok: {:?}", open_ok);
        Ok(ChannelHandle {
            handle,
            frame_max: self.frame_max,
        })
    }
}

/// A user channel's grip on the I/O loop: synchronous calls, asynchronous
/// sends, and content publication split by the negotiated frame max.
pub(crate) struct ChannelHandle {
    handle: IoLoopHandle,
    frame_max: usize,
}

impl ChannelHandle {
    #[inline]
    pub(crate) fn channel_id(&self) -> u16 {
        self.handle.channel_id()
    }

    pub(crate) fn take_dispatch_rx(&mut self) -> Option<CrossbeamReceiver<Dispatch>> {
        self.handle.take_dispatch_rx()
    }

    pub(crate) fn call<M: IntoAmqpClass, T: TryFromAmqpClass>(&mut self, method: M) -> Result<T> {
        self.handle.call(method)
    }

    pub(crate) fn send_nowait<M: IntoAmqpClass>(&mut self, method: M) -> Result<()> {
        self.handle.send_nowait(method)
    }

    pub(crate) fn consume(
        &mut self,
        consume: Consume,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<String> {
        self.handle.consume(consume, handler)
    }

    /// Publish a content header followed by as many body frames as the
    /// negotiated frame max requires.
    pub(crate) fn send_content(
        &mut self,
        content: &[u8],
        class_id: u16,
        properties: &AMQPProperties,
    ) -> Result<()> {
        self.handle
            .send_content_header(class_id, content.len(), properties)?;
        let max_body_per_frame = self.frame_max - FRAME_OVERHEAD;
        for chunk in content.chunks(max_body_per_frame) {
            self.handle.send_content_body(chunk)?;
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        let close = AmqpChannel::Close(ChannelClose {
            reply_code: REPLY_SUCCESS as u16,
            reply_text: String::new(),
            class_id: 0,
            method_id: 0,
        });
        debug!("closing channel {}", self.handle.channel_id());
        let close_ok = self.handle.call::<_, ChannelCloseOk>(close)?;
        trace!("got close-ok: {:?}", close_ok);
        Ok(())
    }
}
