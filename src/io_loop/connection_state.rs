use super::{ChannelMessage, ChannelSlot, Inner};
use crate::dispatch::Dispatch;
use crate::errors::*;
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::CancelOk as BasicCancelOk;
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::CloseOk as ChannelCloseOk;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::Close as ConnectionClose;
use amq_protocol::protocol::connection::CloseOk as ConnectionCloseOk;
use amq_protocol::protocol::{AMQPClass, AMQPHardError};
use crossbeam_channel::Sender;
use log::{debug, error, trace, warn};
use std::collections::hash_map::Entry;

/// Steady-state connection lifecycle, entered once the handshake completes.
#[derive(Debug)]
pub(super) enum ConnectionState {
    Steady,
    ServerClosing(ConnectionClose),
    ClientException,
    ClientClosed,
}

fn slot_remove(inner: &mut Inner, channel_id: u16) -> Result<ChannelSlot> {
    inner
        .chan_slots
        .remove(channel_id)
        .ok_or(Error::ReceivedFrameWithBogusChannelId { channel_id })
}

fn slot_get(inner: &Inner, channel_id: u16) -> Result<&ChannelSlot> {
    inner
        .chan_slots
        .get(channel_id)
        .ok_or(Error::ReceivedFrameWithBogusChannelId { channel_id })
}

fn slot_get_mut(inner: &mut Inner, channel_id: u16) -> Result<&mut ChannelSlot> {
    inner
        .chan_slots
        .get_mut(channel_id)
        .ok_or(Error::ReceivedFrameWithBogusChannelId { channel_id })
}

// RPC replies must land in the rendezvous; a full or disconnected rendezvous
// means the channel's client side is in a state we can't reconcile, which is
// fatal to the connection.
fn send_rpc_reply(
    tx: &Sender<Result<ChannelMessage>>,
    reply: Result<ChannelMessage>,
) -> Result<()> {
    tx.try_send(reply)
        .map_err(|_| Error::EventLoopClientDropped)
}

// Tell every consumer on a dying channel that it is gone. The handlers hear
// about it on the dispatch workers, never on this thread.
fn cancel_consumers(slot: &mut ChannelSlot) {
    for (consumer_tag, handler) in slot.consumers.drain() {
        let _ = slot
            .dispatch_tx
            .send(Dispatch::Cancelled(handler, consumer_tag));
    }
}

fn nonzero_channel_of(frame: &AMQPFrame) -> Option<u16> {
    let channel_id = match frame {
        AMQPFrame::ProtocolHeader => 0,
        AMQPFrame::Method(id, _) => *id,
        AMQPFrame::Header(id, _, _) => *id,
        AMQPFrame::Body(id, _) => *id,
        AMQPFrame::Heartbeat(id) => *id,
    };
    if channel_id == 0 {
        None
    } else {
        Some(channel_id)
    }
}

impl ConnectionState {
    pub(super) fn process(&mut self, inner: &mut Inner, frame: AMQPFrame) -> Result<()> {
        // bail out if we shouldn't be getting frames
        match self {
            ConnectionState::Steady => (),
            ConnectionState::ServerClosing(_)
            | ConnectionState::ClientClosed
            | ConnectionState::ClientException => return FrameUnexpectedSnafu.fail(),
        }

        // Once our connection close (or close-ok) is on the wire we are
        // quiescing: channel 0 still speaks, everything else is discarded.
        if inner.are_writes_sealed() {
            if let Some(channel_id) = nonzero_channel_of(&frame) {
                trace!(
                    "discarding frame for channel {} while connection is closing",
                    channel_id
                );
                return Ok(());
            }
        }

        match frame {
            // Heartbeats carry no payload; receiving one already counted as
            // rx activity when it came off the socket.
            AMQPFrame::Heartbeat(_) => {
                trace!("received heartbeat");
            }
            AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Close(close))) => {
                inner.push_method(0, AmqpConnection::CloseOk(ConnectionCloseOk {}))?;
                inner.seal_writes();
                *self = ConnectionState::ServerClosing(close);
            }
            AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::CloseOk(close_ok))) => {
                // channel 0's slot always exists once we reach steady state
                let slot = slot_get(inner, 0)?;
                send_rpc_reply(
                    &slot.tx,
                    Ok(ChannelMessage::Method(AMQPClass::Connection(
                        AmqpConnection::CloseOk(close_ok),
                    ))),
                )?;
                *self = ConnectionState::ClientClosed;
            }
            AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Blocked(blocked))) => {
                warn!("server blocked connection: {}", blocked.reason);
            }
            AMQPFrame::Method(0, AMQPClass::Connection(AmqpConnection::Unblocked(_))) => {
                debug!("server unblocked connection");
            }
            AMQPFrame::Method(0, other) => {
                let text = format!("do not know how to handle channel 0 method {:?}", other);
                error!("{} - closing connection", text);
                let close = ConnectionClose {
                    reply_code: AMQPHardError::NOTIMPLEMENTED.get_id(),
                    reply_text: text,
                    class_id: 0,
                    method_id: 0,
                };
                inner.push_method(0, AmqpConnection::Close(close))?;
                inner.seal_writes();
                *self = ConnectionState::ClientException;
            }
            frame @ AMQPFrame::Header(0, _, _) | frame @ AMQPFrame::Body(0, _) => {
                let text = format!("received illegal channel 0 frame {:?}", frame);
                error!("{} - closing connection", text);
                let close = ConnectionClose {
                    reply_code: AMQPHardError::NOTALLOWED.get_id(),
                    reply_text: text,
                    class_id: 0,
                    method_id: 0,
                };
                inner.push_method(0, AmqpConnection::Close(close))?;
                inner.seal_writes();
                *self = ConnectionState::ClientException;
            }
            AMQPFrame::Method(n, AMQPClass::Channel(AmqpChannel::Close(close))) => {
                let mut slot = slot_remove(inner, n)?;
                warn!("server closing channel {}: {:?}", n, close);
                inner.push_method(n, AmqpChannel::CloseOk(ChannelCloseOk {}))?;
                cancel_consumers(&mut slot);
                let err = Error::ServerClosedChannel {
                    channel_id: n,
                    code: close.reply_code,
                    message: close.reply_text,
                };
                // the handle may be blocked in an RPC (gets the error now) or
                // idle (gets it on its next call); it may also already be
                // gone, which is fine - the channel is dead either way.
                let _ = slot.tx.try_send(Err(err));
            }
            AMQPFrame::Method(n, AMQPClass::Channel(AmqpChannel::CloseOk(close_ok))) => {
                let mut slot = slot_remove(inner, n)?;
                cancel_consumers(&mut slot);
                send_rpc_reply(
                    &slot.tx,
                    Ok(ChannelMessage::Method(AMQPClass::Channel(
                        AmqpChannel::CloseOk(close_ok),
                    ))),
                )?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::ConsumeOk(consume_ok))) => {
                let consumer_tag = consume_ok.consumer_tag;
                let slot = slot_get_mut(inner, n)?;
                let handler = match slot.pending_consumer.take() {
                    Some(handler) => handler,
                    None => {
                        error!("received consume-ok without a consume in flight");
                        return FrameUnexpectedSnafu.fail();
                    }
                };
                match slot.consumers.entry(consumer_tag.clone()) {
                    Entry::Occupied(_) => {
                        return DuplicateConsumerTagSnafu {
                            channel_id: n,
                            consumer_tag,
                        }
                        .fail();
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(handler);
                        send_rpc_reply(&slot.tx, Ok(ChannelMessage::ConsumeOk(consumer_tag)))?;
                    }
                }
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::CancelOk(cancel_ok))) => {
                let slot = slot_get_mut(inner, n)?;
                if let Some(handler) = slot.consumers.remove(&cancel_ok.consumer_tag) {
                    let _ = slot.dispatch_tx.send(Dispatch::Cancelled(
                        handler,
                        cancel_ok.consumer_tag.clone(),
                    ));
                }
                send_rpc_reply(
                    &slot.tx,
                    Ok(ChannelMessage::Method(AMQPClass::Basic(
                        AmqpBasic::CancelOk(cancel_ok),
                    ))),
                )?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::Cancel(cancel))) => {
                // server-initiated cancel, e.g. the consumer's queue was
                // deleted out from under it.
                let slot = slot_get_mut(inner, n)?;
                let consumer_tag = cancel.consumer_tag;
                let handler = slot.consumers.remove(&consumer_tag);
                let dispatch_tx = slot.dispatch_tx.clone();
                match handler {
                    Some(handler) => {
                        debug!("server cancelled consumer {} on channel {}", consumer_tag, n);
                        let _ = dispatch_tx.send(Dispatch::Cancelled(handler, consumer_tag.clone()));
                    }
                    None => warn!(
                        "server cancelled unknown consumer {} on channel {}",
                        consumer_tag, n
                    ),
                }
                if !cancel.nowait {
                    inner.push_method(n, AmqpBasic::CancelOk(BasicCancelOk { consumer_tag }))?;
                }
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::Deliver(deliver))) => {
                let slot = slot_get_mut(inner, n)?;
                slot.collector.collect_deliver(deliver)?;
            }
            AMQPFrame::Method(n, AMQPClass::Basic(AmqpBasic::Return(return_))) => {
                let slot = slot_get_mut(inner, n)?;
                slot.collector.collect_return(return_)?;
            }
            AMQPFrame::Method(n, method) => {
                let slot = slot_get(inner, n)?;
                trace!(
                    "trying to send method to client for channel {}: {:?}",
                    n,
                    method
                );
                send_rpc_reply(&slot.tx, Ok(ChannelMessage::Method(method)))?;
            }
            AMQPFrame::Header(n, _, header) => {
                let slot = slot_get_mut(inner, n)?;
                if let Some(done) = slot.collector.collect_header(*header)? {
                    inner.route_collector_result(n, done)?;
                }
            }
            AMQPFrame::Body(n, body) => {
                let slot = slot_get_mut(inner, n)?;
                if let Some(done) = slot.collector.collect_body(body)? {
                    inner.route_collector_result(n, done)?;
                }
            }
            AMQPFrame::ProtocolHeader => {
                error!("received protocol header mid-connection");
                return FrameUnexpectedSnafu.fail();
            }
        }
        Ok(())
    }
}
