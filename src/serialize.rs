use crate::errors::*;
use amq_protocol::frame::generation::{
    gen_content_body_frame, gen_content_header_frame, gen_heartbeat_frame, gen_method_frame,
};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::basic::AMQPProperties;
use amq_protocol::protocol::{basic, channel, connection, exchange, queue};
use amq_protocol::protocol::AMQPClass;
use cookie_factory::GenError;
use log::trace;
use std::ops::{Index, RangeFrom};
use std::result::Result as StdResult;

/// Conversion from a received method class into the concrete -ok method an
/// RPC caller is waiting for.
pub(crate) trait TryFromAmqpClass: Sized {
    fn try_from(class: AMQPClass) -> Result<Self>;
}

macro_rules! impl_try_from_amqp_class {
    ($variant:ident, $module:ident, $method:ident) => {
        impl TryFromAmqpClass for $module::$method {
            fn try_from(class: AMQPClass) -> Result<Self> {
                match class {
                    AMQPClass::$variant($module::AMQPMethod::$method(method)) => Ok(method),
                    response => BadRpcResponseSnafu { response }.fail(),
                }
            }
        }
    };
}

impl_try_from_amqp_class!(Connection, connection, CloseOk);
impl_try_from_amqp_class!(Channel, channel, OpenOk);
impl_try_from_amqp_class!(Channel, channel, CloseOk);
impl_try_from_amqp_class!(Exchange, exchange, DeclareOk);
impl_try_from_amqp_class!(Exchange, exchange, DeleteOk);
impl_try_from_amqp_class!(Exchange, exchange, BindOk);
impl_try_from_amqp_class!(Exchange, exchange, UnbindOk);
impl_try_from_amqp_class!(Queue, queue, DeclareOk);
impl_try_from_amqp_class!(Queue, queue, DeleteOk);
impl_try_from_amqp_class!(Queue, queue, BindOk);
impl_try_from_amqp_class!(Queue, queue, UnbindOk);
impl_try_from_amqp_class!(Queue, queue, PurgeOk);
impl_try_from_amqp_class!(Basic, basic, QosOk);
impl_try_from_amqp_class!(Basic, basic, CancelOk);

/// Conversion from a raw frame into a connection-class method expected on a
/// specific channel; used by the handshake state machine, which sees frames
/// before any channel slots exist.
pub(crate) trait TryFromAmqpFrame: Sized {
    fn try_from(channel_id: u16, frame: AMQPFrame) -> Result<Self>;
}

macro_rules! impl_try_from_amqp_frame {
    ($method:ident) => {
        impl TryFromAmqpFrame for connection::$method {
            fn try_from(channel_id: u16, frame: AMQPFrame) -> Result<Self> {
                match frame {
                    AMQPFrame::Method(
                        id,
                        AMQPClass::Connection(connection::AMQPMethod::$method(method)),
                    ) if id == channel_id => Ok(method),
                    _ => FrameUnexpectedSnafu.fail(),
                }
            }
        }
    };
}

impl_try_from_amqp_frame!(Start);
impl_try_from_amqp_frame!(Secure);
impl_try_from_amqp_frame!(Tune);
impl_try_from_amqp_frame!(OpenOk);
impl_try_from_amqp_frame!(Close);

/// Conversion from a concrete method struct into the class enum the codec
/// serializes.
pub(crate) trait IntoAmqpClass {
    fn into_class(self) -> AMQPClass;
}

macro_rules! impl_into_amqp_class {
    ($variant:ident, $module:ident) => {
        impl IntoAmqpClass for $module::AMQPMethod {
            fn into_class(self) -> AMQPClass {
                AMQPClass::$variant(self)
            }
        }
    };
}

impl_into_amqp_class!(Connection, connection);
impl_into_amqp_class!(Channel, channel);
impl_into_amqp_class!(Exchange, exchange);
impl_into_amqp_class!(Queue, queue);
impl_into_amqp_class!(Basic, basic);

/// Buffer of serialized frames waiting to be written to the socket.
#[derive(Clone)]
pub(crate) struct OutputBuffer(Vec<u8>);

impl OutputBuffer {
    pub(crate) fn with_protocol_header() -> OutputBuffer {
        OutputBuffer(Vec::from("AMQP\x00\x00\x09\x01".as_bytes()))
    }

    pub(crate) fn empty() -> OutputBuffer {
        OutputBuffer(Vec::new())
    }

    pub(crate) fn push_method<M>(&mut self, channel_id: u16, method: M) -> Result<()>
    where
        M: IntoAmqpClass,
    {
        let class = method.into_class();
        serialize(&mut self.0, |buf, pos| {
            gen_method_frame((buf, pos), channel_id, &class)
        })
    }

    pub(crate) fn push_content_header(
        &mut self,
        channel_id: u16,
        class_id: u16,
        length: usize,
        properties: &AMQPProperties,
    ) -> Result<()> {
        let length = length as u64;
        serialize(&mut self.0, |buf, pos| {
            gen_content_header_frame((buf, pos), channel_id, class_id, length, properties)
        })
    }

    pub(crate) fn push_content_body(&mut self, channel_id: u16, content: &[u8]) -> Result<()> {
        serialize(&mut self.0, |buf, pos| {
            gen_content_body_frame((buf, pos), channel_id, content)
        })
    }

    pub(crate) fn push_heartbeat(&mut self) {
        // serializing a heartbeat frame cannot fail; safe to unwrap.
        serialize(&mut self.0, |buf, pos| gen_heartbeat_frame((buf, pos))).unwrap()
    }

    /// Move this buffer's contents out into a fresh buffer, leaving this one
    /// empty (but with its capacity intact for reuse).
    pub(crate) fn drain_into_new_buf(&mut self) -> OutputBuffer {
        let mut new_buf = OutputBuffer(Vec::with_capacity(self.0.len()));
        new_buf.0.append(&mut self.0);
        new_buf
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.0.clear()
    }

    #[inline]
    pub(crate) fn drain_written(&mut self, n: usize) {
        self.0.drain(0..n);
    }

    #[inline]
    pub(crate) fn append(&mut self, mut other: OutputBuffer) {
        self.0.append(&mut other.0)
    }
}

impl Index<RangeFrom<usize>> for OutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.0[index]
    }
}

/// An output buffer that can be sealed. Once a connection close or close-ok
/// has been enqueued no further frames may follow it on the wire; writes
/// pushed after sealing are silently discarded.
pub(crate) struct SealableOutputBuffer {
    buf: OutputBuffer,
    sealed: bool,
}

impl SealableOutputBuffer {
    pub(crate) fn new(buf: OutputBuffer) -> SealableOutputBuffer {
        SealableOutputBuffer { buf, sealed: false }
    }

    #[inline]
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    #[inline]
    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn push_method<M: IntoAmqpClass>(
        &mut self,
        channel_id: u16,
        method: M,
    ) -> Result<()> {
        if self.sealed {
            trace!("discarding method pushed after seal");
            return Ok(());
        }
        self.buf.push_method(channel_id, method)
    }

    pub(crate) fn push_heartbeat(&mut self) {
        if !self.sealed {
            self.buf.push_heartbeat();
        }
    }

    pub(crate) fn append(&mut self, other: OutputBuffer) {
        if self.sealed {
            trace!("discarding buffer appended after seal");
            return;
        }
        self.buf.append(other);
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.buf.clear()
    }

    #[inline]
    pub(crate) fn drain_written(&mut self, n: usize) {
        self.buf.drain_written(n)
    }
}

impl Index<RangeFrom<usize>> for SealableOutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.buf[index]
    }
}

fn serialize<F: Fn(&mut [u8], usize) -> StdResult<(&mut [u8], usize), GenError>>(
    buf: &mut Vec<u8>,
    f: F,
) -> Result<()> {
    let pos = buf.len();
    loop {
        let resize_to = match f(buf, pos) {
            Ok(_) => return Ok(()),
            Err(GenError::BufferTooSmall(n)) => n,
            Err(_) => return InternalSerializationSnafu.fail(),
        };
        buf.resize(resize_to, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amq_protocol::protocol::connection::CloseOk;

    #[test]
    fn sealed_buffer_discards_writes() {
        let mut buf = SealableOutputBuffer::new(OutputBuffer::empty());
        buf.push_method(0, connection::AMQPMethod::CloseOk(CloseOk {}))
            .unwrap();
        let len_before_seal = buf.len();
        assert!(len_before_seal > 0);

        buf.seal();
        buf.push_method(0, connection::AMQPMethod::CloseOk(CloseOk {}))
            .unwrap();
        buf.push_heartbeat();
        assert_eq!(buf.len(), len_before_seal);
    }

    #[test]
    fn drain_into_new_buf_empties_source() {
        let mut buf = OutputBuffer::empty();
        buf.push_heartbeat();
        let drained = buf.drain_into_new_buf();
        assert!(buf.is_empty());
        assert_eq!(drained.len(), 8); // 7-byte header + frame-end
    }

    #[test]
    fn try_from_rejects_wrong_method() {
        let class = AMQPClass::Connection(connection::AMQPMethod::CloseOk(CloseOk {}));
        let res: Result<channel::OpenOk> = TryFromAmqpClass::try_from(class);
        match res.unwrap_err() {
            Error::BadRpcResponse { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }
}
