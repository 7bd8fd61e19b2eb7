use crate::errors::*;
use crate::{AmqpProperties, Delivery};
use amq_protocol::frame::AMQPContentHeader;
use amq_protocol::protocol::basic::Deliver;
use amq_protocol::protocol::basic::Return as AmqpReturn;

/// Assembler for a channel's inbound content: a deliver or return method,
/// followed by a content header, followed by body fragments until the
/// header's body_size bytes have arrived. At most one piece of content is in
/// flight per channel at a time.
pub(super) struct ContentCollector {
    kind: Option<Kind>,
}

#[derive(Debug)]
pub(super) enum CollectorResult {
    Delivery((String, Delivery)),
    Return(ReturnedMessage),
}

/// A mandatory publish the server could not route, echoed back to us.
/// Assembled so the stream stays in sync, then logged and discarded.
#[derive(Debug)]
pub(super) struct ReturnedMessage {
    pub(super) reply_code: u16,
    pub(super) reply_text: String,
    pub(super) exchange: String,
    pub(super) routing_key: String,
}

impl ContentCollector {
    pub(super) fn new() -> ContentCollector {
        ContentCollector { kind: None }
    }

    pub(super) fn collect_deliver(&mut self, deliver: Deliver) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Delivery(State::Start(deliver)));
                Ok(())
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_return(&mut self, return_: AmqpReturn) -> Result<()> {
        match self.kind.take() {
            None => {
                self.kind = Some(Kind::Return(State::Start(return_)));
                Ok(())
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_header(
        &mut self,
        header: AMQPContentHeader,
    ) -> Result<Option<CollectorResult>> {
        match self.kind.take() {
            Some(Kind::Delivery(state)) => match state.collect_header(header)? {
                Content::Done(done) => Ok(Some(CollectorResult::Delivery(done))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Delivery(state));
                    Ok(None)
                }
            },
            Some(Kind::Return(state)) => match state.collect_header(header)? {
                Content::Done(done) => Ok(Some(CollectorResult::Return(done))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Return(state));
                    Ok(None)
                }
            },
            None => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(super) fn collect_body(&mut self, body: Vec<u8>) -> Result<Option<CollectorResult>> {
        match self.kind.take() {
            Some(Kind::Delivery(state)) => match state.collect_body(body)? {
                Content::Done(done) => Ok(Some(CollectorResult::Delivery(done))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Delivery(state));
                    Ok(None)
                }
            },
            Some(Kind::Return(state)) => match state.collect_body(body)? {
                Content::Done(done) => Ok(Some(CollectorResult::Return(done))),
                Content::NeedMore(state) => {
                    self.kind = Some(Kind::Return(state));
                    Ok(None)
                }
            },
            None => FrameUnexpectedSnafu.fail(),
        }
    }
}

enum Kind {
    Delivery(State<Delivery>),
    Return(State<ReturnedMessage>),
}

trait ContentType {
    type Start;
    type Finish;

    fn new(start: Self::Start, buf: Vec<u8>, properties: AmqpProperties) -> Self::Finish;
}

impl ContentType for Delivery {
    type Start = Deliver;
    type Finish = (String, Delivery);

    fn new(start: Self::Start, buf: Vec<u8>, properties: AmqpProperties) -> Self::Finish {
        Delivery::new(start, buf, properties)
    }
}

impl ContentType for ReturnedMessage {
    type Start = AmqpReturn;
    type Finish = ReturnedMessage;

    fn new(start: Self::Start, _buf: Vec<u8>, _properties: AmqpProperties) -> Self::Finish {
        ReturnedMessage {
            reply_code: start.reply_code,
            reply_text: start.reply_text,
            exchange: start.exchange,
            routing_key: start.routing_key,
        }
    }
}

enum Content<T: ContentType> {
    Done(T::Finish),
    NeedMore(State<T>),
}

// Clippy warns about State::Body being much larger than the other variant,
// but we expect almost all instances of State to transition to Body.
#[allow(clippy::large_enum_variant)]
enum State<T: ContentType> {
    Start(T::Start),
    Body(T::Start, AMQPContentHeader, Vec<u8>),
}

impl<T: ContentType> State<T> {
    fn collect_header(self, header: AMQPContentHeader) -> Result<Content<T>> {
        match self {
            State::Start(start) => {
                if header.body_size == 0 {
                    Ok(Content::Done(T::new(start, Vec::new(), header.properties)))
                } else {
                    let buf = Vec::with_capacity(header.body_size as usize);
                    Ok(Content::NeedMore(State::Body(start, header, buf)))
                }
            }
            State::Body(_, _, _) => FrameUnexpectedSnafu.fail(),
        }
    }

    fn collect_body(self, mut body: Vec<u8>) -> Result<Content<T>> {
        match self {
            State::Body(start, header, mut buf) => {
                let body_size = header.body_size as usize;
                buf.append(&mut body);
                if buf.len() == body_size {
                    Ok(Content::Done(T::new(start, buf, header.properties)))
                } else if buf.len() < body_size {
                    Ok(Content::NeedMore(State::Body(start, header, buf)))
                } else {
                    FrameUnexpectedSnafu.fail()
                }
            }
            State::Start(_) => FrameUnexpectedSnafu.fail(),
        }
    }
}
