use super::Inner;
use crate::auth::Sasl;
use crate::connection_options::ConnectionOptions;
use crate::errors::*;
use crate::serialize::TryFromAmqpFrame;
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::{Close, CloseOk, OpenOk, Secure, Start, Tune, TuneOk};
use amq_protocol::types::FieldTable;
use log::{debug, error};

/// Connection handshake state machine. Frames arrive before any channel
/// exists, so this runs directly against the I/O loop's inner state: protocol
/// header (already queued before the first poll), then start/start-ok,
/// tune/tune-ok, open/open-ok. A server close received mid-handshake (bad
/// vhost, bad tune parameters) parks us in ServerClosing until our close-ok
/// has been flushed.
pub(super) enum HandshakeState<Auth: Sasl> {
    Start(ConnectionOptions<Auth>),
    Secure(ConnectionOptions<Auth>, FieldTable),
    Tune(ConnectionOptions<Auth>, FieldTable),
    Open(TuneOk, FieldTable),
    ServerClosing(Close),
    Done(TuneOk, FieldTable),
}

impl<Auth: Sasl> HandshakeState<Auth> {
    pub(super) fn process(&mut self, inner: &mut Inner, frame: AMQPFrame) -> Result<()> {
        match self {
            HandshakeState::Start(options) => {
                let start = Start::try_from(0, frame)?;
                debug!("received handshake {:?}", start);

                // We speak 0-9-1 only; the server names its version in start,
                // and anything else means we hang up without another frame.
                if start.version_major != 0 || start.version_minor != 9 {
                    return ProtocolVersionMismatchSnafu {
                        major: start.version_major,
                        minor: start.version_minor,
                    }
                    .fail();
                }

                let (start_ok, server_properties) = options.make_start_ok(start)?;
                debug!("sending handshake {:?}", start_ok);
                inner.push_method(0, AmqpConnection::StartOk(start_ok))?;

                *self = HandshakeState::Secure(options.clone(), server_properties);
            }
            HandshakeState::Secure(options, server_properties) => {
                // We only support PLAIN and EXTERNAL, neither of which needs
                // a secure/secure-ok exchange.
                if let Ok(secure) = Secure::try_from(0, frame.clone()) {
                    error!("received unsupported handshake {:?}", secure);
                    return SaslSecureNotSupportedSnafu.fail();
                }
                *self = HandshakeState::Tune(
                    options.clone(),
                    std::mem::replace(server_properties, FieldTable::new()),
                );
                return self.process(inner, frame);
            }
            HandshakeState::Tune(options, server_properties) => {
                let tune = Tune::try_from(0, frame)?;
                debug!("received handshake {:?}", tune);

                let tune_ok = options.make_tune_ok(tune)?;
                inner.start_heartbeats(tune_ok.heartbeat);

                debug!("sending handshake {:?}", tune_ok);
                inner.push_method(0, AmqpConnection::TuneOk(tune_ok.clone()))?;

                let open = options.make_open();
                debug!("sending handshake {:?}", open);
                inner.push_method(0, AmqpConnection::Open(open))?;

                *self = HandshakeState::Open(
                    tune_ok,
                    std::mem::replace(server_properties, FieldTable::new()),
                );
            }
            HandshakeState::Open(tune_ok, server_properties) => {
                // If we sent bad tune params or a bad vhost, the server
                // responds with a Close instead of OpenOk.
                if let Ok(close) = Close::try_from(0, frame.clone()) {
                    inner.push_method(0, AmqpConnection::CloseOk(CloseOk {}))?;
                    inner.seal_writes();
                    *self = HandshakeState::ServerClosing(close);
                    return Ok(());
                }

                let open_ok = OpenOk::try_from(0, frame)?;
                debug!("received handshake {:?}", open_ok);

                *self = HandshakeState::Done(
                    tune_ok.clone(),
                    std::mem::replace(server_properties, FieldTable::new()),
                );
            }
            HandshakeState::ServerClosing(_) | HandshakeState::Done(_, _) => {
                return FrameUnexpectedSnafu.fail();
            }
        }
        Ok(())
    }
}
