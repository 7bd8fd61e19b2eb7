use crate::shutdown::ShutdownReason;
use amq_protocol::protocol::AMQPClass;
use snafu::Snafu;
use std::io;
use std::result;
use url::Url;

/// A type alias for handling errors throughout durabbit.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Specific error cases returned by durabbit.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// URL parsing failed.
    #[snafu(display("could not parse url: {}", source))]
    UrlParse { source: url::ParseError },

    /// URL could not be decoded into an AMQP endpoint.
    #[snafu(display("invalid amqp url: {}", url))]
    InvalidUrl { url: Url },

    /// No endpoints were supplied to connect to.
    #[snafu(display("empty endpoint list"))]
    NoEndpoints,

    /// The TCP connection to an endpoint failed.
    #[snafu(display("could not connect to {}:{}: {}", host, port, source))]
    FailedToConnect {
        host: String,
        port: u16,
        source: io::Error,
    },

    /// The underlying socket was closed.
    #[snafu(display("underlying socket closed unexpectedly"))]
    UnexpectedSocketClose,

    /// We received data that could not be parsed as an AMQP frame.
    #[snafu(display("received malformed data - expected AMQP frame"))]
    ReceivedMalformed,

    /// An I/O error occurred reading the socket.
    #[snafu(display("I/O error reading socket: {}", source))]
    IoErrorReadingSocket { source: io::Error },

    /// An I/O error occurred writing the socket.
    #[snafu(display("I/O error writing socket: {}", source))]
    IoErrorWritingSocket { source: io::Error },

    /// The server speaks a different protocol version than we do.
    #[snafu(display(
        "server requested protocol version {}-{} (we support 0-9)",
        major,
        minor
    ))]
    ProtocolVersionMismatch { major: u8, minor: u8 },

    /// The server offers no authentication mechanism we support.
    #[snafu(display(
        "no compatible authentication mechanism found (server offers: {})",
        available
    ))]
    UnsupportedAuthMechanism { available: String },

    /// The server does not support the requested locale.
    #[snafu(display(
        "requested locale {} unavailable (server offers: {})",
        requested,
        available
    ))]
    UnsupportedLocale {
        available: String,
        requested: String,
    },

    /// The negotiated frame size is smaller than the minimum required by AMQP.
    #[snafu(display(
        "negotiated frame max is too small (min = {}, got = {})",
        min,
        requested
    ))]
    FrameMaxTooSmall { min: u32, requested: u32 },

    /// Timeout occurred while performing the initial handshake.
    #[snafu(display("timeout during connection handshake"))]
    ConnectionTimeout,

    /// The server requested a secure/secure-ok exchange, which none of our
    /// mechanisms need.
    #[snafu(display("SASL secure/secure-ok exchanges are not supported"))]
    SaslSecureNotSupported,

    /// The supplied authentication credentials were not accepted by the server.
    #[snafu(display("invalid credentials"))]
    InvalidCredentials,

    /// The server missed too many successive heartbeats.
    #[snafu(display("missed heartbeats from server"))]
    MissedServerHeartbeats,

    /// The server closed the connection with the given reply code and text.
    #[snafu(display("server closed connection (code={} message={})", code, message))]
    ServerClosedConnection { code: u16, message: String },

    /// The server closed the given channel with the given reply code and text.
    #[snafu(display(
        "server closed channel {} (code={} message={})",
        channel_id,
        code,
        message
    ))]
    ServerClosedChannel {
        channel_id: u16,
        code: u16,
        message: String,
    },

    /// An operation was attempted against a connection or channel that has
    /// already shut down. Carries the reason for the shutdown.
    #[snafu(display("already closed ({})", reason))]
    AlreadyClosed { reason: ShutdownReason },

    /// The I/O loop attempted to send a message to a caller that did not
    /// exist. This indicates either a bug in durabbit or a connection that is
    /// in a bad state and in the process of tearing down.
    #[snafu(display("i/o loop thread tried to communicate with a nonexistent client"))]
    EventLoopClientDropped,

    /// The I/O loop has dropped the sending side of a channel, typically
    /// because it has exited due to another error.
    #[snafu(display("i/o loop dropped sending side of a channel"))]
    EventLoopDropped,

    /// We received a valid AMQP frame but not one we expected.
    #[snafu(display("AMQP protocol error - received unexpected frame"))]
    FrameUnexpected,

    /// A synchronous call received a response of the wrong method type.
    #[snafu(display("AMQP protocol error - unexpected RPC response ({:?})", response))]
    BadRpcResponse { response: AMQPClass },

    /// A synchronous call did not receive its response within the RPC timeout.
    #[snafu(display("timed out waiting for RPC response"))]
    RpcTimeout,

    /// Forking the I/O thread failed.
    #[snafu(display("fork failed: {}", source))]
    ForkFailed { source: io::Error },

    /// No more channels can be opened because channel_max channels are
    /// already open.
    #[snafu(display("no more channel ids are available"))]
    ExhaustedChannelIds,

    /// An explicit channel ID was requested, but that channel is unavailable
    /// for use.
    #[snafu(display("requested channel id {} is unavailable", channel_id))]
    UnavailableChannelId { channel_id: u16 },

    /// The client sent an AMQP exception to the server and closed the
    /// connection.
    #[snafu(display("internal client exception - received unhandled frames from server"))]
    ClientException,

    /// The server sent frames for a channel ID we don't know about.
    #[snafu(display("received frame for nonexistent channel {}", channel_id))]
    ReceivedFrameWithBogusChannelId { channel_id: u16 },

    /// The I/O thread panicked.
    #[snafu(display("I/O thread panicked"))]
    IoThreadPanic,

    /// The server sent us a consumer tag that is equal to another consumer
    /// tag already active on the same channel.
    #[snafu(display(
        "server sent duplicate consumer tag for channel {}: {}",
        channel_id,
        consumer_tag
    ))]
    DuplicateConsumerTag {
        channel_id: u16,
        consumer_tag: String,
    },

    /// The server sent us a delivery for a consumer tag we don't know about.
    #[snafu(display(
        "received delivery with unknown consumer tag for channel {}: {}",
        channel_id,
        consumer_tag
    ))]
    UnknownConsumerTag {
        channel_id: u16,
        consumer_tag: String,
    },

    /// Serializing an outbound frame failed; this indicates a bug in the
    /// frame generation library.
    #[snafu(display("internal serialization error"))]
    InternalSerializationError,

    /// Creating the mio poll handle failed.
    #[snafu(display("failed to create polling handle: {}", source))]
    CreatePollHandle { source: io::Error },

    /// Registering a source with the poll handle failed.
    #[snafu(display("failed to register with polling handle: {}", source))]
    RegisterWithPollHandle { source: io::Error },

    /// Deregistering a source from the poll handle failed.
    #[snafu(display("failed to deregister from polling handle: {}", source))]
    DeregisterWithPollHandle { source: io::Error },

    /// Polling for I/O events failed.
    #[snafu(display("failed to poll: {}", source))]
    FailedToPoll { source: io::Error },
}

impl From<url::ParseError> for Error {
    fn from(source: url::ParseError) -> Error {
        Error::UrlParse { source }
    }
}
