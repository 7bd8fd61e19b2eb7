use crate::errors::*;
use crate::Sasl;
use amq_protocol::protocol::connection::{Open, Start, StartOk, Tune, TuneOk};
use amq_protocol::protocol::constants::FRAME_MIN_SIZE;
use amq_protocol::types::{AMQPValue, FieldTable};
use snafu::ensure;
use std::fmt;
use std::time::Duration;
use url::Url;

/// A broker address to dial: host and port.
///
/// Parse one from an `amqp://` URL with [`parse`](#method.parse); credentials
/// and virtual host are carried by [`ConnectionOptions`](struct.ConnectionOptions.html),
/// not by the endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

const AMQP_DEFAULT_PORT: u16 = 5672;

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Parse an `amqp://host[:port]` URL into an endpoint. The port defaults
    /// to 5672. Secure (`amqps`) URLs are rejected; this crate speaks plain
    /// TCP only.
    pub fn parse(url: &str) -> Result<Endpoint> {
        let url = Url::parse(url)?;
        ensure!(url.scheme() == "amqp", InvalidUrlSnafu { url });
        let host = url.host_str().map(str::to_string);
        let host = match host {
            Some(host) => host,
            None => return InvalidUrlSnafu { url }.fail(),
        };
        let port = url.port().unwrap_or(AMQP_DEFAULT_PORT);
        Ok(Endpoint { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Options that control the overall AMQP connection.
///
/// `ConnectionOptions` uses the builder pattern. The default settings are
/// equivalent to
///
/// ```rust
/// use durabbit::{Auth, ConnectionOptions};
/// use std::time::Duration;
///
/// # fn default_connection_options() -> ConnectionOptions<Auth> {
/// ConnectionOptions::default()
///     .auth(Auth::default())
///     .virtual_host("/")
///     .locale("en_US")
///     .channel_max(0)
///     .frame_max(0)
///     .heartbeat(60)
///     .connection_timeout(None)
///     .rpc_timeout(Some(Duration::from_secs(20)))
///     .information(None)
///     .client_provided_name(None)
/// # }
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionOptions<Auth: Sasl = crate::Auth> {
    pub(crate) auth: Auth,
    pub(crate) virtual_host: String,
    pub(crate) locale: String,
    pub(crate) channel_max: u16,
    pub(crate) frame_max: u32,
    pub(crate) heartbeat: u16,
    pub(crate) connection_timeout: Option<Duration>,
    pub(crate) rpc_timeout: Option<Duration>,
    pub(crate) information: Option<String>,
    pub(crate) client_provided_name: Option<String>,
}

impl<Auth: Sasl> Default for ConnectionOptions<Auth> {
    // NOTE: If we change this, make sure to change the doc comment above.
    fn default() -> Self {
        ConnectionOptions {
            auth: Auth::default(),
            virtual_host: "/".to_string(),
            locale: "en_US".to_string(),
            channel_max: 0,
            frame_max: 0,
            heartbeat: 60,
            connection_timeout: None,
            rpc_timeout: Some(Duration::from_secs(20)),
            information: None,
            client_provided_name: None,
        }
    }
}

impl<Auth: Sasl> ConnectionOptions<Auth> {
    /// Sets the SASL authentication method.
    pub fn auth(self, auth: Auth) -> Self {
        ConnectionOptions { auth, ..self }
    }

    /// Sets the AMQP virtual host.
    pub fn virtual_host<T: Into<String>>(self, virtual_host: T) -> Self {
        ConnectionOptions {
            virtual_host: virtual_host.into(),
            ..self
        }
    }

    /// Sets the locale. AMQP requires servers to support the `en_US` locale
    /// (which is also the default locale for `ConnectionOptions`).
    pub fn locale<T: Into<String>>(self, locale: T) -> Self {
        ConnectionOptions {
            locale: locale.into(),
            ..self
        }
    }

    /// Sets the maximum number of channels that can be opened simultaneously
    /// on this connection. 0 means "no limit from our side"; if both sides
    /// offer a nonzero value, the lower wins.
    pub fn channel_max(self, channel_max: u16) -> Self {
        ConnectionOptions {
            channel_max,
            ..self
        }
    }

    /// Sets the maximum size in bytes of frames used for this connection.
    /// 0 means "no limit from our side"; if both sides offer a nonzero value,
    /// the lower wins. Messages larger than the negotiated value are split
    /// into multiple body frames.
    ///
    /// AMQP specifies a minimum frame max of 4096; negotiating a lower value
    /// fails the connection attempt.
    pub fn frame_max(self, frame_max: u32) -> Self {
        ConnectionOptions { frame_max, ..self }
    }

    /// Sets the requested heartbeat interval in seconds. 0 means "we don't
    /// want heartbeats"; if either side requests 0 the other side's value is
    /// used, and if both sides request a nonzero value the lower wins.
    pub fn heartbeat(self, heartbeat: u16) -> Self {
        ConnectionOptions { heartbeat, ..self }
    }

    /// Sets the timeout for the connection handshake (TCP connect through
    /// open-ok). If None (the default), there is no timeout.
    pub fn connection_timeout(self, connection_timeout: Option<Duration>) -> Self {
        ConnectionOptions {
            connection_timeout,
            ..self
        }
    }

    /// Sets the timeout applied to each synchronous RPC (declare, bind,
    /// consume, close, ...). If None, RPCs wait indefinitely.
    pub fn rpc_timeout(self, rpc_timeout: Option<Duration>) -> Self {
        ConnectionOptions {
            rpc_timeout,
            ..self
        }
    }

    /// Sets the "information" string reported during handshaking to the
    /// server. This string is displayed in the RabbitMQ management interface
    /// under "Client properties" of a connection.
    pub fn information(self, information: Option<String>) -> Self {
        ConnectionOptions {
            information,
            ..self
        }
    }

    /// Sets a connection name reported to the server; management UIs display
    /// it alongside the connection.
    pub fn client_provided_name(self, client_provided_name: Option<String>) -> Self {
        ConnectionOptions {
            client_provided_name,
            ..self
        }
    }

    pub(crate) fn make_start_ok(&self, start: Start) -> Result<(StartOk, FieldTable)> {
        // helper to search space-separated strings (mechanisms and locales)
        fn server_supports(server: &str, client: &str) -> bool {
            server.split(' ').any(|s| s == client)
        }

        let mechanism = self.auth.mechanism();
        if !server_supports(&start.mechanisms, &mechanism) {
            return UnsupportedAuthMechanismSnafu {
                available: start.mechanisms.clone(),
            }
            .fail();
        }
        if !server_supports(&start.locales, &self.locale) {
            return UnsupportedLocaleSnafu {
                available: start.locales.clone(),
                requested: self.locale.clone(),
            }
            .fail();
        }

        // bundle up info about this crate as client properties
        let mut client_properties = FieldTable::new();
        let mut set_prop = |k: &str, v: String| {
            client_properties.insert(k.to_string(), AMQPValue::LongString(v));
        };
        set_prop("product", crate::built_info::PKG_NAME.to_string());
        set_prop("version", crate::built_info::PKG_VERSION.to_string());
        set_prop(
            "platform",
            format!(
                "{} / {}",
                crate::built_info::CFG_OS,
                crate::built_info::RUSTC_VERSION
            ),
        );
        if let Some(information) = &self.information {
            set_prop("information", information.to_string());
        }
        if let Some(name) = &self.client_provided_name {
            set_prop("connection_name", name.to_string());
        }
        let mut capabilities = FieldTable::new();
        capabilities.insert(
            "consumer_cancel_notify".to_string(),
            AMQPValue::Boolean(true),
        );
        client_properties.insert(
            "capabilities".to_string(),
            AMQPValue::FieldTable(capabilities),
        );

        Ok((
            StartOk {
                client_properties,
                mechanism,
                response: self.auth.response(),
                locale: self.locale.clone(),
            },
            start.server_properties,
        ))
    }

    pub(crate) fn make_tune_ok(&self, tune: Tune) -> Result<TuneOk> {
        let channel_max = negotiate_u16(tune.channel_max, self.channel_max);
        let frame_max = negotiate_u32(tune.frame_max, self.frame_max);
        let heartbeat = negotiate_u16(tune.heartbeat, self.heartbeat);

        // frame_max of 0 means both sides claimed "unlimited"; the negotiated
        // value is then the u32 ceiling, which passes the minimum check.
        let effective_frame_max = if frame_max == 0 {
            u32::max_value()
        } else {
            frame_max
        };
        ensure!(
            effective_frame_max >= u32::from(FRAME_MIN_SIZE),
            FrameMaxTooSmallSnafu {
                min: u32::from(FRAME_MIN_SIZE),
                requested: frame_max,
            }
        );

        Ok(TuneOk {
            channel_max,
            frame_max,
            heartbeat,
        })
    }

    pub(crate) fn make_open(&self) -> Open {
        Open {
            virtual_host: self.virtual_host.clone(),
            capabilities: "".to_string(), // reserved
            insist: false,                // reserved
        }
    }
}

// Tuning negotiation: 0 means "unlimited" (or, for heartbeats, "none
// requested"), so either side offering 0 yields the other side's value;
// otherwise the lower offer wins.
fn negotiate_u16(server: u16, client: u16) -> u16 {
    match (server, client) {
        (0, c) => c,
        (s, 0) => s,
        (s, c) => u16::min(s, c),
    }
}

fn negotiate_u32(server: u32, client: u32) -> u32 {
    match (server, client) {
        (0, c) => c,
        (s, 0) => s,
        (s, c) => u32::min(s, c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;

    fn tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> Tune {
        Tune {
            channel_max,
            frame_max,
            heartbeat,
        }
    }

    #[test]
    fn channel_max_negotiation() {
        let cases: &[(u16, u16, u16)] = &[
            // (server, client, expected)
            (0, 0, 0),
            (0, 10, 10),
            (10, 0, 10),
            (10, 20, 10),
            (20, 10, 10),
        ];
        for &(server, client, expected) in cases {
            let options = ConnectionOptions::<Auth>::default().channel_max(client);
            let tune_ok = options.make_tune_ok(tune(server, 1 << 17, 60)).unwrap();
            assert_eq!(tune_ok.channel_max, expected);
        }
    }

    #[test]
    fn heartbeat_negotiation_prefers_other_side_on_zero() {
        let cases: &[(u16, u16, u16)] = &[
            (0, 0, 0),
            (0, 30, 30),
            (60, 0, 60),
            (60, 30, 30),
            (30, 60, 30),
        ];
        for &(server, client, expected) in cases {
            let options = ConnectionOptions::<Auth>::default().heartbeat(client);
            let tune_ok = options.make_tune_ok(tune(0, 1 << 17, server)).unwrap();
            assert_eq!(tune_ok.heartbeat, expected);
        }
    }

    #[test]
    fn client_properties_report_information_and_connection_name() {
        let options = ConnectionOptions::<Auth>::default()
            .information(Some("durabbit test".to_string()))
            .client_provided_name(Some("conn-1".to_string()));

        let start = Start {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: options.auth.mechanism(),
            locales: options.locale.clone(),
        };

        let (start_ok, _) = options.make_start_ok(start).unwrap();
        for key in &["product", "version", "platform", "information", "connection_name"] {
            assert!(
                start_ok.client_properties.contains_key(*key),
                "missing client property {}",
                key
            );
        }
    }

    #[test]
    fn unsupported_auth_mechanism() {
        let options = ConnectionOptions::<Auth>::default();

        let start = Start {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: "NOTPLAIN SOMETHINGELSE".to_string(),
            locales: options.locale.clone(),
        };

        match options.make_start_ok(start).unwrap_err() {
            Error::UnsupportedAuthMechanism { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn unsupported_locale() {
        let options = ConnectionOptions::<Auth>::default().locale("nonexistent");

        let start = Start {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: options.auth.mechanism(),
            locales: "en_US es_ES".to_string(),
        };

        match options.make_start_ok(start).unwrap_err() {
            Error::UnsupportedLocale { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn frame_max_too_small() {
        let frame_max = u32::from(FRAME_MIN_SIZE) - 1;
        let options = ConnectionOptions::<Auth>::default().frame_max(frame_max);

        match options
            .make_tune_ok(tune(u16::max_value(), 1 << 17, 60))
            .unwrap_err()
        {
            Error::FrameMaxTooSmall { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn endpoint_parsing() {
        let ep = Endpoint::parse("amqp://broker.example.com").unwrap();
        assert_eq!(ep.host(), "broker.example.com");
        assert_eq!(ep.port(), 5672);

        let ep = Endpoint::parse("amqp://broker.example.com:5673").unwrap();
        assert_eq!(ep.port(), 5673);

        match Endpoint::parse("amqps://secure.example.com").unwrap_err() {
            Error::InvalidUrl { .. } => (),
            err => panic!("unexpected error {}", err),
        }

        assert!(Endpoint::parse("not a url").is_err());
    }
}
