use crate::connection_options::Endpoint;
use crate::errors::*;
use mio::net::TcpStream;
use mio::Evented;
use snafu::ResultExt;
use std::io::{Read, Write};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::Duration;

/// Byte stream the connection's I/O thread can drive: readable, writable,
/// and pollable by mio.
pub trait IoStream: Read + Write + Evented + Send + 'static {}

impl IoStream for TcpStream {}

/// Dial an endpoint over plain TCP and hand the socket to mio.
///
/// Resolution may yield several addresses; each is tried in order and the
/// first that accepts wins. The returned stream is nonblocking.
pub(crate) fn connect_tcp(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<TcpStream> {
    let host = endpoint.host();
    let port = endpoint.port();

    let addrs = (host, port)
        .to_socket_addrs()
        .context(FailedToConnectSnafu {
            host: host.to_string(),
            port,
        })?;

    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => StdTcpStream::connect_timeout(&addr, timeout),
            None => StdTcpStream::connect(&addr),
        };
        match attempt {
            Ok(stream) => {
                let stream = TcpStream::from_stream(stream).context(FailedToConnectSnafu {
                    host: host.to_string(),
                    port,
                })?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    let source = last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "hostname resolved to no addresses")
    });
    Err(source).context(FailedToConnectSnafu {
        host: host.to_string(),
        port,
    })
}
