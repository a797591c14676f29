//! Transport layer
//!
//! Dials the byte-stream transport the session engine runs over. The
//! engine itself only needs [`Connection`]; everything here is about
//! turning a URI into one.
//!
//! Supported schemes: `tcp://`, `ssl://`/`tls://`/`tcps://` (rustls over
//! TCP, caller-supplied client config), `ws://`/`wss://` (WebSocket with
//! subprotocol `mqtt`, binary frames) and `unix://` on Unix platforms.

mod websocket;

pub use websocket::WsStream;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::protocol::ClientError;

/// The byte-stream transport the engine drives. Blanket-implemented for
/// any async stream, including in-process duplex pipes in tests.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Dial the transport named by `uri`.
///
/// TLS-based schemes require a caller-supplied rustls config; certificate
/// policy is the caller's concern. Unknown schemes fail with
/// [`ClientError::UnknownProtocol`].
pub async fn open_connection(
    uri: &str,
    tls: Option<Arc<rustls::ClientConfig>>,
    dial_timeout: Duration,
) -> Result<Box<dyn Connection>, ClientError> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| ClientError::UnknownProtocol(uri.to_string()))?;
    let authority = rest.split('/').next().unwrap_or(rest);

    match scheme {
        "tcp" => {
            debug!(addr = authority, "dialing tcp");
            let stream = dial_tcp(authority, dial_timeout).await?;
            Ok(Box::new(stream))
        }
        "ssl" | "tls" | "tcps" => {
            debug!(addr = authority, "dialing tls");
            let config = tls.ok_or(ClientError::Protocol("tls config required"))?;
            let stream = dial_tcp(authority, dial_timeout).await?;
            let host = authority
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(authority);
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| ClientError::Protocol("invalid tls server name"))?;
            let connector = TlsConnector::from(config);
            let stream = timeout(dial_timeout, connector.connect(server_name, stream))
                .await
                .map_err(|_| dial_timeout_error())?
                .map_err(ClientError::from)?;
            Ok(Box::new(stream))
        }
        "ws" | "wss" => {
            debug!(uri, "dialing websocket");
            let stream = websocket::dial(uri, scheme == "wss", tls, dial_timeout).await?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => {
            debug!(path = rest, "dialing unix socket");
            let stream = timeout(dial_timeout, tokio::net::UnixStream::connect(rest))
                .await
                .map_err(|_| dial_timeout_error())?
                .map_err(ClientError::from)?;
            Ok(Box::new(stream))
        }
        _ => Err(ClientError::UnknownProtocol(scheme.to_string())),
    }
}

async fn dial_tcp(authority: &str, dial_timeout: Duration) -> Result<TcpStream, ClientError> {
    let stream = timeout(dial_timeout, TcpStream::connect(authority))
        .await
        .map_err(|_| dial_timeout_error())?
        .map_err(ClientError::from)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub(crate) fn dial_timeout_error() -> ClientError {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout exceeded").into()
}
