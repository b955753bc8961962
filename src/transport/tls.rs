//! Client-side TLS for the SMTP transport.
//!
//! One process-wide rustls `ClientConfig` built from the webpki root set,
//! shared by every outbound TLS session. Two entry points: `connect` opens a
//! fresh implicit-TLS connection, `wrap` upgrades an already-open socket
//! after a successful STARTTLS exchange.

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::net::TcpStream;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// A blocking TLS session over a TCP socket.
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

fn client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| anyhow!("invalid TLS server name '{}'", host))
}

/// Upgrade an established socket to TLS (the STARTTLS path).
pub fn wrap(stream: TcpStream, host: &str) -> Result<TlsStream> {
    let conn = ClientConnection::new(client_config(), server_name(host)?)
        .with_context(|| format!("tls client handshake setup for '{}'", host))?;
    Ok(StreamOwned::new(conn, stream))
}

/// Open a new TCP connection and negotiate TLS immediately (implicit TLS).
pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<TlsStream> {
    let stream = connect_tcp(host, port, timeout)?;
    wrap(stream, host)
}

/// Resolve and connect with a per-attempt deadline applied to the socket.
pub fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    use std::net::ToSocketAddrs;
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve '{}:{}'", host, port))?
        .collect();
    let mut last_err = anyhow!("no addresses for '{}:{}'", host, port);
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(err) => last_err = anyhow!("connect {}: {}", addr, err),
        }
    }
    Err(last_err)
}
