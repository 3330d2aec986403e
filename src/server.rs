//! Protocol terminators
//!
//! Both terminators sit on a [`Dispatcher`] and spawn one task per
//! connection. [`PlainTerminator`] takes fresh client connections;
//! [`TlsTerminator`] takes the tunnels reinjected after a `CONNECT`,
//! completes a TLS handshake with a certificate forged for the requested name
//! and serves the decrypted stream.

use crate::ca::CertificateAuthority;
use crate::dispatcher::Dispatcher;
use crate::errors::{Error, Result};
use crate::forwarder::Forwarder;
use crate::stream::PendingConnection;
use crate::transport::Transport;
use std::sync::Arc;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

/// Serves plain HTTP on fresh connections.
pub struct PlainTerminator<T> {
  dispatcher: Dispatcher,
  forwarder: Forwarder<T>,
}

impl<T: Transport> PlainTerminator<T> {
  /// Terminator pulling from `dispatcher`.
  pub fn new(dispatcher: Dispatcher, forwarder: Forwarder<T>) -> Self {
    Self {
      dispatcher,
      forwarder,
    }
  }

  /// Accept until the dispatcher is closed.
  pub async fn run(self) -> Result<()> {
    while let Some(conn) = self.dispatcher.accept().await {
      let forwarder = self.forwarder.clone();
      tokio::spawn(async move {
        let peer_addr = conn.peer_addr();
        if let Err(e) = forwarder.serve(conn).await {
          tracing::debug!("[httptap] connection from {:?} ended: {}", peer_addr, e);
        }
      });
    }
    Ok(())
  }
}

/// Terminates TLS on reinjected tunnels.
pub struct TlsTerminator<T> {
  dispatcher: Dispatcher,
  forwarder: Forwarder<T>,
  authority: CertificateAuthority,
}

impl<T: Transport> TlsTerminator<T> {
  /// Terminator pulling tunnels from `dispatcher` and signing with `authority`.
  pub fn new(dispatcher: Dispatcher, forwarder: Forwarder<T>, authority: CertificateAuthority) -> Self {
    Self {
      dispatcher,
      forwarder,
      authority,
    }
  }

  /// Accept tunnels until the dispatcher is closed.
  pub async fn run(self) -> Result<()> {
    while let Some(conn) = self.dispatcher.accept_reinjected().await {
      let forwarder = self.forwarder.clone();
      let authority = self.authority.clone();
      tokio::spawn(async move {
        let peer_addr = conn.peer_addr();
        let tls = match handshake(&authority, conn).await {
          Ok(tls) => tls,
          Err(e) => {
            tracing::warn!("[httptap] TLS handshake with {:?} failed: {}", peer_addr, e);
            return;
          }
        };
        if let Err(e) = forwarder.serve(tls).await {
          tracing::debug!("[httptap] tunnel from {:?} ended: {}", peer_addr, e);
        }
      });
    }
    Ok(())
  }
}

/// Read the ClientHello, forge a certificate for the requested name and
/// finish the handshake.
///
/// The name comes from SNI, or from the `CONNECT` target when the client
/// sent none.
pub async fn handshake(
  authority: &CertificateAuthority,
  conn: PendingConnection,
) -> Result<TlsStream<PendingConnection>> {
  let fallback = conn.tunnel_target().map(|target| {
    target
      .host()
      .trim_start_matches('[')
      .trim_end_matches(']')
      .to_string()
  });
  let start = LazyConfigAcceptor::new(Acceptor::default(), conn).await?;
  let server_name = start
    .client_hello()
    .server_name()
    .map(str::to_string)
    .or(fallback)
    .ok_or_else(|| Error::issuance("client sent no server name"))?;
  let config = authority.issue(&server_name)?.server_config()?;
  Ok(start.into_stream(Arc::new(config)).await?)
}
