//! Dialing origin servers over TCP and TLS
use crate::errors::{new_io_error, Error, Result};
use crate::socket::Socket;
use crate::tls::{crypto_provider, AcceptAnyServerCert, Certificate};
use socket2::{Domain, Protocol, SockRef, Socket as RawSocket, TcpKeepalive, Type};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Options for reaching origin servers.
#[derive(Clone)]
pub struct ConnectorBuilder {
  verify_upstream: bool,
  extra_roots: Vec<Certificate>,
  connect_timeout: Option<Duration>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      verify_upstream: true,
      extra_roots: vec![],
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(60)),
      write_timeout: Some(Duration::from_secs(30)),
      nodelay: true,
      keepalive: false,
    }
  }
}

impl ConnectorBuilder {
  /// Verify origin certificates. On by default.
  ///
  /// # Warning
  ///
  /// Turning this off makes the proxy accept forged or expired origin
  /// certificates. Meant for test origins only.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.verify_upstream = value;
    self
  }
  /// Roots trusted for origins besides the bundled webpki set.
  pub fn certificate(mut self, value: Vec<Certificate>) -> ConnectorBuilder {
    self.extra_roots = value;
    self
  }
  /// `TCP_NODELAY` on origin sockets. On by default.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// TCP keepalive on origin sockets. Off by default.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Bound on establishing the TCP connection. 10 seconds by default.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Bound on waiting for the response head, and on each wait for more
  /// body bytes. 60 seconds by default.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Bound on sending a whole request. 30 seconds by default.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }

  fn client_config(&self) -> Result<ClientConfig> {
    let versions = ClientConfig::builder_with_provider(crypto_provider())
      .with_safe_default_protocol_versions()
      .map_err(|_| crate::errors::builder("invalid TLS versions"))?;
    let mut config = if self.verify_upstream {
      let mut roots = RootCertStore::empty();
      roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
      for cert in self.extra_roots.iter().cloned() {
        cert.add_to_tls(&mut roots)?;
      }
      versions.with_root_certificates(roots).with_no_client_auth()
    } else {
      versions
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth()
    };
    // origins are spoken to in HTTP/1.1 only
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
  }

  /// Build the `Connector`.
  pub fn build(&self) -> Result<Connector> {
    Ok(Connector {
      options: self.clone(),
      tls: TlsConnector::from(Arc::new(self.client_config()?)),
    })
  }
}

/// Opens outbound connections to origin servers.
pub struct Connector {
  options: ConnectorBuilder,
  tls: TlsConnector,
}

impl Connector {
  /// A builder with the default settings.
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }

  // socket options are applied through socket2 before the connect
  fn raw_socket(&self, addr: SocketAddr) -> Result<TcpSocket> {
    let raw = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw.set_nonblocking(true)?;
    raw.set_nodelay(self.options.nodelay)?;
    if self.options.keepalive {
      raw.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))?;
    }
    Ok(TcpSocket::from_std_stream(raw.into()))
  }

  /// Open a plain TCP connection to `addr`.
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let connect = self.raw_socket(addr)?.connect(addr);
    let stream: TcpStream = match self.options.connect_timeout {
      None => connect.await?,
      Some(limit) => tokio::time::timeout(limit, connect)
        .await
        .map_err(|_| new_io_error(ErrorKind::TimedOut, &format!("connect {} timed out", addr)))??,
    };
    if self.options.keepalive {
      tracing::trace!(
        "[httptap] keepalive {:?} on {}",
        SockRef::from(&stream).keepalive(),
        addr
      );
    }
    Ok(Socket::new(
      stream,
      self.options.read_timeout,
      self.options.write_timeout,
    ))
  }

  /// Connect to the origin named by an absolute `http` or `https` URI,
  /// upgrading to TLS for `https`. Every resolved address is tried in turn.
  pub async fn connect_with_uri(&self, target: &http::Uri) -> Result<Socket> {
    let https = match target.scheme_str() {
      Some("https") => true,
      Some("http") => false,
      _ => {
        return Err(Error::forward(format!("unsupported URL scheme: {}", target)));
      }
    };
    let host = target
      .host()
      .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
      .filter(|h| !h.is_empty())
      .ok_or_else(|| Error::forward(format!("no host in URL: {}", target)))?;
    let port = target.port_u16().unwrap_or(if https { 443 } else { 80 });

    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
      match self.connect_with_addr(addr).await {
        Ok(socket) if https => return self.upgrade_to_tls(socket, host).await,
        Ok(socket) => return Ok(socket),
        Err(e) => {
          tracing::debug!("[httptap] connect {} failed: {}", addr, e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(ErrorKind::NotFound, &format!("no addresses for {}", host))
    }))
  }

  /// Run a client TLS handshake over an established socket.
  pub async fn upgrade_to_tls(&self, socket: Socket, domain: &str) -> Result<Socket> {
    let server_name =
      ServerName::try_from(domain.to_owned()).map_err(|e| Error::Other(e.to_string()))?;
    let tls = self.tls.clone();
    Ok(
      socket
        .into_tls(move |tcp| async move { tls.connect(server_name, tcp).await })
        .await?,
    )
  }
}
