//! Proxy configuration and the accept loop
use crate::ca::{CertificateAuthority, RootAuthority};
use crate::connector::Connector;
use crate::dispatcher::Dispatcher;
use crate::errors::Result;
use crate::forwarder::Forwarder;
use crate::logger::{ExchangeLogger, TracingLogger};
use crate::server::{PlainTerminator, TlsTerminator};
use crate::tls::Certificate;
use crate::transport::{HttpTransport, RetryTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// MITM proxy configuration
#[derive(Debug, Clone)]
pub struct MitmConfig {
  /// Address the proxy listens on
  pub listen_addr: String,
  /// PEM file with the root certificate
  pub ca_cert_path: PathBuf,
  /// PEM file with the root's PKCS#8 RSA private key
  pub ca_key_path: PathBuf,
  /// Connect timeout towards origins
  pub connect_timeout: Option<Duration>,
  /// Wait for a complete origin response
  pub read_timeout: Option<Duration>,
  /// Per-write timeout towards origins
  pub write_timeout: Option<Duration>,
  /// Extra attempts for failed idempotent requests
  pub max_retries: usize,
  /// Skip origin certificate verification
  pub accept_invalid_upstream_certs: bool,
  /// Roots trusted for origins in addition to the webpki set
  pub upstream_root_certs: Vec<Certificate>,
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:8081".to_string(),
      ca_cert_path: PathBuf::from("rootCA.pem"),
      ca_key_path: PathBuf::from("rootCA-key.pem"),
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(60)),
      write_timeout: Some(Duration::from_secs(30)),
      max_retries: 0,
      accept_invalid_upstream_certs: false,
      upstream_root_certs: vec![],
    }
  }
}

/// The transport `MitmProxy` forwards through.
pub type DefaultTransport = RetryTransport<HttpTransport>;

/// MITM Proxy main struct
#[derive(Clone)]
pub struct MitmProxy {
  config: MitmConfig,
  authority: CertificateAuthority,
  transport: Arc<DefaultTransport>,
  logger: Arc<dyn ExchangeLogger>,
}

impl MitmProxy {
  /// Load the root from the configured paths and build the outbound transport.
  pub async fn new(config: MitmConfig) -> Result<Self> {
    let root = RootAuthority::load(&config.ca_cert_path, &config.ca_key_path).await?;
    Self::with_root(config, root)
  }

  /// Same as [`new`](Self::new) with an already loaded root.
  pub fn with_root(config: MitmConfig, root: RootAuthority) -> Result<Self> {
    let connector = Connector::builder()
      .certs_verification(!config.accept_invalid_upstream_certs)
      .certificate(config.upstream_root_certs.clone())
      .connect_timeout(config.connect_timeout)
      .read_timeout(config.read_timeout)
      .write_timeout(config.write_timeout)
      .build()?;
    let transport = RetryTransport::new(HttpTransport::new(connector), config.max_retries);
    Ok(Self {
      config,
      authority: CertificateAuthority::new(root),
      transport: Arc::new(transport),
      logger: Arc::new(TracingLogger),
    })
  }

  /// Replace the default [`TracingLogger`].
  pub fn with_logger(mut self, logger: Arc<dyn ExchangeLogger>) -> Self {
    self.logger = logger;
    self
  }

  /// The authority signing forged certificates.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.authority
  }

  /// Current configuration.
  pub fn config(&self) -> &MitmConfig {
    &self.config
  }

  /// Bind the configured address and serve until a terminator stops.
  pub async fn start(&self) -> Result<()> {
    let dispatcher = Dispatcher::listen(self.config.listen_addr.as_str()).await?;
    self.clone().serve(dispatcher).await
  }

  /// Run both terminators on an existing dispatcher.
  pub async fn serve(self, dispatcher: Dispatcher) -> Result<()> {
    let forwarder = Forwarder::new(dispatcher.clone(), self.transport, self.logger);
    let plain = PlainTerminator::new(dispatcher.clone(), forwarder.clone());
    let tls = TlsTerminator::new(dispatcher, forwarder, self.authority);
    tokio::select! {
      result = plain.run() => result,
      result = tls.run() => result,
    }
  }
}
