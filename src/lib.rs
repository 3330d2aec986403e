#![deny(missing_docs)]

//! # httptap
//!
//! An intercepting HTTP/HTTPS proxy. Plain requests are forwarded to their
//! origin; `CONNECT` tunnels are taken over and terminated with a certificate
//! forged on the fly for the requested host, signed by a root the client
//! trusts. Every forwarded request and response passes through an
//! [`ExchangeLogger`].
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! # async fn run() -> httptap::Result<()> {
//! let config = httptap::MitmConfig {
//!   ca_cert_path: "rootCA.pem".into(),
//!   ca_key_path: "rootCA-key.pem".into(),
//!   ..Default::default()
//! };
//! httptap::MitmProxy::new(config).await?.start().await
//! # }
//! ```
//!
//! ## Pieces
//!
//! - [`Dispatcher`]: listener-like handoff of raw connections, with a separate
//!   queue for tunnels reinjected after a `CONNECT`.
//! - [`Forwarder`]: the per-connection request handler.
//! - [`CertificateAuthority`]: leaf certificate forging.
//! - [`Transport`]: outbound round trips, [`HttpTransport`] by default.
//!   Response bodies stream through as a [`Body`].
//!
mod body;
mod ca;
/// HTTP/1.x message framing
pub mod codec;
mod connector;
mod dispatcher;
mod errors;
mod forwarder;
/// Hop-by-hop header handling
pub mod headers;
mod id;
mod logger;
mod proxy;
mod server;
mod socket;
mod stream;
mod tls;
mod transport;

pub use body::Body;
pub use ca::{CertificateAuthority, IssuedCertificate, RootAuthority, ORGANIZATION};
pub use connector::{Connector, ConnectorBuilder};
pub use dispatcher::Dispatcher;
pub use errors::{Error, LogError, Result};
pub use forwarder::{
  error_response, rewrite_request, Forwarder, Takeover, HIJACK_UNSUPPORTED, MAX_RECORDED_BODY,
  PROXY_AGENT,
};
pub use http;
pub use id::{ExchangeId, IdGenerator};
pub use logger::{ExchangeLogger, ExchangeRecord, MemoryLogger, TracingLogger};
pub use proxy::{DefaultTransport, MitmConfig, MitmProxy};
pub use server::{handshake, PlainTerminator, TlsTerminator};
pub use socket::Socket;
pub use stream::PendingConnection;
pub use tls::Certificate;
pub use transport::{HttpTransport, RetryTransport, Transport};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
