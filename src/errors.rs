//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `httptap::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while intercepting traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// The listening socket could not be bound.
  #[error("bind error: {0}")]
  Bind(std::io::Error),
  /// The root certificate or its private key could not be loaded.
  #[error("root load error: {0}")]
  RootLoad(String),
  /// A leaf certificate could not be generated or signed.
  #[error("issuance error: {0}")]
  Issuance(String),
  /// The raw stream could not be taken over after a `CONNECT`.
  #[error("{0}")]
  Takeover(String),
  /// The round trip to the origin failed.
  #[error("{0}")]
  Forward(String),
  /// The exchange logger rejected a request or response.
  #[error(transparent)]
  Log(#[from] LogError),
  /// The client sent something that is not a usable HTTP/1.x request.
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

/// Error returned by an [`ExchangeLogger`](crate::ExchangeLogger).
///
/// Logging failures never abort the client-facing transaction.
#[derive(ThisError, Debug)]
#[error("log error: {0}")]
pub struct LogError(pub String);

impl Error {
  /// Create a root load error and log it
  pub fn root_load(msg: impl Into<String>) -> Self {
    let error = Error::RootLoad(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an issuance error and log it
  pub fn issuance(msg: impl Into<String>) -> Self {
    let error = Error::Issuance(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a takeover error and log it
  pub fn takeover(msg: impl Into<String>) -> Self {
    let error = Error::Takeover(msg.into());
    tracing::warn!("takeover error: {}", error);
    error
  }

  /// Create a forward error and log it
  pub fn forward(msg: impl Into<String>) -> Self {
    let error = Error::Forward(msg.into());
    tracing::warn!("forward error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::Other(e.into().to_string())
}
