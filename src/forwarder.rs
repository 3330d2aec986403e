//! Per-connection request handling
//!
//! A [`Forwarder`] reads requests off one client stream. A `CONNECT` turns
//! the stream into a tunnel: the proxy answers `200`, takes the raw stream
//! over and reinjects it into the dispatcher for TLS termination. Any other
//! request is rewritten to absolute form, sanitized, logged and sent to the
//! origin; the origin's answer is streamed back as it arrives and recorded
//! once it is complete.
use crate::body::Body;
use crate::codec::{self, Framing};
use crate::dispatcher::Dispatcher;
use crate::errors::{Error, Result};
use crate::headers::{copy_headers, strip_hop_by_hop};
use crate::id::IdGenerator;
use crate::logger::ExchangeLogger;
use crate::stream::PendingConnection;
use crate::transport::Transport;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::uri::Scheme;
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::server::TlsStream;

/// Value of the `Proxy-Agent` header sent with every `CONNECT` answer.
pub const PROXY_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Body of the `503` sent when a tunnel cannot be taken over.
pub const HIJACK_UNSUPPORTED: &str = "Hijacking not supported.";

/// Most response body bytes handed to the logger per exchange.
pub const MAX_RECORDED_BODY: usize = 8 * 1024 * 1024;

/// A client stream that may be handed over raw after a `CONNECT`.
pub trait Takeover: AsyncRead + AsyncWrite + Unpin + Send + Sized {
  /// Whether [`take_over`](Self::take_over) can succeed on this stream.
  fn supports_takeover(&self) -> bool;

  /// Give up the stream, prepending `buffered` (bytes the HTTP layer read
  /// past the request head) to what the new owner will read.
  ///
  /// On failure the stream is handed back with the reason.
  fn take_over(self, buffered: &[u8]) -> std::result::Result<PendingConnection, (Self, Error)>;
}

impl Takeover for PendingConnection {
  fn supports_takeover(&self) -> bool {
    true
  }

  fn take_over(self, buffered: &[u8]) -> std::result::Result<PendingConnection, (Self, Error)> {
    Ok(self.unread(buffered))
  }
}

// Decrypted bytes cannot be handed to a raw-stream consumer.
impl Takeover for TlsStream<PendingConnection> {
  fn supports_takeover(&self) -> bool {
    false
  }

  fn take_over(self, _buffered: &[u8]) -> std::result::Result<PendingConnection, (Self, Error)> {
    Err((self, Error::takeover(HIJACK_UNSUPPORTED)))
  }
}

/// Handles the HTTP transactions of one client connection.
pub struct Forwarder<T> {
  dispatcher: Dispatcher,
  transport: Arc<T>,
  logger: Arc<dyn ExchangeLogger>,
  ids: Arc<IdGenerator>,
}

impl<T> Clone for Forwarder<T> {
  fn clone(&self) -> Self {
    Self {
      dispatcher: self.dispatcher.clone(),
      transport: self.transport.clone(),
      logger: self.logger.clone(),
      ids: self.ids.clone(),
    }
  }
}

impl<T: Transport> Forwarder<T> {
  /// Tunnels are reinjected into `dispatcher`; everything else goes through
  /// `transport` and is recorded by `logger`.
  pub fn new(dispatcher: Dispatcher, transport: Arc<T>, logger: Arc<dyn ExchangeLogger>) -> Self {
    Self {
      dispatcher,
      transport,
      logger,
      ids: Arc::new(IdGenerator::new()),
    }
  }

  /// Serve `stream` until the client closes it, asks to close it, or turns
  /// it into a tunnel.
  pub async fn serve<S: Takeover>(&self, stream: S) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
      let request = match codec::read_request(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e @ Error::InvalidRequest(_)) => {
          let response = error_response(StatusCode::BAD_REQUEST, &e.to_string());
          let _ = codec::write_response(reader.get_mut(), &response).await;
          return Err(e);
        }
        Err(e) => return Err(e),
      };

      if request.method() == Method::CONNECT {
        return self.tunnel(reader, request).await;
      }

      let keep_alive = codec::keep_alive(request.version(), request.headers());
      let reusable = self.forward(request, reader.get_mut()).await?;
      if !(keep_alive && reusable) {
        break;
      }
    }
    let _ = reader.get_mut().shutdown().await;
    Ok(())
  }

  async fn tunnel<S: Takeover>(&self, reader: BufReader<S>, request: Request<Bytes>) -> Result<()> {
    let target = request.uri().authority().cloned();
    let buffered = reader.buffer().to_vec();
    let mut stream = reader.into_inner();
    if !stream.supports_takeover() {
      let response = error_response(StatusCode::SERVICE_UNAVAILABLE, HIJACK_UNSUPPORTED);
      codec::write_response(&mut stream, &response).await?;
      return Err(Error::takeover(HIJACK_UNSUPPORTED));
    }

    stream.write_all(&connect_established()).await?;
    stream.flush().await?;

    let conn = match stream.take_over(&buffered) {
      Ok(conn) => conn,
      Err((mut stream, e)) => {
        let response = error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        let _ = codec::write_response(&mut stream, &response).await;
        return Err(e);
      }
    };
    let conn = match target {
      Some(target) => {
        tracing::debug!("[httptap] tunnel to {} taken over", target);
        conn.with_tunnel(target)
      }
      None => conn,
    };
    self.dispatcher.reinject(conn).await
  }

  /// Relay one non-`CONNECT` request and write the answer to `client`.
  ///
  /// The origin's body is passed on chunk by chunk. Problems before the
  /// origin answers become `400` or `503` responses. Returns whether
  /// `client` may carry another exchange; an error leaves it unusable.
  pub async fn forward<W>(&self, mut request: Request<Bytes>, client: &mut W) -> Result<bool>
  where
    W: AsyncWrite + Unpin,
  {
    if let Err(e) = rewrite_request(&mut request) {
      let response = error_response(StatusCode::BAD_REQUEST, &e.to_string());
      codec::write_response(client, &response).await?;
      return Ok(true);
    }
    let id = self.ids.next_id();
    if let Err(e) = self.logger.record_request(&id, &request) {
      tracing::warn!("[httptap] failed to log request {}: {}", id, e);
    }
    let response = match self.transport.round_trip(request).await {
      Ok(response) => response,
      Err(e) => {
        let response = error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        codec::write_response(client, &response).await?;
        return Ok(true);
      }
    };

    let (parts, mut body) = response.into_parts();
    let framing = body.exact_length().map_or(Framing::Close, Framing::Length);
    let mut recorded = Vec::new();
    let copied = relay(client, &relay_head(&parts), framing, &mut body, &mut recorded).await;
    if let Err(e) = &copied {
      tracing::debug!("[httptap] relaying response {} failed: {}", id, e);
    }
    let logged = Response::from_parts(parts, Bytes::from(recorded));
    if let Err(e) = self.logger.record_response(&id, &logged) {
      tracing::warn!("[httptap] failed to log response {}: {}", id, e);
    }
    copied?;
    Ok(framing != Framing::Close)
  }
}

/// Turn a request as received from the client into one fit for the origin.
///
/// A target without scheme becomes `https://<Host><path?query>`. Hop-by-hop
/// headers are removed.
pub fn rewrite_request(request: &mut Request<Bytes>) -> Result<()> {
  if request.uri().scheme().is_none() {
    let host = request
      .headers()
      .get(HOST)
      .and_then(|h| h.to_str().ok())
      .filter(|h| !h.is_empty())
      .ok_or_else(|| Error::invalid_request("missing Host header"))?
      .to_string();
    let path = request
      .uri()
      .path_and_query()
      .map(|p| p.as_str())
      .filter(|p| p.starts_with('/'))
      .unwrap_or("/")
      .to_string();
    let uri = Uri::builder()
      .scheme(Scheme::HTTPS)
      .authority(host.as_str())
      .path_and_query(path.as_str())
      .build()
      .map_err(|e| Error::invalid_request(format!("cannot rewrite target: {}", e)))?;
    *request.uri_mut() = uri;
  }
  strip_hop_by_hop(request.headers_mut());
  Ok(())
}

fn relay_head(parts: &http::response::Parts) -> Response<()> {
  let mut head = Response::new(());
  *head.status_mut() = parts.status;
  *head.version_mut() = Version::HTTP_11;
  copy_headers(head.headers_mut(), &parts.headers);
  head
}

// Copies into `recorded` at most MAX_RECORDED_BODY bytes of what was relayed.
async fn relay<W>(
  client: &mut W,
  head: &Response<()>,
  framing: Framing,
  body: &mut Body,
  recorded: &mut Vec<u8>,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  client
    .write_all(&codec::encode_response_head(head, framing))
    .await?;
  client.flush().await?;
  while let Some(chunk) = body.chunk().await? {
    if chunk.is_empty() {
      continue;
    }
    let room = MAX_RECORDED_BODY.saturating_sub(recorded.len());
    recorded.extend_from_slice(&chunk[..chunk.len().min(room)]);
    client.write_all(&chunk).await?;
    client.flush().await?;
  }
  Ok(())
}

/// Plain-text error answer.
pub fn error_response(status: StatusCode, message: &str) -> Response<Bytes> {
  let mut response = Response::new(Bytes::from(format!("{}\n", message)));
  *response.status_mut() = status;
  response.headers_mut().insert(
    CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  response.headers_mut().insert(
    "x-content-type-options",
    HeaderValue::from_static("nosniff"),
  );
  response
}

fn connect_established() -> Vec<u8> {
  format!(
    "HTTP/1.1 200 Connection established\r\nProxy-Agent: {}\r\n\r\n",
    PROXY_AGENT
  )
  .into_bytes()
}
