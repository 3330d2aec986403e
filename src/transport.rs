//! Outbound round trips
//!
//! A [`Transport`] takes an absolute-form request and returns the origin's
//! response head with a body that streams from the origin. [`HttpTransport`]
//! keeps idle keep-alive connections per origin; [`RetryTransport`] wraps any
//! transport with a bounded retry policy.
use crate::body::Body;
use crate::codec::{self, BodyLength};
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::socket::{IncomingBody, Release, Socket};
use bytes::Bytes;
use http::{Method, Request, Response};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Performs one HTTP exchange with an origin server.
pub trait Transport: Send + Sync + 'static {
  /// Send `request` (absolute URI) and wait for the response head. The body
  /// is read from the returned [`Body`].
  fn round_trip(
    &self,
    request: Request<Bytes>,
  ) -> impl Future<Output = Result<Response<Body>>> + Send;
}

const MAX_IDLE_PER_HOST: usize = 8;

struct Pool {
  idle: Mutex<HashMap<String, Vec<Socket>>>,
  max_idle_per_host: usize,
}

impl Pool {
  fn checkout(&self, key: &str) -> Option<Socket> {
    let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
    idle.get_mut(key).and_then(|sockets| sockets.pop())
  }

  fn checkin(&self, key: String, socket: Socket) {
    if self.max_idle_per_host == 0 {
      return;
    }
    let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
    let sockets = idle.entry(key).or_default();
    if sockets.len() < self.max_idle_per_host {
      sockets.push(socket);
    }
  }

  #[cfg(test)]
  fn idle_count(&self, key: &str) -> usize {
    let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
    idle.get(key).map_or(0, Vec::len)
  }
}

/// HTTP/1.1 transport over plain TCP or TLS, with per-origin connection reuse.
///
/// A connection returns to the pool once its response body was read to the
/// end.
pub struct HttpTransport {
  connector: Connector,
  pool: Arc<Pool>,
}

impl HttpTransport {
  /// Transport on top of `connector`.
  pub fn new(connector: Connector) -> Self {
    Self {
      connector,
      pool: Arc::new(Pool {
        idle: Mutex::new(HashMap::new()),
        max_idle_per_host: MAX_IDLE_PER_HOST,
      }),
    }
  }

  /// Limit on idle connections kept per origin. `0` disables reuse.
  pub fn max_idle_per_host(mut self, max: usize) -> Self {
    self.pool = Arc::new(Pool {
      idle: Mutex::new(HashMap::new()),
      max_idle_per_host: max,
    });
    self
  }

  async fn exchange(
    &self,
    mut socket: Socket,
    key: &str,
    raw: &[u8],
    method: &Method,
  ) -> Result<Response<Body>> {
    socket.send(raw).await?;
    let (head, length) = socket.receive_head(method).await?;
    let reusable =
      codec::keep_alive(head.version(), head.headers()) && length != BodyLength::UntilClose;
    let release: Option<Release> = reusable.then(|| {
      let pool = self.pool.clone();
      let key = key.to_string();
      Box::new(move |socket: Socket| pool.checkin(key, socket)) as Release
    });
    let body = Body::incoming(IncomingBody::new(socket, length, release));
    Ok(head.map(|()| body))
  }

  async fn send(&self, request: Request<Bytes>) -> Result<Response<Body>> {
    let uri = request.uri().clone();
    let key = uniq_key(&uri)?;
    let method = request.method().clone();
    let raw = codec::encode_request(&request);

    if let Some(socket) = self.pool.checkout(&key) {
      match self.exchange(socket, &key, &raw, &method).await {
        Ok(response) => return Ok(response),
        // a pooled connection may have been closed by the origin meanwhile
        Err(e) if is_idempotent(&method) => {
          tracing::debug!("[httptap] stale connection to {}: {}", key, e);
        }
        Err(e) => return Err(e),
      }
    }

    let socket = self.connector.connect_with_uri(&uri).await?;
    self.exchange(socket, &key, &raw, &method).await
  }
}

impl Transport for HttpTransport {
  async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Body>> {
    let target = format!("{} {}", request.method(), request.uri());
    self.send(request).await.map_err(|e| match e {
      Error::Forward(_) => e,
      other => Error::forward(format!("{}: {}", target, other)),
    })
  }
}

fn uniq_key(uri: &http::Uri) -> Result<String> {
  let scheme = uri
    .scheme_str()
    .ok_or_else(|| Error::forward(format!("URL is not absolute: {}", uri)))?;
  let host = uri
    .host()
    .ok_or_else(|| Error::forward(format!("no host in URL: {}", uri)))?;
  let port = uri
    .port_u16()
    .unwrap_or(if scheme == "https" { 443 } else { 80 });
  Ok(format!("{}://{}:{}", scheme, host, port))
}

fn is_idempotent(method: &Method) -> bool {
  matches!(
    *method,
    Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
  )
}

fn clone_request(request: &Request<Bytes>) -> Result<Request<Bytes>> {
  let mut builder = Request::builder()
    .method(request.method().clone())
    .uri(request.uri().clone())
    .version(request.version());
  if let Some(h) = builder.headers_mut() {
    *h = request.headers().clone();
  }
  Ok(builder.body(request.body().clone())?)
}

/// Retries failed idempotent round trips a bounded number of times.
///
/// With `max_retries == 0` every request is attempted exactly once.
pub struct RetryTransport<T> {
  inner: T,
  max_retries: usize,
  backoff: Duration,
}

impl<T: Transport> RetryTransport<T> {
  /// Wrap `inner`, allowing up to `max_retries` extra attempts.
  pub fn new(inner: T, max_retries: usize) -> Self {
    Self {
      inner,
      max_retries,
      backoff: Duration::from_millis(100),
    }
  }

  /// Pause between attempts. Default is 100ms.
  pub fn backoff(mut self, backoff: Duration) -> Self {
    self.backoff = backoff;
    self
  }
}

impl<T: Transport> Transport for RetryTransport<T> {
  async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Body>> {
    if self.max_retries == 0 || !is_idempotent(request.method()) {
      return self.inner.round_trip(request).await;
    }
    let mut attempt = 0;
    loop {
      let result = self.inner.round_trip(clone_request(&request)?).await;
      match result {
        Err(e) if attempt < self.max_retries => {
          attempt += 1;
          tracing::debug!(
            "[httptap] retrying {} ({}/{}) after: {}",
            request.uri(),
            attempt,
            self.max_retries,
            e
          );
          tokio::time::sleep(self.backoff).await;
        }
        result => return result,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Flaky {
    failures: usize,
    calls: AtomicUsize,
  }

  impl Transport for Flaky {
    async fn round_trip(&self, _request: Request<Bytes>) -> Result<Response<Body>> {
      let call = self.calls.fetch_add(1, Ordering::SeqCst);
      if call < self.failures {
        Err(Error::Forward("connection refused".to_string()))
      } else {
        Ok(Response::new(Body::from("ok")))
      }
    }
  }

  fn get() -> Request<Bytes> {
    Request::builder()
      .uri("http://example.com/")
      .body(Bytes::new())
      .unwrap()
  }

  #[tokio::test]
  async fn no_retries_by_default() {
    let flaky = Flaky {
      failures: 1,
      calls: AtomicUsize::new(0),
    };
    let transport = RetryTransport::new(flaky, 0);
    assert!(transport.round_trip(get()).await.is_err());
    assert_eq!(transport.inner.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn retries_are_bounded() {
    let flaky = Flaky {
      failures: 5,
      calls: AtomicUsize::new(0),
    };
    let transport = RetryTransport::new(flaky, 2).backoff(Duration::ZERO);
    assert!(transport.round_trip(get()).await.is_err());
    assert_eq!(transport.inner.calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn retry_recovers_from_transient_failure() {
    let flaky = Flaky {
      failures: 1,
      calls: AtomicUsize::new(0),
    };
    let transport = RetryTransport::new(flaky, 1).backoff(Duration::ZERO);
    let resp = transport.round_trip(get()).await.unwrap();
    assert_eq!(resp.into_body().collect().await.unwrap().as_ref(), b"ok");
  }

  #[tokio::test]
  async fn post_is_never_retried() {
    let flaky = Flaky {
      failures: 1,
      calls: AtomicUsize::new(0),
    };
    let transport = RetryTransport::new(flaky, 3).backoff(Duration::ZERO);
    let mut post = get();
    *post.method_mut() = Method::POST;
    assert!(transport.round_trip(post).await.is_err());
    assert_eq!(transport.inner.calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn pool_key_includes_default_port() {
    let uri: http::Uri = "https://example.com/a".parse().unwrap();
    assert_eq!(uniq_key(&uri).unwrap(), "https://example.com:443");
    let relative: http::Uri = "/a".parse().unwrap();
    assert!(uniq_key(&relative).is_err());
  }

  async fn one_shot_origin(reply: &'static [u8]) -> std::net::SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut conn, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 1024];
      let _ = conn.read(&mut buf).await.unwrap();
      conn.write_all(reply).await.unwrap();
      // hold the connection so a pooled socket stays usable
      let _ = conn.read(&mut buf).await;
    });
    addr
  }

  fn http_transport() -> HttpTransport {
    HttpTransport::new(Connector::builder().build().unwrap())
  }

  #[tokio::test]
  async fn connection_is_pooled_after_the_body_is_read() {
    let addr = one_shot_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
    let transport = http_transport();
    let uri: http::Uri = format!("http://{}/", addr).parse().unwrap();
    let key = uniq_key(&uri).unwrap();
    let request = Request::builder().uri(uri).body(Bytes::new()).unwrap();

    let response = transport.round_trip(request).await.unwrap();
    assert_eq!(transport.pool.idle_count(&key), 0);
    assert_eq!(response.into_body().collect().await.unwrap().as_ref(), b"hi");
    assert_eq!(transport.pool.idle_count(&key), 1);
  }

  #[tokio::test]
  async fn close_delimited_response_is_not_pooled() {
    let addr = one_shot_origin(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nhi").await;
    let transport = http_transport();
    let uri: http::Uri = format!("http://{}/", addr).parse().unwrap();
    let key = uniq_key(&uri).unwrap();
    let request = Request::builder().uri(uri).body(Bytes::new()).unwrap();

    let mut body = transport.round_trip(request).await.unwrap().into_body();
    assert_eq!(body.chunk().await.unwrap().unwrap().as_ref(), b"hi");
    assert_eq!(transport.pool.idle_count(&key), 0);
  }
}
