//! Origin connections
use crate::codec::{self, BodyDecoder, BodyLength};
use crate::errors::{new_io_error, Error, Result};
use bytes::Bytes;
use http::{Method, Response};
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Outbound connection to an origin server, plain or TLS.
///
/// The write bound applies to a whole request. The read bound applies to the
/// response head, and then to every wait for more body bytes.
#[derive(Debug)]
pub struct Socket {
  stream: BufReader<MaybeTlsStream>,
  peer_addr: Option<SocketAddr>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

impl Socket {
  pub(crate) fn new(
    stream: TcpStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      peer_addr: stream.peer_addr().ok(),
      stream: BufReader::new(MaybeTlsStream::Tcp(stream)),
      read_timeout,
      write_timeout,
    }
  }

  /// Run `handshake` over the plain stream. A TLS socket is returned as is.
  pub(crate) async fn into_tls<F, Fut>(self, handshake: F) -> std::io::Result<Self>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = std::io::Result<TlsStream<TcpStream>>>,
  {
    let stream = match self.stream.into_inner() {
      MaybeTlsStream::Tcp(tcp) => MaybeTlsStream::Tls(Box::new(handshake(tcp).await?)),
      tls => tls,
    };
    Ok(Self {
      stream: BufReader::new(stream),
      peer_addr: self.peer_addr,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
    })
  }

  /// Address of the origin.
  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.peer_addr
  }

  /// Whether this connection is TLS protected.
  pub fn is_tls(&self) -> bool {
    matches!(self.stream.get_ref(), MaybeTlsStream::Tls(_))
  }

  /// Write a serialized request and flush it.
  pub async fn send(&mut self, raw: &[u8]) -> Result<()> {
    let limit = self.write_timeout;
    let stream = &mut self.stream;
    bounded(limit, "write", async move {
      stream.write_all(raw).await?;
      stream.flush().await?;
      Ok::<_, Error>(())
    })
    .await
  }

  /// Read the status line and headers answering a request sent with
  /// `method`. The body stays on the connection.
  pub(crate) async fn receive_head(
    &mut self,
    method: &Method,
  ) -> Result<(Response<()>, BodyLength)> {
    let limit = self.read_timeout;
    bounded(limit, "read", codec::read_response_head(&mut self.stream, method)).await
  }

  async fn read_chunk(&mut self, decoder: &mut BodyDecoder) -> Result<Option<Bytes>> {
    let limit = self.read_timeout;
    bounded(limit, "read", decoder.next_chunk(&mut self.stream)).await
  }

  // nothing read past the last response
  fn is_idle(&self) -> bool {
    self.stream.buffer().is_empty()
  }
}

pub(crate) type Release = Box<dyn FnOnce(Socket) + Send>;

/// A response body still on its origin connection.
///
/// Once the body is read to the end, the connection goes to `release`, if
/// any, provided the origin sent nothing past it.
pub(crate) struct IncomingBody {
  socket: Option<Socket>,
  decoder: BodyDecoder,
  release: Option<Release>,
}

impl IncomingBody {
  pub(crate) fn new(socket: Socket, length: BodyLength, release: Option<Release>) -> Self {
    Self {
      socket: Some(socket),
      decoder: BodyDecoder::new(length),
      release,
    }
  }

  pub(crate) fn exact_length(&self) -> Option<u64> {
    self.decoder.exact_length()
  }

  pub(crate) async fn chunk(&mut self) -> Result<Option<Bytes>> {
    let Some(socket) = self.socket.as_mut() else {
      return Ok(None);
    };
    let next = socket.read_chunk(&mut self.decoder).await;
    match next {
      Ok(Some(chunk)) => Ok(Some(chunk)),
      Ok(None) => {
        if let Some(socket) = self.socket.take() {
          if let Some(release) = self.release.take().filter(|_| socket.is_idle()) {
            release(socket);
          }
        }
        Ok(None)
      }
      Err(e) => {
        self.socket = None;
        Err(e)
      }
    }
  }
}

impl std::fmt::Debug for IncomingBody {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IncomingBody")
      .field("socket", &self.socket)
      .field("decoder", &self.decoder)
      .finish()
  }
}

async fn bounded<T, F>(limit: Option<Duration>, what: &str, fut: F) -> Result<T>
where
  F: Future<Output = Result<T>>,
{
  match limit {
    None => fut.await,
    Some(limit) => tokio::time::timeout(limit, fut)
      .await
      .map_err(|_| new_io_error(ErrorKind::TimedOut, &format!("origin {} timed out", what)))?,
  }
}

#[derive(Debug)]
enum MaybeTlsStream {
  Tcp(TcpStream),
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_flush(cx),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
      MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  async fn pair(read_timeout: Option<Duration>) -> (Socket, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (origin, _) = listener.accept().await.unwrap();
    (Socket::new(client, read_timeout, None), origin)
  }

  async fn drain(body: &mut IncomingBody) -> Vec<u8> {
    let mut all = Vec::new();
    while let Some(chunk) = body.chunk().await.unwrap() {
      all.extend_from_slice(&chunk);
    }
    all
  }

  #[tokio::test]
  async fn finished_body_releases_the_connection() {
    let (mut socket, mut origin) = pair(None).await;
    socket.send(b"GET / HTTP/1.1\r\nhost: a\r\n\r\n").await.unwrap();
    let mut head = [0u8; 27];
    origin.read_exact(&mut head).await.unwrap();
    origin
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
      .await
      .unwrap();
    let (response, length) = socket.receive_head(&Method::GET).await.unwrap();
    assert_eq!(response.status(), 200);

    let released = Arc::new(Mutex::new(None::<Socket>));
    let slot = released.clone();
    let mut body = IncomingBody::new(
      socket,
      length,
      Some(Box::new(move |s: Socket| *slot.lock().unwrap() = Some(s))),
    );
    assert_eq!(body.exact_length(), Some(2));
    assert_eq!(drain(&mut body).await, b"ok");
    assert!(released.lock().unwrap().is_some());
  }

  #[tokio::test]
  async fn close_delimited_body_reads_to_eof() {
    let (mut socket, mut origin) = pair(None).await;
    origin
      .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nbye")
      .await
      .unwrap();
    drop(origin);
    let (_, length) = socket.receive_head(&Method::GET).await.unwrap();
    assert_eq!(length, BodyLength::UntilClose);
    let mut body = IncomingBody::new(socket, length, None);
    assert_eq!(body.exact_length(), None);
    assert_eq!(drain(&mut body).await, b"bye");
  }

  #[tokio::test]
  async fn silent_origin_times_out() {
    let (mut socket, _origin) = pair(Some(Duration::from_millis(50))).await;
    let err = socket.receive_head(&Method::GET).await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
  }

  #[tokio::test]
  async fn slow_but_steady_body_outlives_the_read_timeout() {
    let (mut socket, mut origin) = pair(Some(Duration::from_millis(200))).await;
    tokio::spawn(async move {
      origin
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n")
        .await
        .unwrap();
      for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        origin.write_all(b"x").await.unwrap();
      }
    });
    let (_, length) = socket.receive_head(&Method::GET).await.unwrap();
    let mut body = IncomingBody::new(socket, length, None);
    assert_eq!(drain(&mut body).await, b"xxxxxxxxxx");
  }

  #[tokio::test]
  async fn stalled_body_times_out() {
    let (mut socket, mut origin) = pair(Some(Duration::from_millis(100))).await;
    origin
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
      .await
      .unwrap();
    let (_, length) = socket.receive_head(&Method::GET).await.unwrap();
    let mut body = IncomingBody::new(socket, length, None);
    assert_eq!(body.chunk().await.unwrap().unwrap().as_ref(), b"abc");
    assert!(body.chunk().await.is_err());
    drop(origin);
  }
}
