//! Accepted client connections and bytes pushed back in front of them
use bytes::{Bytes, BytesMut};
use http::uri::Authority;
use std::io::Error;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A client connection that has not been classified yet.
///
/// Holds the raw TCP stream together with any bytes an HTTP layer already
/// pulled off it, so ownership can move between protocol terminators without
/// losing data. Reads drain the buffered prefix before touching the socket.
#[derive(Debug)]
pub struct PendingConnection {
  stream: TcpStream,
  prefix: Bytes,
  peer_addr: Option<SocketAddr>,
  tunnel: Option<Authority>,
}

impl PendingConnection {
  /// Wrap a freshly accepted stream.
  pub fn new(stream: TcpStream) -> Self {
    let peer_addr = stream.peer_addr().ok();
    Self {
      stream,
      prefix: Bytes::new(),
      peer_addr,
      tunnel: None,
    }
  }

  /// Push bytes back so they are returned by the next reads, ahead of
  /// anything still buffered.
  pub(crate) fn unread(mut self, bytes: &[u8]) -> Self {
    if bytes.is_empty() {
      return self;
    }
    let mut prefix = BytesMut::with_capacity(bytes.len() + self.prefix.len());
    prefix.extend_from_slice(bytes);
    prefix.extend_from_slice(&self.prefix);
    self.prefix = prefix.freeze();
    self
  }

  pub(crate) fn with_tunnel(mut self, target: Authority) -> Self {
    self.tunnel = Some(target);
    self
  }

  /// Address of the client, if the socket reported one.
  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.peer_addr
  }

  /// The `CONNECT` target this connection was tunneled to, if it was
  /// reinjected after a takeover.
  pub fn tunnel_target(&self) -> Option<&Authority> {
    self.tunnel.as_ref()
  }

  /// Bytes buffered ahead of the socket.
  pub fn buffered(&self) -> &[u8] {
    &self.prefix
  }

  /// Give up the wrapper, returning the socket and the unread prefix.
  pub fn into_inner(self) -> (TcpStream, Bytes) {
    (self.stream, self.prefix)
  }
}

impl AsyncRead for PendingConnection {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if !self.prefix.is_empty() {
      let n = std::cmp::min(buf.remaining(), self.prefix.len());
      let chunk = self.prefix.split_to(n);
      buf.put_slice(&chunk);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.stream).poll_read(cx, buf)
  }
}

impl AsyncWrite for PendingConnection {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.stream).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.stream).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.stream).poll_shutdown(cx)
  }
}
