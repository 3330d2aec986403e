//! Response bodies relayed from origins
use crate::errors::Result;
use crate::socket::IncomingBody;
use bytes::{Bytes, BytesMut};
use std::fmt;

/// A response body, either already in memory or still arriving from the
/// origin.
///
/// An incoming body is read with [`Body::chunk`] as the origin sends it.
pub struct Body {
  inner: Inner,
}

enum Inner {
  Full(Bytes),
  Incoming(Box<IncomingBody>),
}

impl Body {
  /// A body with no bytes.
  pub fn empty() -> Body {
    Body::default()
  }

  pub(crate) fn incoming(body: IncomingBody) -> Body {
    Body {
      inner: Inner::Incoming(Box::new(body)),
    }
  }

  /// Total size, when known before reading.
  pub fn exact_length(&self) -> Option<u64> {
    match &self.inner {
      Inner::Full(bytes) => Some(bytes.len() as u64),
      Inner::Incoming(body) => body.exact_length(),
    }
  }

  /// The next piece of the body, `None` once it is exhausted.
  pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
    match &mut self.inner {
      Inner::Full(bytes) if bytes.is_empty() => Ok(None),
      Inner::Full(bytes) => Ok(Some(std::mem::take(bytes))),
      Inner::Incoming(body) => body.chunk().await,
    }
  }

  /// Read the rest of the body into memory.
  pub async fn collect(self) -> Result<Bytes> {
    let mut body = match self.inner {
      Inner::Full(bytes) => return Ok(bytes),
      Inner::Incoming(body) => body,
    };
    let mut all = BytesMut::new();
    while let Some(chunk) = body.chunk().await? {
      all.extend_from_slice(&chunk);
    }
    Ok(all.freeze())
  }
}

impl Default for Body {
  fn default() -> Self {
    Body {
      inner: Inner::Full(Bytes::new()),
    }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.inner {
      Inner::Full(bytes) => f.debug_tuple("Body").field(bytes).finish(),
      Inner::Incoming(body) => f.debug_tuple("Body").field(body).finish(),
    }
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body {
      inner: Inner::Full(b),
    }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    Bytes::from(s).into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Bytes::from_static(s.as_bytes()).into()
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Bytes::from(v).into()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn full_body_is_one_chunk() {
    let mut body = Body::from("hello");
    assert_eq!(body.exact_length(), Some(5));
    assert_eq!(body.chunk().await.unwrap().unwrap().as_ref(), b"hello");
    assert!(body.chunk().await.unwrap().is_none());
  }

  #[tokio::test]
  async fn empty_body_has_no_chunks() {
    let mut body = Body::empty();
    assert_eq!(body.exact_length(), Some(0));
    assert!(body.chunk().await.unwrap().is_none());
    assert!(Body::default().collect().await.unwrap().is_empty());
  }
}
