//! Exchange recording
//!
//! Every forwarded request and its response are handed to an
//! [`ExchangeLogger`] under the same [`ExchangeId`]. Logging is observational:
//! a logger error is reported by the forwarder and otherwise ignored.
use crate::codec::{encode_request, encode_response};
use crate::errors::LogError;
use crate::id::ExchangeId;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use std::sync::Mutex;

/// Sink for intercepted traffic.
///
/// Implementations must be safe to call from many connections at once.
pub trait ExchangeLogger: Send + Sync {
  /// Called after the request was rewritten and sanitized, before it is sent.
  fn record_request(&self, id: &ExchangeId, request: &Request<Bytes>) -> Result<(), LogError>;
  /// Called once the origin's response was relayed to the client, or the
  /// relay failed. The body holds what was relayed, cut at
  /// [`MAX_RECORDED_BODY`](crate::MAX_RECORDED_BODY) bytes.
  fn record_response(&self, id: &ExchangeId, response: &Response<Bytes>)
    -> Result<(), LogError>;
}

/// Writes a one-line summary of every message through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl ExchangeLogger for TracingLogger {
  fn record_request(&self, id: &ExchangeId, request: &Request<Bytes>) -> Result<(), LogError> {
    tracing::info!(
      id = %id,
      method = %request.method(),
      uri = %request.uri(),
      bytes = request.body().len(),
      "request"
    );
    tracing::trace!(id = %id, raw = %Bytes::from(encode_request(request)).escape_ascii(), "request");
    Ok(())
  }

  fn record_response(
    &self,
    id: &ExchangeId,
    response: &Response<Bytes>,
  ) -> Result<(), LogError> {
    tracing::info!(
      id = %id,
      status = response.status().as_u16(),
      bytes = response.body().len(),
      "response"
    );
    tracing::trace!(id = %id, raw = %Bytes::from(encode_response(response)).escape_ascii(), "response");
    Ok(())
  }
}

/// One request/response pair captured by a [`MemoryLogger`].
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
  /// identifier shared by both halves
  pub id: ExchangeId,
  /// request method
  pub method: Method,
  /// absolute request target
  pub uri: Uri,
  /// request headers as sent upstream
  pub request_headers: HeaderMap,
  /// raw_request
  pub raw_request: Bytes,
  /// status, once the response arrived
  pub status: Option<StatusCode>,
  /// response headers as received
  pub response_headers: HeaderMap,
  /// response body
  pub response_body: Bytes,
}

/// Keeps every exchange in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryLogger {
  records: Mutex<Vec<ExchangeRecord>>,
}

impl MemoryLogger {
  /// Empty logger.
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of everything recorded so far.
  pub fn records(&self) -> Vec<ExchangeRecord> {
    self
      .records
      .lock()
      .map(|r| r.clone())
      .unwrap_or_else(|e| e.into_inner().clone())
  }
}

impl ExchangeLogger for MemoryLogger {
  fn record_request(&self, id: &ExchangeId, request: &Request<Bytes>) -> Result<(), LogError> {
    let mut records = self
      .records
      .lock()
      .map_err(|_| LogError("memory logger poisoned".to_string()))?;
    records.push(ExchangeRecord {
      id: *id,
      method: request.method().clone(),
      uri: request.uri().clone(),
      request_headers: request.headers().clone(),
      raw_request: Bytes::from(encode_request(request)),
      status: None,
      response_headers: HeaderMap::new(),
      response_body: Bytes::new(),
    });
    Ok(())
  }

  fn record_response(
    &self,
    id: &ExchangeId,
    response: &Response<Bytes>,
  ) -> Result<(), LogError> {
    let mut records = self
      .records
      .lock()
      .map_err(|_| LogError("memory logger poisoned".to_string()))?;
    let record = records
      .iter_mut()
      .rev()
      .find(|r| r.id == *id)
      .ok_or_else(|| LogError(format!("no request recorded for exchange {}", id)))?;
    record.status = Some(response.status());
    record.response_headers = response.headers().clone();
    record.response_body = response.body().clone();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn response_is_paired_with_its_request() {
    let logger = MemoryLogger::new();
    let id = ExchangeId::from(42);
    let req = Request::builder()
      .uri("https://example.com/")
      .body(Bytes::new())
      .unwrap();
    logger.record_request(&id, &req).unwrap();
    let resp = Response::builder()
      .status(StatusCode::IM_A_TEAPOT)
      .body(Bytes::from_static(b"short and stout"))
      .unwrap();
    logger.record_response(&id, &resp).unwrap();

    let records = logger.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Some(StatusCode::IM_A_TEAPOT));
    assert_eq!(records[0].response_body.as_ref(), b"short and stout");
    assert!(records[0].raw_request.starts_with(b"GET / HTTP/1.1\r\n"));
  }

  #[test]
  fn unknown_response_is_an_error() {
    let logger = MemoryLogger::new();
    let resp = Response::builder().body(Bytes::new()).unwrap();
    assert!(logger.record_response(&ExchangeId::from(1), &resp).is_err());
  }
}
