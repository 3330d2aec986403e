//! HTTP/1.x message framing
//!
//! Reads requests off client connections and responses off origin
//! connections into fully buffered [`http::Request`]/[`http::Response`]
//! values, and writes them back with exact `Content-Length` framing.
use crate::errors::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a request or status line plus all header lines.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// How the length of a message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
  Empty,
  Chunked,
  Length(u64),
  UntilClose,
}

/// Read one request from a client connection.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before
/// sending anything. Malformed input is reported as
/// [`Error::InvalidRequest`].
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request<Bytes>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let mut budget = MAX_HEAD_SIZE;
  loop {
    line.clear();
    let length = read_line(reader, &mut line, budget).await?;
    if length == 0 {
      return Ok(None);
    }
    budget -= length;
    // leading empty lines are tolerated
    if line != CR_LF && line != b"\n" {
      break;
    }
  }
  let (method, target, version) = parser_request_line(&line)?;
  let headers = read_headers(reader, budget).await?;
  let body = read_body(reader, request_body_length(&method, &headers)?)
    .await
    .map_err(malformed_request)?;
  let mut builder = Request::builder()
    .method(method)
    .uri(target)
    .version(version);
  if let Some(h) = builder.headers_mut() {
    *h = headers;
  }
  Ok(Some(
    builder
      .body(body)
      .map_err(|e| Error::invalid_request(e.to_string()))?,
  ))
}

/// Read one response from an origin connection.
///
/// `method` is the method of the request this response answers; it decides
/// whether a body follows at all.
pub async fn read_response<R>(reader: &mut R, method: &Method) -> Result<Response<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  let (head, length) = read_response_head(reader, method).await?;
  let body = read_body(reader, length).await?;
  Ok(head.map(|()| body))
}

/// Read a status line and headers, leaving the body on `reader`.
pub(crate) async fn read_response_head<R>(
  reader: &mut R,
  method: &Method,
) -> Result<(Response<()>, BodyLength)>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let mut budget = MAX_HEAD_SIZE;
  let (version, status, headers) = loop {
    line.clear();
    let length = read_line(reader, &mut line, budget).await?;
    if length == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed before response",
      ));
    }
    budget -= length;
    let (version, status) = parser_status_line(&line)?;
    let headers = read_headers(reader, budget).await?;
    // interim responses are consumed, the final one is returned
    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
      continue;
    }
    break (version, status, headers);
  };
  let length = response_body_length(method, status, &headers);
  let mut builder = Response::builder().version(version).status(status);
  if let Some(h) = builder.headers_mut() {
    *h = headers;
  }
  Ok((builder.body(())?, length))
}

/// Serialize a request in origin form, adding `Host` when missing.
pub fn encode_request(request: &Request<Bytes>) -> Vec<u8> {
  let mut raw = Vec::new();
  raw.extend(request.method().as_str().as_bytes());
  raw.extend(SPACE);
  let target = request
    .uri()
    .path_and_query()
    .map(|p| p.as_str())
    .filter(|p| !p.is_empty())
    .unwrap_or("/");
  raw.extend(target.as_bytes());
  raw.extend(SPACE);
  raw.extend(b"HTTP/1.1");
  raw.extend(CR_LF);
  if request.headers().get(HOST).is_none() {
    if let Some(authority) = request.uri().authority() {
      push_header(&mut raw, &HOST, authority.as_str().as_bytes());
    }
  }
  for (k, v) in request.headers().iter() {
    if k == CONTENT_LENGTH || k == TRANSFER_ENCODING {
      continue;
    }
    push_header(&mut raw, k, v.as_bytes());
  }
  let body = request.body();
  if !body.is_empty()
    || matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH)
  {
    push_header(&mut raw, &CONTENT_LENGTH, body.len().to_string().as_bytes());
  }
  raw.extend(CR_LF);
  raw.extend(body);
  raw
}

/// Serialize a response as HTTP/1.1.
///
/// A non-empty body always gets an exact `Content-Length`. An empty body
/// keeps the origin's `Content-Length` (a `HEAD` answer), or gets `0` when the
/// status allows a body.
pub fn encode_response(response: &Response<Bytes>) -> Vec<u8> {
  let body = response.body();
  let mut raw = encode_response_head(response, Framing::Length(body.len() as u64));
  raw.extend(body);
  raw
}

/// How a relayed body is delimited on the client connection. A relayed
/// response never carries `Transfer-Encoding`, so a body of unknown length
/// ends with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
  Length(u64),
  Close,
}

pub(crate) fn encode_response_head<B>(response: &Response<B>, framing: Framing) -> Vec<u8> {
  let status = response.status();
  let mut raw = Vec::new();
  raw.extend(b"HTTP/1.1");
  raw.extend(SPACE);
  raw.extend(status.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(status.canonical_reason().unwrap_or("Unknown").as_bytes());
  raw.extend(CR_LF);
  for (k, v) in response.headers().iter() {
    let skip = match framing {
      Framing::Length(0) => k == TRANSFER_ENCODING,
      Framing::Length(_) => k == TRANSFER_ENCODING || k == CONTENT_LENGTH,
      Framing::Close => k == TRANSFER_ENCODING || k == CONTENT_LENGTH || k == CONNECTION,
    };
    if !skip {
      push_header(&mut raw, k, v.as_bytes());
    }
  }
  match framing {
    Framing::Length(0) => {
      if !response.headers().contains_key(CONTENT_LENGTH) && status_allows_body(status) {
        push_header(&mut raw, &CONTENT_LENGTH, b"0");
      }
    }
    Framing::Length(length) => {
      push_header(&mut raw, &CONTENT_LENGTH, length.to_string().as_bytes());
    }
    Framing::Close => push_header(&mut raw, &CONNECTION, b"close"),
  }
  raw.extend(CR_LF);
  raw
}

/// Write a request and flush.
pub async fn write_request<W>(writer: &mut W, request: &Request<Bytes>) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(&encode_request(request)).await?;
  writer.flush().await?;
  Ok(())
}

/// Write a response and flush.
pub async fn write_response<W>(writer: &mut W, response: &Response<Bytes>) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(&encode_response(response)).await?;
  writer.flush().await?;
  Ok(())
}

/// Whether the connection stays open after this message.
pub fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
  let mut close = false;
  let mut keep = false;
  for value in headers.get_all(CONNECTION) {
    for token in value.to_str().unwrap_or_default().split(',') {
      let token = token.trim();
      close |= token.eq_ignore_ascii_case("close");
      keep |= token.eq_ignore_ascii_case("keep-alive");
    }
  }
  if close {
    return false;
  }
  version >= Version::HTTP_11 || keep
}

pub(crate) fn request_body_length(method: &Method, headers: &HeaderMap) -> Result<BodyLength> {
  if method == Method::CONNECT {
    return Ok(BodyLength::Empty);
  }
  if let Some(te) = headers.get(TRANSFER_ENCODING) {
    return if is_chunked(te) {
      Ok(BodyLength::Chunked)
    } else {
      Err(Error::invalid_request("unsupported transfer-encoding"))
    };
  }
  match content_length(headers) {
    Some(Ok(0)) | None => Ok(BodyLength::Empty),
    Some(Ok(length)) => Ok(BodyLength::Length(length)),
    Some(Err(e)) => Err(e),
  }
}

pub(crate) fn response_body_length(
  method: &Method,
  status: StatusCode,
  headers: &HeaderMap,
) -> BodyLength {
  if method == Method::HEAD
    || !status_allows_body(status)
    || (method == Method::CONNECT && status.is_success())
  {
    return BodyLength::Empty;
  }
  if headers.get(TRANSFER_ENCODING).is_some_and(is_chunked) {
    return BodyLength::Chunked;
  }
  match content_length(headers) {
    Some(Ok(0)) => BodyLength::Empty,
    Some(Ok(length)) => BodyLength::Length(length),
    _ => BodyLength::UntilClose,
  }
}

fn status_allows_body(status: StatusCode) -> bool {
  !(status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED)
}

fn is_chunked(value: &HeaderValue) -> bool {
  value
    .to_str()
    .ok()
    .and_then(|v| v.rsplit(',').next())
    .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Option<Result<u64>> {
  let mut lengths = headers.get_all(CONTENT_LENGTH).iter();
  let first = lengths.next()?;
  let parse = |v: &HeaderValue| -> Result<u64> {
    v.to_str()
      .ok()
      .and_then(|s| s.trim().parse::<u64>().ok())
      .ok_or_else(|| Error::invalid_request("invalid content-length"))
  };
  let length = match parse(first) {
    Ok(length) => length,
    Err(e) => return Some(Err(e)),
  };
  for other in lengths {
    if parse(other).ok() != Some(length) {
      return Some(Err(Error::invalid_request("conflicting content-length")));
    }
  }
  Some(Ok(length))
}

fn push_header(raw: &mut Vec<u8>, name: &HeaderName, value: &[u8]) {
  raw.extend(name.as_str().as_bytes());
  raw.extend(COLON_SPACE);
  raw.extend(value);
  raw.extend(CR_LF);
}

/// Read up to and including `\n`, never more than `limit` bytes.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, limit: usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let length = (&mut *reader)
    .take(limit as u64)
    .read_until(b'\n', line)
    .await?;
  if length > 0 && !line.ends_with(b"\n") {
    return Err(if length >= limit {
      Error::invalid_request("message head too large")
    } else {
      new_io_error(ErrorKind::UnexpectedEof, "connection closed mid-line")
    });
  }
  Ok(length)
}

async fn read_headers<R>(reader: &mut R, mut budget: usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let length = read_line(reader, &mut header_line, budget).await?;
    if length == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside message head",
      ));
    }
    budget -= length;
    if header_line == CR_LF || header_line == b"\n" {
      break;
    }
    let (k, v) = parser_headers(&header_line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

async fn read_body<R>(reader: &mut R, length: BodyLength) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut decoder = BodyDecoder::new(length);
  let mut body = Vec::new();
  while let Some(chunk) = decoder.next_chunk(reader).await? {
    body.extend_from_slice(&chunk);
  }
  Ok(Bytes::from(body))
}

// malformed bodies are the client's fault on the request side
fn malformed_request(error: Error) -> Error {
  match error {
    Error::IO(e) if e.kind() == ErrorKind::InvalidData => Error::invalid_request(e.to_string()),
    error => error,
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
  Length(u64),
  ChunkSize,
  ChunkData(u64),
  ChunkEnd,
  UntilClose,
  Done,
}

/// Incremental body reader.
///
/// Yields the body as it arrives, never holding more than what the
/// underlying reader buffered. Malformed framing is reported as an
/// `InvalidData` I/O error.
#[derive(Debug)]
pub(crate) struct BodyDecoder {
  state: DecodeState,
}

impl BodyDecoder {
  pub(crate) fn new(length: BodyLength) -> Self {
    let state = match length {
      BodyLength::Empty | BodyLength::Length(0) => DecodeState::Done,
      BodyLength::Length(length) => DecodeState::Length(length),
      BodyLength::Chunked => DecodeState::ChunkSize,
      BodyLength::UntilClose => DecodeState::UntilClose,
    };
    Self { state }
  }

  /// Bytes still to come when the framing says so up front.
  pub(crate) fn exact_length(&self) -> Option<u64> {
    match self.state {
      DecodeState::Done => Some(0),
      DecodeState::Length(length) => Some(length),
      _ => None,
    }
  }

  /// Next piece of the body, `None` once it is complete.
  pub(crate) async fn next_chunk<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
  where
    R: AsyncBufRead + Unpin,
  {
    loop {
      match self.state {
        DecodeState::Done => return Ok(None),
        DecodeState::UntilClose => {
          let chunk = take_available(reader, u64::MAX).await?;
          if chunk.is_empty() {
            self.state = DecodeState::Done;
            return Ok(None);
          }
          return Ok(Some(chunk));
        }
        DecodeState::Length(remaining) => {
          let chunk = take_available(reader, remaining).await?;
          if chunk.is_empty() {
            return Err(new_io_error(
              ErrorKind::UnexpectedEof,
              "connection closed before end of body",
            ));
          }
          let left = remaining - chunk.len() as u64;
          self.state = if left == 0 {
            DecodeState::Done
          } else {
            DecodeState::Length(left)
          };
          return Ok(Some(chunk));
        }
        DecodeState::ChunkSize => {
          let size = read_chunk_size(reader).await?;
          if size == 0 {
            skip_trailers(reader).await?;
            self.state = DecodeState::Done;
          } else {
            self.state = DecodeState::ChunkData(size);
          }
        }
        DecodeState::ChunkData(remaining) => {
          let chunk = take_available(reader, remaining).await?;
          if chunk.is_empty() {
            return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
          }
          let left = remaining - chunk.len() as u64;
          self.state = if left == 0 {
            DecodeState::ChunkEnd
          } else {
            DecodeState::ChunkData(left)
          };
          return Ok(Some(chunk));
        }
        DecodeState::ChunkEnd => {
          read_chunk_terminator(reader).await?;
          self.state = DecodeState::ChunkSize;
        }
      }
    }
  }
}

// Whatever is buffered, up to `limit` bytes. Empty only at end of stream.
async fn take_available<R>(reader: &mut R, limit: u64) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let available = reader.fill_buf().await?;
  let n = usize::try_from(limit).map_or(available.len(), |limit| limit.min(available.len()));
  let chunk = Bytes::copy_from_slice(&available[..n]);
  reader.consume(n);
  Ok(chunk)
}

async fn read_chunk_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  line.clear();
  read_line(reader, line, MAX_CHUNK_LINE)
    .await
    .map_err(|e| match e {
      Error::InvalidRequest(msg) => new_io_error(ErrorKind::InvalidData, &msg),
      e => e,
    })
}

async fn read_chunk_size<R>(reader: &mut R) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  if read_chunk_line(reader, &mut line).await? == 0 {
    return Err(new_io_error(ErrorKind::UnexpectedEof, "truncated chunked body"));
  }
  std::str::from_utf8(trim_line_end(&line))
    .ok()
    .map(|l| l.split(';').next().unwrap_or_default().trim())
    .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit()))
    .and_then(|s| u64::from_str_radix(s, 16).ok())
    .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid chunk size"))
}

async fn read_chunk_terminator<R>(reader: &mut R) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  read_chunk_line(reader, &mut line).await?;
  if line != CR_LF && line != b"\n" {
    return Err(new_io_error(ErrorKind::InvalidData, "missing chunk terminator"));
  }
  Ok(())
}

// trailer section, discarded
async fn skip_trailers<R>(reader: &mut R) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  loop {
    let length = read_chunk_line(reader, &mut line).await?;
    if length == 0 || line == CR_LF || line == b"\n" {
      return Ok(());
    }
  }
}

fn parser_version(v: &[u8]) -> Result<Version> {
  match v {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::invalid_request("invalid http version")),
  }
}

fn parser_request_line(line: &[u8]) -> Result<(Method, http::Uri, Version)> {
  let line = trim_line_end(line);
  let mut parts = line.split(|b| b == &b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version), None) =
    (parts.next(), parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::invalid_request("invalid request line"));
  };
  let method =
    Method::from_bytes(method).map_err(|_| Error::invalid_request("invalid method"))?;
  let target = http::Uri::try_from(target)
    .map_err(|_| Error::invalid_request("invalid request target"))?;
  Ok((method, target, parser_version(version)?))
}

fn parser_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
  let line = trim_line_end(line);
  let mut parts = line.splitn(3, |b| b == &b' ');
  let version = parts
    .next()
    .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid status line"))?;
  let version = parser_version(version)
    .map_err(|_| new_io_error(ErrorKind::InvalidData, "invalid http version"))?;
  let status = parts
    .next()
    .and_then(|s| StatusCode::from_bytes(s).ok())
    .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid status code"))?;
  Ok((version, status))
}

fn trim_line_end(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let buffer = trim_line_end(buffer);
  let mut split = buffer.splitn(2, |s| s == &b':');
  let (Some(k), Some(v)) = (split.next(), split.next()) else {
    return Err(Error::invalid_request("header line without colon"));
  };
  let k = HeaderName::from_bytes(k).map_err(|_| Error::invalid_request("invalid header name"))?;
  let v = HeaderValue::from_bytes(v.trim_ascii())
    .map_err(|_| Error::invalid_request("invalid header value"))?;
  Ok((k, v))
}
