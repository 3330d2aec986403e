//! Hop-by-hop header handling
use http::header::CONNECTION;
use http::{HeaderMap, HeaderName};

/// Headers that describe a single transport hop and are never relayed.
pub const HOP_BY_HOP_HEADERS: [&str; 6] = [
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailers",
  "transfer-encoding",
];

/// Whether `name` is one of the fixed [`HOP_BY_HOP_HEADERS`].
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
  HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

// header names listed as tokens in `Connection`
fn connection_listed(headers: &HeaderMap) -> Vec<HeaderName> {
  headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
    .collect()
}

/// Append every end-to-end header of `src` to `dst`.
///
/// Repeated headers keep every value in order. Hop-by-hop headers are
/// skipped, and so is any header `src` names in its `Connection` header.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
  let listed = connection_listed(src);
  for (name, value) in src.iter() {
    if is_hop_by_hop(name) || listed.contains(name) {
      continue;
    }
    dst.append(name.clone(), value.clone());
  }
}

/// Remove hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed = connection_listed(headers);
  for name in HOP_BY_HOP_HEADERS {
    headers.remove(name);
  }
  for name in listed {
    headers.remove(&name);
  }
}
