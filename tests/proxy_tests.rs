//! End to end tests: a real proxy between a real client and a local origin.

use bytes::Bytes;
use httptap::http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use httptap::{
  codec, Certificate, CertificateAuthority, Dispatcher, ExchangeRecord, MemoryLogger, MitmConfig,
  MitmProxy, RootAuthority, PROXY_AGENT,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const ROOT_CERT: &str = include_str!("fixtures/root_ca.pem");
const ROOT_KEY: &str = include_str!("fixtures/root_ca_key.pem");

fn authority() -> CertificateAuthority {
  CertificateAuthority::new(RootAuthority::from_pem(ROOT_CERT, ROOT_KEY).unwrap())
}

async fn start_proxy(logger: Arc<MemoryLogger>) -> SocketAddr {
  let root = RootAuthority::from_pem(ROOT_CERT, ROOT_KEY).unwrap();
  let config = MitmConfig {
    listen_addr: "127.0.0.1:0".to_string(),
    read_timeout: Some(Duration::from_secs(5)),
    upstream_root_certs: Certificate::from_pem_bundle(ROOT_CERT.as_bytes()).unwrap(),
    ..Default::default()
  };
  let proxy = MitmProxy::with_root(config, root)
    .unwrap()
    .with_logger(logger);
  let dispatcher = Dispatcher::listen("127.0.0.1:0").await.unwrap();
  let addr = dispatcher.local_addr().unwrap();
  tokio::spawn(proxy.serve(dispatcher));
  addr
}

/// Records once `count` exchanges have their response logged. The log entry
/// is written after the body went out, so the client may see it first.
async fn settled_records(logger: &MemoryLogger, count: usize) -> Vec<ExchangeRecord> {
  for _ in 0..200 {
    let records = logger.records();
    if records.len() >= count && records.iter().all(|r| r.status.is_some()) {
      return records;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  logger.records()
}

fn origin_response(body: &'static str) -> Response<Bytes> {
  let mut response = Response::new(Bytes::from_static(body.as_bytes()));
  let headers = response.headers_mut();
  headers.insert("x-origin", HeaderValue::from_static("yes"));
  headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
  headers.insert("connection", HeaderValue::from_static("x-secret"));
  headers.insert("x-secret", HeaderValue::from_static("hop"));
  response
}

/// Plain HTTP origin; reports the headers of every request it receives.
async fn start_http_origin() -> (SocketAddr, mpsc::UnboundedReceiver<HeaderMap>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let tx = tx.clone();
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        while let Ok(Some(request)) = codec::read_request(&mut reader).await {
          let _ = tx.send(request.headers().clone());
          let response = origin_response("hello over http");
          if codec::write_response(reader.get_mut(), &response).await.is_err() {
            break;
          }
        }
      });
    }
  });
  (addr, rx)
}

/// HTTPS origin presenting a certificate for `localhost` from the test root.
async fn start_https_origin() -> (SocketAddr, mpsc::UnboundedReceiver<HeaderMap>) {
  let config = authority().issue("localhost").unwrap().server_config().unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let tx = tx.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut reader = BufReader::new(tls);
        while let Ok(Some(request)) = codec::read_request(&mut reader).await {
          let _ = tx.send(request.headers().clone());
          let response = origin_response("hello over https");
          if codec::write_response(reader.get_mut(), &response).await.is_err() {
            break;
          }
        }
      });
    }
  });
  (addr, rx)
}

fn client_tls() -> TlsConnector {
  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut ROOT_CERT.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
  let config = ClientConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> String {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    reader.read_exact(&mut byte).await.unwrap();
    head.push(byte[0]);
  }
  String::from_utf8(head).unwrap()
}

async fn open_tunnel(proxy: SocketAddr, target: &str) -> TcpStream {
  let mut client = TcpStream::connect(proxy).await.unwrap();
  client
    .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target).as_bytes())
    .await
    .unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200 Connection established\r\n"));
  assert!(head.contains(&format!("Proxy-Agent: {}\r\n", PROXY_AGENT)));
  client
}

#[tokio::test]
async fn connect_tunnel_is_decrypted_and_forwarded() {
  let (origin, mut seen) = start_https_origin().await;
  let logger = Arc::new(MemoryLogger::new());
  let proxy = start_proxy(logger.clone()).await;
  let authority = format!("localhost:{}", origin.port());

  let mut client = open_tunnel(proxy, &authority).await;
  // nothing but the 200 precedes the TLS handshake
  let mut extra = [0u8; 1];
  assert!(
    tokio::time::timeout(Duration::from_millis(100), client.read(&mut extra))
      .await
      .is_err()
  );

  let server_name = ServerName::try_from("localhost").unwrap();
  let tls = client_tls().connect(server_name, client).await.unwrap();
  let mut tls = BufReader::new(tls);
  tls
    .get_mut()
    .write_all(
      format!(
        "GET /hello?x=1 HTTP/1.1\r\nHost: {}\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\nTE: trailers\r\n\r\n",
        authority
      )
      .as_bytes(),
    )
    .await
    .unwrap();
  let response = codec::read_response(&mut tls, &Method::GET).await.unwrap();

  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(response.body().as_ref(), b"hello over https");
  assert_eq!(response.headers()["x-origin"], "yes");
  assert!(!response.headers().contains_key("keep-alive"));
  assert!(!response.headers().contains_key("x-secret"));

  let upstream = seen.recv().await.unwrap();
  assert!(!upstream.contains_key("proxy-authorization"));
  assert!(!upstream.contains_key("te"));
  assert_eq!(upstream["host"], authority.as_str());

  let records = settled_records(&logger, 1).await;
  assert_eq!(records.len(), 1);
  assert_eq!(
    records[0].uri.to_string(),
    format!("https://{}/hello?x=1", authority)
  );
  assert_eq!(records[0].status, Some(StatusCode::OK));
}

#[tokio::test]
async fn tunnel_without_sni_gets_a_certificate_for_the_connect_host() {
  let logger = Arc::new(MemoryLogger::new());
  let proxy = start_proxy(logger).await;
  let client = open_tunnel(proxy, "127.0.0.1:443").await;

  // an IP server name makes the client omit SNI
  let server_name = ServerName::try_from("127.0.0.1").unwrap();
  let tls = client_tls().connect(server_name, client).await.unwrap();
  let (_, session) = tls.get_ref();
  let leaf = &session.peer_certificates().unwrap()[0];
  let (_, cert) = x509_parser::parse_x509_certificate(leaf).unwrap();
  let cn = cert.subject().iter_common_name().next().unwrap();
  assert_eq!(cn.as_str().unwrap(), "127.0.0.1");
}

#[tokio::test]
async fn plain_requests_are_forwarded_and_logged_in_pairs() {
  let (origin, mut seen) = start_http_origin().await;
  let logger = Arc::new(MemoryLogger::new());
  let proxy = start_proxy(logger.clone()).await;

  let mut client = BufReader::new(TcpStream::connect(proxy).await.unwrap());
  for path in ["/one", "/two"] {
    client
      .get_mut()
      .write_all(
        format!(
          "GET http://{0}{1} HTTP/1.1\r\nHost: {0}\r\nKeep-Alive: timeout=5\r\n\r\n",
          origin, path
        )
        .as_bytes(),
      )
      .await
      .unwrap();
    let response = codec::read_response(&mut client, &Method::GET).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"hello over http");
    assert!(!response.headers().contains_key("keep-alive"));
    let upstream = seen.recv().await.unwrap();
    assert!(!upstream.contains_key("keep-alive"));
  }

  let records = settled_records(&logger, 2).await;
  assert_eq!(records.len(), 2);
  assert_ne!(records[0].id, records[1].id);
  assert!(records.iter().all(|r| r.status == Some(StatusCode::OK)));
  assert_eq!(records[1].uri.path(), "/two");
}

#[tokio::test]
async fn open_ended_body_is_streamed_as_it_arrives() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin = listener.local_addr().unwrap();
  let (hang_up, hung_up) = tokio::sync::oneshot::channel::<()>();
  tokio::spawn(async move {
    let (stream, _) = listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);
    let _ = codec::read_request(&mut reader).await;
    reader
      .get_mut()
      .write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n9\r\ndata: 1\n\n\r\n",
      )
      .await
      .unwrap();
    // the feed stays open until the test is done
    let _ = hung_up.await;
  });
  let proxy = start_proxy(Arc::new(MemoryLogger::new())).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  client
    .write_all(format!("GET http://{0}/events HTTP/1.1\r\nHost: {0}\r\n\r\n", origin).as_bytes())
    .await
    .unwrap();
  let head = tokio::time::timeout(Duration::from_secs(2), read_head(&mut client))
    .await
    .unwrap();
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(head.contains("content-type: text/event-stream\r\n"));
  assert!(head.contains("connection: close\r\n"));
  assert!(!head.contains("transfer-encoding"));

  let mut first = [0u8; 9];
  tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut first))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&first, b"data: 1\n\n");
  drop(hang_up);
}

#[tokio::test]
async fn unreachable_origin_yields_503() {
  let closed = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let proxy = start_proxy(Arc::new(MemoryLogger::new())).await;
  let mut client = BufReader::new(TcpStream::connect(proxy).await.unwrap());
  client
    .get_mut()
    .write_all(format!("GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\n\r\n", closed).as_bytes())
    .await
    .unwrap();
  let response = codec::read_response(&mut client, &Method::GET).await.unwrap();
  assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
  assert_eq!(response.headers()["content-type"], "text/plain; charset=utf-8");
  assert!(!response.body().is_empty());
}

#[tokio::test]
async fn connect_inside_a_tunnel_cannot_be_hijacked() {
  let proxy = start_proxy(Arc::new(MemoryLogger::new())).await;
  let client = open_tunnel(proxy, "localhost:443").await;
  let server_name = ServerName::try_from("localhost").unwrap();
  let tls = client_tls().connect(server_name, client).await.unwrap();
  let mut tls = BufReader::new(tls);
  tls
    .get_mut()
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let response = codec::read_response(&mut tls, &Method::GET).await.unwrap();
  assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
  assert_eq!(response.body().as_ref(), b"Hijacking not supported.\n");
}
