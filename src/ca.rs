//! Certificate Authority (CA) management for MITM proxy
//!
//! This module loads the trusted root authority and forges a fresh leaf
//! certificate, signed by that root, for every intercepted TLS handshake.
//!

use crate::errors::{Error, Result};
use rcgen::{
  CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair, SanType,
  SignatureAlgorithm,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::ServerConfig;

/// Organization written into the subject of every issued leaf certificate.
pub const ORGANIZATION: &str = "httptap";
/// Leaf validity period in days
const TTL_DAYS: i64 = 365;
/// Offset for not_before to tolerate clock skew between client and proxy (48 hours)
const NOT_BEFORE_OFFSET_HOURS: i64 = 48;

const RSA_ALGORITHMS: [&SignatureAlgorithm; 3] = [
  &rcgen::PKCS_RSA_SHA256,
  &rcgen::PKCS_RSA_SHA384,
  &rcgen::PKCS_RSA_SHA512,
];

static LAST_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Trusted root certificate and the RSA key that signs every leaf.
///
/// Loaded once at startup and only read afterwards, so a single instance can
/// serve any number of concurrent issuances.
pub struct RootAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  cert_der: CertificateDer<'static>,
}

impl RootAuthority {
  /// Load a PEM encoded certificate and a PEM encoded PKCS#8 RSA private key.
  pub async fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let cert_pem = fs::read_to_string(cert_path)
      .await
      .map_err(|e| Error::root_load(format!("cannot read {}: {}", cert_path.display(), e)))?;
    let key_pem = fs::read_to_string(key_path)
      .await
      .map_err(|e| Error::root_load(format!("cannot read {}: {}", key_path.display(), e)))?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Build a root authority from in-memory PEM material.
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::root_load("no certificate found in PEM"))?
      .map_err(|e| Error::root_load(format!("failed to decode certificate PEM: {}", e)))?;

    let key_der = match rustls_pemfile::read_one(&mut key_pem.as_bytes())
      .map_err(|e| Error::root_load(format!("failed to decode key PEM: {}", e)))?
    {
      Some(rustls_pemfile::Item::Pkcs8Key(key)) => key,
      Some(_) => return Err(Error::root_load("private key is not PKCS#8 encoded")),
      None => return Err(Error::root_load("no private key found in PEM")),
    };

    let key_pair = KeyPair::try_from(key_der.secret_pkcs8_der())
      .map_err(|e| Error::root_load(format!("failed to parse root key: {}", e)))?;
    if !RSA_ALGORITHMS
      .iter()
      .any(|alg| key_pair.algorithm() == *alg)
    {
      return Err(Error::root_load("root key is not an RSA private key"));
    }

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::root_load(format!("failed to create issuer from root: {}", e)))?;

    Ok(Self { issuer, cert_der })
  }

  /// Root certificate in DER format, for trust stores and chain building.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }
}

/// Forges leaf certificates signed by a [`RootAuthority`].
///
/// Nothing is cached: every call to [`issue`](Self::issue) generates a new
/// key pair and a new serial number.
#[derive(Clone)]
pub struct CertificateAuthority {
  root: Arc<RootAuthority>,
}

impl CertificateAuthority {
  /// Create an issuer around a loaded root.
  pub fn new(root: RootAuthority) -> Self {
    Self {
      root: Arc::new(root),
    }
  }

  /// The root this authority signs with.
  pub fn root(&self) -> &RootAuthority {
    &self.root
  }

  /// Generate a leaf certificate for `server_name` signed by the root.
  ///
  /// An IP literal gets an IP subject alternative name, anything else a DNS
  /// one; never both.
  pub fn issue(&self, server_name: &str) -> Result<IssuedCertificate> {
    if server_name.is_empty() {
      return Err(Error::issuance("empty server name"));
    }
    let mut params = CertificateParams::default();
    params.serial_number = Some(next_serial().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, server_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![subject_alt_name(server_name)?];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(NOT_BEFORE_OFFSET_HOURS);
    params.not_after = now + Duration::days(TTL_DAYS);
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::issuance(format!("failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.root.issuer)
      .map_err(|e| Error::issuance(format!("failed to sign leaf for {}: {}", server_name, e)))?;
    tracing::debug!("issued leaf certificate for {}", server_name);

    Ok(IssuedCertificate {
      cert_der: CertificateDer::from(cert.der().to_vec()),
      key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
      root_der: self.root.cert_der.clone(),
    })
  }
}

/// A leaf certificate and the private key it was issued for.
pub struct IssuedCertificate {
  cert_der: CertificateDer<'static>,
  key_der: PrivateKeyDer<'static>,
  root_der: CertificateDer<'static>,
}

impl IssuedCertificate {
  /// Leaf certificate in DER format.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Leaf private key in PKCS#8 DER format.
  pub fn key_der(&self) -> &PrivateKeyDer<'static> {
    &self.key_der
  }

  /// Chain presented to clients: `[leaf, root]`.
  pub fn chain(&self) -> Vec<CertificateDer<'static>> {
    vec![self.cert_der.clone(), self.root_der.clone()]
  }

  /// Build a TLS server configuration presenting this certificate.
  ///
  /// Only `http/1.1` is offered over ALPN.
  pub fn server_config(self) -> Result<ServerConfig> {
    let chain = self.chain();
    let mut config = ServerConfig::builder_with_provider(crate::tls::crypto_provider())
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::issuance(format!("invalid TLS versions: {}", e)))?
      .with_no_client_auth()
      .with_single_cert(chain, self.key_der)
      .map_err(|e| Error::issuance(format!("failed to create TLS config: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
  }
}

fn subject_alt_name(server_name: &str) -> Result<SanType> {
  if let Ok(ip) = server_name.parse::<IpAddr>() {
    return Ok(SanType::IpAddress(ip));
  }
  let dns_name = server_name
    .try_into()
    .map_err(|_| Error::issuance(format!("invalid domain name: {}", server_name)))?;
  Ok(SanType::DnsName(dns_name))
}

// Time based, but strictly increasing within the process.
fn next_serial() -> u64 {
  let now = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or_default();
  let previous = LAST_SERIAL
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
      Some(now.max(last + 1))
    })
    .unwrap_or_default();
  now.max(previous + 1)
}
