//! TLS plumbing shared by the origin connector and the tunnel terminator
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
  verify_tls12_signature, verify_tls13_signature, CryptoProvider,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

/// The process default provider, or ring when none was installed.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// An extra trust anchor for origin connections.
#[derive(Clone, Debug)]
pub struct Certificate {
  der: CertificateDer<'static>,
}

impl Certificate {
  /// Wrap a DER encoded certificate.
  pub fn from_der(der: &[u8]) -> crate::Result<Certificate> {
    Ok(Certificate {
      der: CertificateDer::from(der.to_vec()),
    })
  }

  /// Every certificate found in a PEM bundle, in file order.
  pub fn from_pem_bundle(mut pem: &[u8]) -> crate::Result<Vec<Certificate>> {
    rustls_pemfile::certs(&mut pem)
      .map(|item| {
        item
          .map(|der| Certificate { der })
          .map_err(|_| crate::errors::builder("invalid certificate encoding"))
      })
      .collect()
  }

  pub(crate) fn add_to_tls(self, store: &mut RootCertStore) -> crate::Result<()> {
    store.add(self.der).map_err(crate::errors::builder)
  }
}

/// Skips chain and name checks on origin certificates. Handshake signatures
/// are still checked, so the origin must hold the key it presents.
#[derive(Debug)]
pub(crate) struct AcceptAnyServerCert {
  provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
  pub(crate) fn new() -> Self {
    Self {
      provider: crypto_provider(),
    }
  }
}

impl ServerCertVerifier for AcceptAnyServerCert {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp: &[u8],
    _now: UnixTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls12_signature(
      message,
      cert,
      dss,
      &self.provider.signature_verification_algorithms,
    )
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls13_signature(
      message,
      cert,
      dss,
      &self.provider.signature_verification_algorithms,
    )
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self
      .provider
      .signature_verification_algorithms
      .supported_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pem_bundle_is_split_into_certificates() {
    let pem = include_bytes!("../tests/fixtures/root_ca.pem");
    let certs = Certificate::from_pem_bundle(pem).unwrap();
    assert_eq!(certs.len(), 1);
    let mut store = RootCertStore::empty();
    certs[0].clone().add_to_tls(&mut store).unwrap();
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn garbage_bundle_has_no_certificates() {
    let certs = Certificate::from_pem_bundle(b"nothing to see").unwrap();
    assert!(certs.is_empty());
  }

  #[test]
  fn permissive_verifier_offers_provider_schemes() {
    let verifier = AcceptAnyServerCert::new();
    assert!(verifier
      .supported_verify_schemes()
      .contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
  }
}
