//! Identity and transport security.
//!
//! Two kinds of keypair exist:
//!
//! - the **cluster certificate** — a CA-flagged keypair generated once by the
//!   bootstrapping node and transported to every joiner inside the
//!   token-exchange response. Its SHA-256 fingerprint is the cluster's
//!   identity and the pin carried inside join tokens.
//! - the **server certificate** — a per-member keypair whose DNS SAN is the
//!   member name. Peers authenticate it by exact match against their
//!   truststore, not by chain verification, so the truststore stays the
//!   single projection of the replicated member table.
//!
//! The TLS listener accepts any client certificate at the handshake and the
//! request plane decides trust per request; rejecting inside the handshake
//! would turn every untrusted call into an opaque TLS alert instead of the
//! documented `403 untrusted`.

use std::sync::{Arc, Once};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::{Error, Result};

/// A PEM-encoded certificate + private key pair.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KeyPairPem {
    pub cert: String,
    pub key: String,
}

static PROVIDER_INIT: Once = Once::new();

/// Install the ring crypto provider as the process default.
///
/// Idempotent; every entry point that builds a rustls config calls this
/// first.
pub fn ensure_crypto_provider() {
    PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn provider() -> Arc<CryptoProvider> {
    ensure_crypto_provider();
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

// ── Generation ────────────────────────────────────────────────────────────────

/// Generate the cluster CA keypair. `cluster_name` becomes the CN.
pub fn generate_cluster_keypair(cluster_name: &str) -> Result<KeyPairPem> {
    let mut params = rcgen::CertificateParams::new(vec![cluster_name.to_string()]);
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, cluster_name);
    params.distinguished_name = dn;
    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| Error::Fatal(format!("failed to generate cluster keypair: {}", e)))?;
    Ok(KeyPairPem {
        cert: cert
            .serialize_pem()
            .map_err(|e| Error::Fatal(format!("failed to serialize cluster cert: {}", e)))?,
        key: cert.serialize_private_key_pem(),
    })
}

/// Generate a member server keypair with `name` as the DNS SAN.
pub fn generate_server_keypair(name: &str) -> Result<KeyPairPem> {
    let mut params = rcgen::CertificateParams::new(vec![name.to_string()]);
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, name);
    params.distinguished_name = dn;
    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| Error::Fatal(format!("failed to generate server keypair: {}", e)))?;
    Ok(KeyPairPem {
        cert: cert
            .serialize_pem()
            .map_err(|e| Error::Fatal(format!("failed to serialize server cert: {}", e)))?,
        key: cert.serialize_private_key_pem(),
    })
}

/// Issue a keypair for an additional listener, signed by the cluster CA.
pub fn issue_listener_keypair(listener: &str, cluster: &KeyPairPem) -> Result<KeyPairPem> {
    let ca_key = rcgen::KeyPair::from_pem(&cluster.key)
        .map_err(|e| Error::Fatal(format!("failed to load cluster key: {}", e)))?;
    let ca_params = rcgen::CertificateParams::from_ca_cert_pem(&cluster.cert, ca_key)
        .map_err(|e| Error::Fatal(format!("failed to load cluster cert: {}", e)))?;
    let ca = rcgen::Certificate::from_params(ca_params)
        .map_err(|e| Error::Fatal(format!("failed to rebuild cluster CA: {}", e)))?;

    let mut params = rcgen::CertificateParams::new(vec![listener.to_string()]);
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, listener);
    params.distinguished_name = dn;
    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| Error::Fatal(format!("failed to generate listener keypair: {}", e)))?;
    Ok(KeyPairPem {
        cert: cert
            .serialize_pem_with_signer(&ca)
            .map_err(|e| Error::Fatal(format!("failed to sign listener cert: {}", e)))?,
        key: cert.serialize_private_key_pem(),
    })
}

// ── PEM / DER plumbing ────────────────────────────────────────────────────────

/// Parse every certificate in a PEM bundle into DER.
pub fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut pem.as_bytes()).collect();
    let certs = certs.map_err(|e| Error::Fatal(format!("failed to parse certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Fatal("no certificates found in PEM".into()));
    }
    Ok(certs)
}

/// Parse the first private key (PKCS#8, SEC1 or PKCS#1) in a PEM bundle.
pub fn key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| Error::Fatal(format!("failed to parse key PEM: {}", e)))?
        .ok_or_else(|| Error::Fatal("no private key found in PEM".into()))
}

/// SHA-256 fingerprint of the first certificate in a PEM bundle, lowercase hex.
pub fn fingerprint_pem(pem: &str) -> Result<String> {
    let certs = certs_from_pem(pem)?;
    Ok(fingerprint_der(certs[0].as_ref()))
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn fingerprint_der(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Extract the first DNS SAN from a DER certificate.
///
/// The SAN is the member name the certificate claims; the truststore check
/// compares it against the entry the certificate was found under.
pub fn dns_san(der: &[u8]) -> Result<Option<String>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::Untrusted(format!("unparseable peer certificate: {}", e)))?;
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for gn in &ext.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(d) = gn {
                return Ok(Some(d.to_string()));
            }
        }
    }
    Ok(None)
}

// ── Server side ───────────────────────────────────────────────────────────────

/// Build the listener's rustls config.
///
/// Client certificates are requested but not verified at the handshake; the
/// request plane resolves trust against the truststore per request.
pub fn server_config(keypair: &KeyPairPem) -> Result<rustls::ServerConfig> {
    ensure_crypto_provider();
    let certs = certs_from_pem(&keypair.cert)?;
    let key = key_from_pem(&keypair.key)?;
    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new()))
        .with_single_cert(certs, key)
        .map_err(|e| Error::Fatal(format!("invalid server keypair: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Client-certificate verifier that records but never rejects.
#[derive(Debug)]
pub struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyClientCert {
    pub fn new() -> Self {
        Self {
            provider: provider(),
        }
    }
}

impl Default for AcceptAnyClientCert {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ── Client side ───────────────────────────────────────────────────────────────

/// Build the intra-cluster client config: identity = our server keypair,
/// peer verification = exact match against `trusted` (the truststore set
/// plus the cluster certificate).
pub fn peer_client_config(
    identity: &KeyPairPem,
    trusted: Vec<CertificateDer<'static>>,
) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider();
    let chain = certs_from_pem(&identity.cert)?;
    let key = key_from_pem(&identity.key)?;
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustedSetVerifier::new(trusted)))
        .with_client_auth_cert(chain, key)
        .map_err(|e| Error::Fatal(format!("invalid client identity: {}", e)))
}

/// Build the join-dial client config: identity = our server keypair, peer
/// verification = SHA-256 fingerprint pin from the decoded token.
pub fn pinned_client_config(
    identity: &KeyPairPem,
    fingerprint: &str,
) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider();
    let chain = certs_from_pem(&identity.cert)?;
    let key = key_from_pem(&identity.key)?;
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FingerprintVerifier::new(fingerprint)))
        .with_client_auth_cert(chain, key)
        .map_err(|e| Error::Fatal(format!("invalid client identity: {}", e)))
}

/// Server-certificate verifier trusting an explicit certificate set.
#[derive(Debug)]
pub struct TrustedSetVerifier {
    trusted: Vec<CertificateDer<'static>>,
    provider: Arc<CryptoProvider>,
}

impl TrustedSetVerifier {
    pub fn new(trusted: Vec<CertificateDer<'static>>) -> Self {
        Self {
            trusted,
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for TrustedSetVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if self.trusted.iter().any(|c| c.as_ref() == end_entity.as_ref()) {
            Ok(ServerCertVerified::assertion())
        } else {
            debug!(
                fingerprint = %fingerprint_der(end_entity.as_ref()),
                "Peer presented a certificate outside the trusted set"
            );
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server-certificate verifier pinning a single SHA-256 fingerprint.
///
/// Used only for the join dial, where the joiner knows nothing about the
/// cluster except what the token carries.
#[derive(Debug)]
pub struct FingerprintVerifier {
    fingerprint: String,
    provider: Arc<CryptoProvider>,
}

impl FingerprintVerifier {
    pub fn new(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_ascii_lowercase(),
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        // The pin is the cluster certificate's fingerprint; the peer may
        // present it as the leaf or alongside its server certificate.
        let presented = std::iter::once(end_entity).chain(intermediates.iter());
        for cert in presented {
            if fingerprint_der(cert.as_ref()) == self.fingerprint {
                return Ok(ServerCertVerified::assertion());
            }
        }
        Err(rustls::Error::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_keypair_carries_name_san() {
        let kp = generate_server_keypair("member1").unwrap();
        let der = certs_from_pem(&kp.cert).unwrap();
        assert_eq!(dns_san(der[0].as_ref()).unwrap().as_deref(), Some("member1"));
    }

    #[test]
    fn fingerprint_is_stable_and_hex() {
        let kp = generate_cluster_keypair("microcluster").unwrap();
        let f1 = fingerprint_pem(&kp.cert).unwrap();
        let f2 = fingerprint_pem(&kp.cert).unwrap();
        assert_eq!(f1, f2);
        assert_eq!(f1.len(), 64);
        assert!(f1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_keypairs_have_distinct_fingerprints() {
        let a = generate_server_keypair("a").unwrap();
        let b = generate_server_keypair("b").unwrap();
        assert_ne!(
            fingerprint_pem(&a.cert).unwrap(),
            fingerprint_pem(&b.cert).unwrap()
        );
    }

    #[test]
    fn server_config_builds() {
        let kp = generate_server_keypair("member1").unwrap();
        server_config(&kp).unwrap();
    }

    #[test]
    fn client_configs_build() {
        let identity = generate_server_keypair("member1").unwrap();
        let peer = generate_server_keypair("member2").unwrap();
        let trusted = certs_from_pem(&peer.cert).unwrap();
        peer_client_config(&identity, trusted).unwrap();
        pinned_client_config(&identity, "ab12").unwrap();
    }

    #[test]
    fn listener_keypair_signed_by_cluster() {
        let cluster = generate_cluster_keypair("microcluster").unwrap();
        let listener = issue_listener_keypair("metrics", &cluster).unwrap();
        // Signed, not self-signed: issuer differs from subject.
        let der = certs_from_pem(&listener.cert).unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(der[0].as_ref()).unwrap();
        assert_ne!(parsed.issuer().to_string(), parsed.subject().to_string());
    }

    #[test]
    fn trusted_set_verifier_rejects_unknown() {
        let known = generate_server_keypair("known").unwrap();
        let unknown = generate_server_keypair("unknown").unwrap();
        let verifier = TrustedSetVerifier::new(certs_from_pem(&known.cert).unwrap());
        let der = certs_from_pem(&unknown.cert).unwrap();
        let name = ServerName::try_from("unknown").unwrap();
        let outcome = verifier.verify_server_cert(&der[0], &[], &name, &[], UnixTime::now());
        assert!(outcome.is_err());
    }

    #[test]
    fn fingerprint_verifier_accepts_pinned() {
        let kp = generate_cluster_keypair("microcluster").unwrap();
        let der = certs_from_pem(&kp.cert).unwrap();
        let pin = fingerprint_der(der[0].as_ref());
        let verifier = FingerprintVerifier::new(&pin);
        let name = ServerName::try_from("anything").unwrap();
        assert!(verifier
            .verify_server_cert(&der[0], &[], &name, &[], UnixTime::now())
            .is_ok());
    }
}
