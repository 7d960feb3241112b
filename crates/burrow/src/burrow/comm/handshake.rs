//! Mutual TLS 1.3 over the raw peer stream, authenticated by key fingerprint.
//!
//! Both ends present self-signed certificates. Instead of PKI validation, the
//! verifier hashes the peer's end-entity certificate and compares it against a
//! set of trusted fingerprints (`base64(sha256(der))`). An empty set trusts any
//! key; the observed fingerprint is still returned to the caller.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use base64::Engine;
use rcgen::generate_simple_self_signed;
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::burrow::comm::transport::BoxedStream;

pub const SERVER_NAME: &str = "burrow";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer presented no certificate")]
    NoPeerCertificate,
}

/// Certificate chain and private key this process presents to peers.
#[derive(Debug)]
pub struct Identity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl Identity {
    /// Loads the PEM pair, generating (and persisting) one when the files are missing.
    /// With both paths empty an ephemeral identity is generated.
    pub fn load_or_generate(cert_file: &str, key_file: &str) -> anyhow::Result<Self> {
        let cert_file = cert_file.trim();
        let key_file = key_file.trim();

        if cert_file.is_empty() && key_file.is_empty() {
            return Self::generate();
        }
        if cert_file.is_empty() || key_file.is_empty() {
            anyhow::bail!("identity: requires both cert_file and key_file (or neither to auto-generate)");
        }

        let (cert_path, key_path) = (Path::new(cert_file), Path::new(key_file));
        if !cert_path.exists() && !key_path.exists() {
            let rcgen::CertifiedKey { cert, signing_key } =
                generate_simple_self_signed([SERVER_NAME.to_string()])?;
            for p in [cert_path, key_path] {
                if let Some(parent) = p.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create identity dir {}", parent.display()))?;
                }
            }
            std::fs::write(cert_path, cert.pem())
                .with_context(|| format!("write {}", cert_path.display()))?;
            std::fs::write(key_path, signing_key.serialize_pem())
                .with_context(|| format!("write {}", key_path.display()))?;
            tracing::info!(cert = %cert_path.display(), "identity: generated new key pair");
        }

        let cert_chain = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        Ok(Self { cert_chain, key })
    }

    pub fn generate() -> anyhow::Result<Self> {
        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed([SERVER_NAME.to_string()])?;
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        Ok(Self {
            cert_chain: vec![cert_der],
            key: key_der,
        })
    }

    pub fn fingerprint(&self) -> String {
        self.cert_chain.first().map(fingerprint).unwrap_or_default()
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("identity: no certificate found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)?;
    let Some(k) = key else {
        anyhow::bail!("identity: no private key found in {}", path.display());
    };
    Ok(k)
}

/// `base64(sha256(der))` of a certificate.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Local identity plus the peer fingerprints it accepts.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity: Identity,
    pub trusted: Vec<String>,
}

impl Credentials {
    pub fn new(identity: Identity, trusted: Vec<String>) -> Self {
        let trusted = trusted
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self { identity, trusted }
    }
}

/// Verifies peer certificates by fingerprint only.
#[derive(Debug)]
struct FingerprintVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
    trusted: Vec<String>,
}

impl FingerprintVerifier {
    fn new(provider: Arc<rustls::crypto::CryptoProvider>, trusted: Vec<String>) -> Arc<Self> {
        Arc::new(Self { provider, trusted })
    }

    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        if self.trusted.is_empty() {
            return Ok(());
        }
        let fp = fingerprint(end_entity);
        if self.trusted.iter().any(|t| t == &fp) {
            Ok(())
        } else {
            tracing::warn!(fingerprint = %fp, "comm: peer key not trusted");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn tls12(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn tls13(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for FingerprintVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn server_config(creds: &Credentials) -> Result<Arc<rustls::ServerConfig>, rustls::Error> {
    let provider = provider();
    let verifier = FingerprintVerifier::new(provider.clone(), creds.trusted.clone());
    let cfg = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(creds.identity.cert_chain.clone(), creds.identity.key.clone_key())?;
    Ok(Arc::new(cfg))
}

pub fn client_config(creds: &Credentials) -> Result<Arc<rustls::ClientConfig>, rustls::Error> {
    let provider = provider();
    let verifier = FingerprintVerifier::new(provider.clone(), creds.trusted.clone());
    let cfg = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(creds.identity.cert_chain.clone(), creds.identity.key.clone_key())?;
    Ok(Arc::new(cfg))
}

/// Runs the server side of the handshake; returns the secured stream and the
/// peer's key fingerprint.
pub async fn accept(
    raw: BoxedStream,
    creds: &Credentials,
    timeout: Duration,
) -> Result<(BoxedStream, String), HandshakeError> {
    let acceptor = tokio_rustls::TlsAcceptor::from(server_config(creds)?);
    let tls = tokio::time::timeout(timeout, acceptor.accept(raw))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))??;
    let fp = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|c| c.first())
        .map(fingerprint)
        .ok_or(HandshakeError::NoPeerCertificate)?;
    Ok((Box::new(tls), fp))
}

/// Runs the client side of the handshake; returns the secured stream and the
/// server's key fingerprint.
pub async fn connect(
    raw: BoxedStream,
    creds: &Credentials,
    timeout: Duration,
) -> Result<(BoxedStream, String), HandshakeError> {
    let connector = tokio_rustls::TlsConnector::from(client_config(creds)?);
    let name = ServerName::try_from(SERVER_NAME)
        .map_err(|e| HandshakeError::Io(std::io::Error::other(e.to_string())))?;
    let tls = tokio::time::timeout(timeout, connector.connect(name, raw))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))??;
    let fp = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|c| c.first())
        .map(fingerprint)
        .ok_or(HandshakeError::NoPeerCertificate)?;
    Ok((Box::new(tls), fp))
}
