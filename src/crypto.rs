//! # Cryptographic Infrastructure
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification for
//!   gossip messages
//! - **TLS**: self-signed Ed25519 certificates and verifiers for the QUIC
//!   secure channel
//!
//! ## Identity Binding
//!
//! The certificate's subject public key IS the node's identity. Both sides
//! of a link present a certificate; the server side accepts any valid
//! Ed25519 key and reports it as the remote identity, the client side pins
//! the identity it expects through the SNI name and refuses anything else.
//! There is no CA: trust comes from knowing the peer's identity and from
//! the tier assigned to it in the peer directory.
//!
//! The `dangerous()` rustls APIs are used because verification binds
//! identity to public key instead of to a certificate chain.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;

use crate::identity::{Identity, Keypair};

/// Signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
}

// Each signed data type gets its own prefix so a signature cannot be
// replayed in a different context.

/// Domain separation prefix for gossip message signatures.
pub const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"tiermesh-message-v1:";

/// Signs `domain || data`.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verifies a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key = VerifyingKey::from_bytes(identity.as_bytes())
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for every tiermesh link.
pub const ALPN: &[u8] = b"tiermesh/1";

/// QUIC idle timeout. Liveness is tracked by the overlay's own pings.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds a self-signed certificate whose subject key is the node's identity.
pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();
    let identity = keypair.identity();

    // PKCS#8 v1 wrapper for a raw Ed25519 seed (RFC 8410).
    const PKCS8_PREFIX: [u8; 16] = [
        0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
        0x20,
    ];
    let mut pkcs8 = Vec::with_capacity(PKCS8_PREFIX.len() + secret_key.len());
    pkcs8.extend_from_slice(&PKCS8_PREFIX);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to load Ed25519 key for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![identity_to_sni(&identity)])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(identity.to_did()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_client_cert_verifier(Arc::new(Ed25519ClientCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519ServerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));

    Ok(client_config)
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    config.max_idle_timeout(Some(
        IDLE_TIMEOUT.try_into().context("idle timeout out of range")?,
    ));
    config.max_concurrent_bidi_streams(4u32.into());
    config.max_concurrent_uni_streams(0u32.into());
    Ok(config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes: &[u8] = &cert.public_key().subject_public_key.data;
    key_bytes.try_into().ok()
}

/// Identity proven by the peer's certificate during the handshake.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<Identity> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    let public_key = extract_public_key_from_cert(certs.first()?.as_ref())?;
    crate::identity::identity_for(&public_key).ok()
}

/// DNS labels are capped at 63 characters, so the 64 hex digits are split in two.
pub(crate) fn identity_to_sni(identity: &Identity) -> String {
    let hex = identity.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_identity_from_sni(sni: &str) -> Option<Identity> {
    let hex_str: String = sni.split('.').collect();
    let bytes = hex::decode(hex_str).ok()?;
    crate::identity::identity_for(&bytes).ok()
}

fn verify_tls13(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &rustls::DigitallySignedStruct,
) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    rustls::crypto::verify_tls13_signature(
        message,
        cert,
        dss,
        &CRYPTO_PROVIDER.signature_verification_algorithms,
    )
}

fn bad_certificate(err: rustls::CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(err)
}

#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(bad_certificate(rustls::CertificateError::BadEncoding))?;

        crate::identity::identity_for(&public_key)
            .map_err(|_| bad_certificate(rustls::CertificateError::ApplicationVerificationFailure))?;

        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Ed25519ServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519ServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let rustls::pki_types::ServerName::DnsName(name) = server_name else {
            return Err(bad_certificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        };

        let expected = parse_identity_from_sni(name.as_ref())
            .ok_or(bad_certificate(rustls::CertificateError::BadEncoding))?;

        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(bad_certificate(rustls::CertificateError::BadEncoding))?;

        if public_key != *expected.as_bytes() {
            return Err(bad_certificate(rustls::CertificateError::NotValidForName));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}
