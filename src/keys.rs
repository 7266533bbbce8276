//! Ed25519 key management, self-signed certificates, and pinning.
//!
//! There is no CA anywhere near this system. The server self-signs a
//! certificate from its Ed25519 key; the client skips chain verification
//! entirely and instead pins the SHA-256 fingerprint of the server's raw
//! public key, distributed out of band as a PEM file.

use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose};
use ring::digest;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// ALPN identifier both sides must offer.
pub const ALPN: &[u8] = b"slipstream";

/// DER prefix of an Ed25519 SubjectPublicKeyInfo; the 32 raw key bytes
/// follow immediately (RFC 8410).
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("not an Ed25519 key")]
    NotEd25519,

    #[error("certificate generation failed: {0}")]
    Cert(#[from] rcgen::Error),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),
}

/// Generate a fresh Ed25519 key pair.
pub fn generate_keypair() -> Result<KeyPair, KeyError> {
    Ok(KeyPair::generate_for(&rcgen::PKCS_ED25519)?)
}

/// Write the private key as PKCS#8 PEM, owner-readable only.
pub fn save_private_key(key_pair: &KeyPair, path: &Path) -> Result<(), KeyError> {
    std::fs::write(path, key_pair.serialize_pem())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Write the public key as SPKI PEM.
pub fn save_public_key(key_pair: &KeyPair, path: &Path) -> Result<(), KeyError> {
    let raw = key_pair.public_key_raw();
    if raw.len() != 32 {
        return Err(KeyError::NotEd25519);
    }
    let mut spki = Vec::with_capacity(ED25519_SPKI_PREFIX.len() + raw.len());
    spki.extend_from_slice(&ED25519_SPKI_PREFIX);
    spki.extend_from_slice(raw);
    std::fs::write(path, encode_pem("PUBLIC KEY", &spki))?;
    Ok(())
}

/// Load an Ed25519 private key from PKCS#8 PEM.
pub fn load_private_key(path: &Path) -> Result<KeyPair, KeyError> {
    let pem = std::fs::read_to_string(path)?;
    let key_pair = KeyPair::from_pem(&pem).map_err(|err| KeyError::Pem(err.to_string()))?;
    if !key_pair.is_compatible(&rcgen::PKCS_ED25519) {
        return Err(KeyError::NotEd25519);
    }
    Ok(key_pair)
}

/// Load the raw 32-byte Ed25519 public key from an SPKI PEM file.
pub fn load_public_key(path: &Path) -> Result<[u8; 32], KeyError> {
    let pem = std::fs::read_to_string(path)?;
    let spki = decode_pem("PUBLIC KEY", &pem)?;
    let raw = spki
        .strip_prefix(&ED25519_SPKI_PREFIX[..])
        .ok_or(KeyError::NotEd25519)?;
    raw.try_into().map_err(|_| KeyError::NotEd25519)
}

/// SHA-256 over the raw public key, base64-encoded. This is what the
/// client pins and what `genkey` prints for the operator.
pub fn fingerprint(public_key: &[u8]) -> String {
    BASE64.encode(digest::digest(&digest::SHA256, public_key))
}

/// Pull the raw Ed25519 key out of a certificate by locating its SPKI.
/// The fixed RFC 8410 encoding makes a full ASN.1 parser unnecessary.
pub fn cert_ed25519_key(cert_der: &[u8]) -> Option<[u8; 32]> {
    let pos = cert_der
        .windows(ED25519_SPKI_PREFIX.len())
        .position(|w| w == ED25519_SPKI_PREFIX)?;
    let start = pos + ED25519_SPKI_PREFIX.len();
    cert_der.get(start..start + 32)?.try_into().ok()
}

/// Self-signed certificate for the server key, valid for one year.
fn self_signed_cert(key_pair: &KeyPair) -> Result<CertificateDer<'static>, KeyError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Slipstream DNS Tunnel");
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(365);
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);

    let cert = params.self_signed(key_pair)?;
    Ok(cert.der().clone())
}

/// rustls server config: our self-signed cert, `slipstream` ALPN.
pub fn server_tls_config(key_pair: &KeyPair) -> Result<rustls::ServerConfig, KeyError> {
    let cert = self_signed_cert(key_pair)?;
    let key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// rustls client config that bypasses trust-chain verification and pins
/// the expected public-key fingerprint instead.
pub fn client_tls_config(expected_fingerprint: String) -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier::new(
            expected_fingerprint,
        )))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN.to_vec()];
    config
}

/// Accepts exactly one server: the one whose Ed25519 key hashes to the
/// pinned fingerprint. Handshake signatures are still verified normally.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    expected: String,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedServerVerifier {
    pub fn new(expected: String) -> Self {
        Self {
            expected,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let key = cert_ed25519_key(end_entity).ok_or_else(|| {
            rustls::Error::General("certificate does not carry an Ed25519 key".into())
        })?;
        let actual = fingerprint(&key);
        if actual != self.expected {
            return Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: got {actual}"
            )));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn encode_pem(label: &str, der: &[u8]) -> String {
    let body = BASE64.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for line in body.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(line).expect("base64 is ASCII"));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

fn decode_pem(label: &str, pem: &str) -> Result<Vec<u8>, KeyError> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let mut body = String::new();
    let mut inside = false;
    for line in pem.lines() {
        let line = line.trim();
        if line == begin {
            inside = true;
        } else if line == end {
            if !inside {
                break;
            }
            return BASE64
                .decode(&body)
                .map_err(|err| KeyError::Pem(err.to_string()));
        } else if inside {
            body.push_str(line);
        }
    }
    Err(KeyError::Pem(format!("no {label} block found")))
}
