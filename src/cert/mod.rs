//! Self-signed TLS identity for the webhook listener.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, KeyPair, SanType, SerialNumber,
    PKCS_RSA_SHA512,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use time::OffsetDateTime;
use tracing::info;

use crate::error::{Error, Result};

pub const RSA_KEY_BITS: usize = 2048;
pub const VALIDITY_DAYS: i64 = 10 * 365;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// PEM certificate and private key locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsMaterial {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Standard file names inside a directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CERT_FILE), dir.join(KEY_FILE))
    }

    /// Both halves must be supplied together or not at all.
    pub fn from_pair(cert_path: Option<PathBuf>, key_path: Option<PathBuf>) -> Result<Option<Self>> {
        match (cert_path, key_path) {
            (Some(cert), Some(key)) => Ok(Some(Self::new(cert, key))),
            (None, None) => Ok(None),
            _ => Err(Error::Validation(
                "cert_path and key_path must be set together".into(),
            )),
        }
    }
}

/// Subject alternative name for a hostname: IP form for IP literals, DNS otherwise.
pub fn subject_alt_name(hostname: &str) -> Result<SanType> {
    match hostname.parse::<IpAddr>() {
        Ok(ip) => Ok(SanType::IpAddress(ip)),
        Err(_) => {
            let name = hostname
                .try_into()
                .map_err(|e| Error::Certificate(format!("invalid DNS name {}: {}", hostname, e)))?;
            Ok(SanType::DnsName(name))
        }
    }
}

fn certificate_params(hostname: &str) -> Result<CertificateParams> {
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CountryName, "BR");
    subject.push(DnType::StateOrProvinceName, "Sao Paulo");
    subject.push(DnType::LocalityName, "Campinas");
    subject.push(DnType::OrganizationName, hostname);
    subject.push(DnType::OrganizationalUnitName, hostname);

    let now = OffsetDateTime::now_utc();
    let mut params = CertificateParams::default();
    params.distinguished_name = subject;
    params.serial_number = Some(SerialNumber::from(vec![0x03, 0xE8]));
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
    params.subject_alt_names = vec![subject_alt_name(hostname)?];
    Ok(params)
}

fn generate_key_pair() -> Result<KeyPair> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
        .map_err(|e| Error::Certificate(format!("RSA key generation failed: {}", e)))?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Certificate(format!("RSA key encoding failed: {}", e)))?;
    KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA512)
        .map_err(|e| Error::Certificate(format!("RSA key rejected: {}", e)))
}

/// Generates a key pair and a self-signed certificate for `hostname`, writes
/// both as PEM and returns the certificate PEM.
pub fn create_self_signed_cert(hostname: &str, material: &TlsMaterial) -> Result<String> {
    info!("Generating self-signed certificate for {}", hostname);

    let key_pair = generate_key_pair()?;
    let certificate = certificate_params(hostname)?
        .self_signed(&key_pair)
        .map_err(|e| Error::Certificate(format!("signing failed: {}", e)))?;

    let cert_pem = certificate.pem();
    std::fs::write(&material.cert_path, &cert_pem)?;
    std::fs::write(&material.key_path, key_pair.serialize_pem())?;

    info!(
        "Wrote certificate to {:?} and key to {:?}",
        material.cert_path, material.key_path
    );
    Ok(cert_pem)
}
