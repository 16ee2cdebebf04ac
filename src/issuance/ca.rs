//! Local certificate authority.
//!
//! rcgen-backed `CsrSigner` that keeps its key and certificate under the
//! engine's state directory, plus the x509-parser backed `CertificateParser`.
//! The authority also mints the client identity the discovery scanner
//! presents during mTLS probes.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;
use x509_parser::prelude::parse_x509_certificate;

use super::csr::{decode_pem_or_der, der_to_pem, inspect_csr};
use super::{BackendError, CertificateParser, CertificateSummary, CsrSigner};
use crate::storage::{write_bytes_atomic, StoreError};

const CA_KEY_FILE: &str = "ca.key";
const CA_CERT_FILE: &str = "ca.crt";
const CA_VALIDITY_DAYS: i64 = 3650;
const CERTIFICATE_PEM_LABELS: &[&str] = &["CERTIFICATE"];

/// Failure to load or create CA material.
#[derive(Debug, Error)]
pub enum CaError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("CA material invalid: {0}")]
    Crypto(String),
}

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        CaError::Crypto(e.to_string())
    }
}

/// Certificate and key the scanner presents to devices.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub certificate_der: Vec<u8>,
    /// PKCS#8 private key.
    pub private_key_der: Vec<u8>,
    pub ca_certificate_der: Vec<u8>,
}

/// In-process signing authority.
pub struct LocalCa {
    key: KeyPair,
    cert: Certificate,
    cert_pem: String,
}

impl std::fmt::Debug for LocalCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCa").finish_non_exhaustive()
    }
}

impl LocalCa {
    /// Fresh, unpersisted authority.
    pub fn generate(common_name: &str) -> Result<Self, CaError> {
        let key = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "DevTrust");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = Utc::now();
        params.not_before = to_offset(now).map_err(CaError::Crypto)?;
        params.not_after =
            to_offset(now + Duration::days(CA_VALIDITY_DAYS)).map_err(CaError::Crypto)?;
        params.serial_number = Some(new_serial());

        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        Ok(Self {
            key,
            cert,
            cert_pem,
        })
    }

    /// Load `ca.key`/`ca.crt` from `dir`, creating them on first run.
    pub fn open_or_create(dir: &Path, common_name: &str) -> Result<Self, CaError> {
        let key_path = dir.join(CA_KEY_FILE);
        let cert_path = dir.join(CA_CERT_FILE);

        match (read_optional(&key_path)?, read_optional(&cert_path)?) {
            (Some(key_pem), Some(cert_pem)) => {
                let key = KeyPair::from_pem(&key_pem)?;
                let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
                // Re-signing yields an issuer with the same subject and key,
                // so new certificates chain to the stored ca.crt.
                let cert = params.self_signed(&key)?;
                log::info!("CA_LOADED dir={}", dir.display());
                Ok(Self {
                    key,
                    cert,
                    cert_pem,
                })
            }
            (None, None) => {
                let ca = Self::generate(common_name)?;
                write_bytes_atomic(&key_path, ca.key.serialize_pem().as_bytes())?;
                write_bytes_atomic(&cert_path, ca.cert_pem.as_bytes())?;
                log::info!("CA_CREATED dir={} cn={}", dir.display(), common_name);
                Ok(ca)
            }
            _ => Err(CaError::Crypto(format!(
                "only one of {} and {} exists in {}",
                CA_KEY_FILE,
                CA_CERT_FILE,
                dir.display()
            ))),
        }
    }

    /// PEM of the trust root devices should install.
    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Issue the scanner's own client certificate.
    pub fn mint_client_identity(
        &self,
        common_name: &str,
        validity_days: u32,
    ) -> Result<ClientIdentity, CaError> {
        let key = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let now = Utc::now();
        params.not_before = to_offset(now).map_err(CaError::Crypto)?;
        params.not_after =
            to_offset(now + Duration::days(i64::from(validity_days))).map_err(CaError::Crypto)?;
        params.serial_number = Some(new_serial());

        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok(ClientIdentity {
            certificate_der: cert.der().to_vec(),
            private_key_der: key.serialize_der(),
            ca_certificate_der: self.cert.der().to_vec(),
        })
    }
}

impl CsrSigner for LocalCa {
    fn sign(&self, csr: &[u8], subject_cn: &str, validity_days: u32) -> Result<Vec<u8>, BackendError> {
        let subject = inspect_csr(csr).map_err(|e| BackendError::new(e.to_string()))?;
        let pem = der_to_pem("CERTIFICATE REQUEST", &subject.der);

        let mut request = CertificateSigningRequestParams::from_pem(&pem)
            .map_err(|e| BackendError::new(format!("CSR rejected by signer: {}", e)))?;

        let now = Utc::now();
        let params = &mut request.params;
        params.not_before = to_offset(now).map_err(BackendError)?;
        params.not_after =
            to_offset(now + Duration::days(i64::from(validity_days))).map_err(BackendError)?;
        params.serial_number = Some(new_serial());
        params.distinguished_name.push(DnType::CommonName, subject_cn);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let cert = request
            .signed_by(&self.cert, &self.key)
            .map_err(|e| BackendError::new(format!("CA signing failed: {}", e)))?;
        Ok(cert.pem().into_bytes())
    }
}

/// `CertificateParser` backed by x509-parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct X509CertificateParser;

impl CertificateParser for X509CertificateParser {
    fn parse(&self, certificate: &[u8]) -> Result<CertificateSummary, BackendError> {
        let der = decode_pem_or_der(certificate, CERTIFICATE_PEM_LABELS).map_err(BackendError)?;
        let (_, cert) = parse_x509_certificate(&der)
            .map_err(|e| BackendError::new(format!("certificate unreadable: {:?}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| BackendError::new("certificate subject has no common name"))?
            .to_string();

        let validity = cert.validity();
        let valid_from = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| BackendError::new("invalid not_before timestamp"))?;
        let valid_to = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| BackendError::new("invalid not_after timestamp"))?;

        Ok(CertificateSummary {
            common_name,
            valid_from,
            valid_to,
            serial: cert.tbs_certificate.raw_serial_as_string(),
            fingerprint_sha256: hex::encode(Sha256::digest(&der)),
        })
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn to_offset(instant: DateTime<Utc>) -> Result<OffsetDateTime, String> {
    OffsetDateTime::from_unix_timestamp(instant.timestamp())
        .map_err(|e| format!("timestamp out of range: {}", e))
}

/// Random positive 128-bit serial.
fn new_serial() -> SerialNumber {
    let mut bytes = *Uuid::new_v4().as_bytes();
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::from_slice(&bytes)
}
