//! Certificate-signing request inspection.
//!
//! Accepts PEM or DER PKCS#10, checks the request's self-signature and
//! extracts the subject common name before anything is signed.

use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

use super::IssuanceError;

const CSR_PEM_LABELS: &[&str] = &["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// What the engine learned from a well-formed CSR.
#[derive(Debug, Clone)]
pub struct CsrSubject {
    pub common_name: String,
    /// SHA-256 of the SubjectPublicKeyInfo, hex.
    pub public_key_sha256: String,
    pub der: Vec<u8>,
}

/// Parse and verify a CSR.
pub fn inspect_csr(csr: &[u8]) -> Result<CsrSubject, IssuanceError> {
    let malformed = |reason: String| IssuanceError::MalformedCsr { reason };

    if csr.is_empty() {
        return Err(malformed("empty request".to_string()));
    }

    let der = decode_pem_or_der(csr, CSR_PEM_LABELS).map_err(malformed)?;

    let (common_name, public_key_sha256) = {
        let (rest, request) = X509CertificationRequest::from_der(&der)
            .map_err(|e| malformed(format!("not a PKCS#10 request: {:?}", e)))?;
        if !rest.is_empty() {
            return Err(malformed(format!("{} trailing bytes after request", rest.len())));
        }

        request
            .verify_signature()
            .map_err(|e| malformed(format!("self-signature invalid: {:?}", e)))?;

        let info = &request.certification_request_info;
        let common_name = info
            .subject
            .iter_common_name()
            .next()
            .ok_or_else(|| malformed("subject has no common name".to_string()))?
            .as_str()
            .map_err(|e| malformed(format!("common name is not a string: {:?}", e)))?
            .trim()
            .to_string();
        if common_name.is_empty() {
            return Err(malformed("subject common name is empty".to_string()));
        }

        (common_name, hex::encode(Sha256::digest(info.subject_pki.raw)))
    };

    Ok(CsrSubject {
        common_name,
        public_key_sha256,
        der,
    })
}

/// Decode PEM with one of `labels`, or pass DER through unchanged.
pub(crate) fn decode_pem_or_der(bytes: &[u8], labels: &[&str]) -> Result<Vec<u8>, String> {
    if !looks_like_pem(bytes) {
        return Ok(bytes.to_vec());
    }

    let (_, pem) = parse_x509_pem(bytes).map_err(|e| format!("invalid PEM: {:?}", e))?;
    if !labels.contains(&pem.label.as_str()) {
        return Err(format!(
            "unexpected PEM block '{}', expected {:?}",
            pem.label, labels
        ));
    }
    Ok(pem.contents)
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes[start..].starts_with(b"-----BEGIN")
}

/// Re-armour DER as a PEM block with 64-column lines.
pub fn der_to_pem(label: &str, der: &[u8]) -> String {
    let encoded = general_purpose::STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for line in encoded.as_bytes().chunks(64) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn csr_pem(common_name: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "IoT");
        params.distinguished_name = dn;
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    #[test]
    fn test_inspect_valid_pem() {
        let subject = inspect_csr(csr_pem("dev-1").as_bytes()).unwrap();
        assert_eq!(subject.common_name, "dev-1");
        assert_eq!(subject.public_key_sha256.len(), 64);
        assert!(!subject.der.is_empty());
    }

    #[test]
    fn test_inspect_der_input() {
        let pem = csr_pem("dev-der");
        let der = inspect_csr(pem.as_bytes()).unwrap().der;
        let subject = inspect_csr(&der).unwrap();
        assert_eq!(subject.common_name, "dev-der");
    }

    #[test]
    fn test_reject_garbage() {
        let result = inspect_csr(b"definitely not a csr");
        assert!(matches!(result, Err(IssuanceError::MalformedCsr { .. })));
    }

    #[test]
    fn test_reject_empty() {
        assert!(matches!(
            inspect_csr(b""),
            Err(IssuanceError::MalformedCsr { .. })
        ));
    }

    #[test]
    fn test_reject_wrong_pem_label() {
        let pem = der_to_pem("CERTIFICATE", b"\x30\x00");
        let result = inspect_csr(pem.as_bytes());
        match result {
            Err(IssuanceError::MalformedCsr { reason }) => assert!(reason.contains("unexpected PEM block")),
            other => panic!("expected MalformedCsr, got {:?}", other),
        }
    }

    #[test]
    fn test_pem_round_trip_through_armour() {
        let pem = csr_pem("dev-armour");
        let der = inspect_csr(pem.as_bytes()).unwrap().der;
        let rearmoured = der_to_pem("CERTIFICATE REQUEST", &der);
        assert_eq!(inspect_csr(rearmoured.as_bytes()).unwrap().common_name, "dev-armour");
    }
}
