//! Certificate delivery.
//!
//! The default channel drops `<device_id>.crt` into an outbox directory
//! that devices (or the dashboard's download endpoint) fetch from.

use std::path::{Path, PathBuf};

use super::{BackendError, CertificateDelivery};
use crate::storage::write_bytes_atomic;

/// Writes each delivered certificate to `<outbox>/<device_id>.crt`.
#[derive(Debug, Clone)]
pub struct DirectoryDelivery {
    outbox: PathBuf,
}

impl DirectoryDelivery {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    pub fn certificate_path(&self, device_id: &str) -> PathBuf {
        self.outbox.join(format!("{}.crt", device_id))
    }
}

impl CertificateDelivery for DirectoryDelivery {
    fn deliver(&self, device_id: &str, certificate_pem: &[u8]) -> Result<(), BackendError> {
        let path = self.certificate_path(device_id);
        write_bytes_atomic(&path, certificate_pem).map_err(|e| BackendError::new(e.to_string()))?;
        log::debug!("CERT_DELIVERED device={} path={}", device_id, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_writes_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = DirectoryDelivery::new(dir.path().join("outbox"));
        delivery.deliver("dev-1", b"PEM").unwrap();
        assert_eq!(std::fs::read(delivery.certificate_path("dev-1")).unwrap(), b"PEM");
    }

    #[test]
    fn test_redelivery_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = DirectoryDelivery::new(dir.path());
        delivery.deliver("dev-1", b"old").unwrap();
        delivery.deliver("dev-1", b"new").unwrap();
        assert_eq!(std::fs::read(delivery.certificate_path("dev-1")).unwrap(), b"new");
    }
}
