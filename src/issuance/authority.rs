//! Exactly-once identity issuance.
//!
//! Coordinates the issuance workflow for one device:
//! 1. Device id and CSR validation (rejected before anything is signed)
//! 2. Per-device gate: concurrent callers for one id queue here
//! 3. Idempotency check against the identity store
//! 4. Signing and metadata extraction, bounded by a deadline
//! 5. Single atomic commit (a forced reissue supersedes the old certificate
//!    in the same write)
//! 6. Delivery, retried on later calls without re-signing

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;

use super::csr::inspect_csr;
use super::deadline::{run_with_deadline, DeadlineError};
use super::gate::IssuanceGate;
use super::{CertificateDelivery, CertificateParser, CsrSigner, IssuanceError};
use crate::logging::structured::LogContext;
use crate::storage::{DeliveryState, DeviceIdentity, KeyedStore, SupersededCertificate, ValidityWindow};

pub const DEFAULT_VALIDITY_DAYS: u32 = 365;
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

lazy_static! {
    /// Device ids double as file names and certificate CNs.
    static ref DEVICE_ID_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:@-]{0,127}$").unwrap();
}

/// Check a device id before it touches the store.
pub fn validate_device_id(device_id: &str) -> Result<(), IssuanceError> {
    if DEVICE_ID_PATTERN.is_match(device_id) {
        Ok(())
    } else {
        Err(IssuanceError::InvalidDeviceId {
            device_id: device_id.to_string(),
            reason: "expected 1-128 chars of [A-Za-z0-9._:@-], starting alphanumeric".to_string(),
        })
    }
}

/// Device id for a device known only by its address, e.g. `device-10-0-0-5`.
pub fn derive_device_id(address: IpAddr) -> String {
    let text = address.to_string().replace(['.', ':'], "-");
    format!("device-{}", text)
}

/// One provisioning request.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub device_id: String,
    pub csr: Vec<u8>,
    /// Revoke a live identity and issue a new one.
    pub force: bool,
    /// Reject re-provisioning of a live identity instead of returning it.
    pub strict: bool,
    pub address: Option<IpAddr>,
    /// Extra CSR subjects accepted for this device besides its id.
    pub accepted_subjects: Vec<String>,
}

impl IssueRequest {
    pub fn new(device_id: impl Into<String>, csr: impl Into<Vec<u8>>) -> Self {
        Self {
            device_id: device_id.into(),
            csr: csr.into(),
            force: false,
            strict: false,
            address: None,
            accepted_subjects: Vec::new(),
        }
    }

    /// Request keyed by network address; the device id is derived from it and
    /// the bare address is also accepted as CSR subject.
    pub fn for_address(address: IpAddr, csr: impl Into<Vec<u8>>) -> Self {
        Self::new(derive_device_id(address), csr)
            .at_address(address)
            .accept_subject(address.to_string())
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn at_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn accept_subject(mut self, subject: impl Into<String>) -> Self {
        self.accepted_subjects.push(subject.into());
        self
    }

    fn accepts_subject(&self, subject: &str) -> bool {
        subject == self.device_id || self.accepted_subjects.iter().any(|s| s == subject)
    }
}

/// Tunables for the authority.
#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    pub validity_days: u32,
    pub signing_timeout: Duration,
    pub delivery_timeout: Duration,
    /// Applies strict re-provisioning to every request.
    pub strict_reprovisioning: bool,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            validity_days: DEFAULT_VALIDITY_DAYS,
            signing_timeout: DEFAULT_BACKEND_TIMEOUT,
            delivery_timeout: DEFAULT_BACKEND_TIMEOUT,
            strict_reprovisioning: false,
        }
    }
}

/// Issues, revokes and redelivers device identities.
pub struct IssuanceAuthority {
    store: Arc<KeyedStore<DeviceIdentity>>,
    signer: Arc<dyn CsrSigner>,
    parser: Arc<dyn CertificateParser>,
    delivery: Option<Arc<dyn CertificateDelivery>>,
    gate: IssuanceGate,
    settings: IssuanceSettings,
}

impl IssuanceAuthority {
    pub fn new(
        store: Arc<KeyedStore<DeviceIdentity>>,
        signer: Arc<dyn CsrSigner>,
        parser: Arc<dyn CertificateParser>,
        delivery: Option<Arc<dyn CertificateDelivery>>,
        settings: IssuanceSettings,
    ) -> Self {
        Self {
            store,
            signer,
            parser,
            delivery,
            gate: IssuanceGate::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<KeyedStore<DeviceIdentity>> {
        &self.store
    }

    /// Issue an identity for `request.device_id`, exactly once.
    ///
    /// A live identity is returned unchanged unless `force` is set (or
    /// rejected when strict). Callers racing on one id queue behind the one
    /// that signs and receive its result.
    pub fn issue(&self, request: &IssueRequest) -> Result<DeviceIdentity, IssuanceError> {
        let device_id = request.device_id.as_str();
        let ctx = LogContext::new("prov").with_device(device_id);

        validate_device_id(device_id)?;
        let csr = inspect_csr(&request.csr).map_err(|e| {
            log::warn!("{} CSR_REJECTED reason={}", ctx, e);
            e
        })?;
        if !request.accepts_subject(&csr.common_name) {
            log::warn!("{} CSR_SUBJECT_MISMATCH subject={}", ctx, csr.common_name);
            return Err(IssuanceError::SubjectMismatch {
                expected: device_id.to_string(),
                found: csr.common_name,
            });
        }

        log::debug!("{} ISSUANCE_WAIT_GATE", ctx);
        let _gate = self.gate.acquire(device_id);

        let existing = self.store.get(device_id);
        if let Some(current) = existing.as_ref().filter(|identity| identity.is_live()) {
            if !request.force {
                if request.strict || self.settings.strict_reprovisioning {
                    log::warn!("{} ISSUANCE_REJECTED reason=already_provisioned", ctx);
                    return Err(IssuanceError::AlreadyProvisioned {
                        device_id: device_id.to_string(),
                    });
                }
                log::info!(
                    "{} ISSUANCE_IDEMPOTENT serial={} delivery={:?}",
                    ctx,
                    current.serial,
                    current.delivery
                );
                return self.ensure_delivered(current.clone(), &ctx);
            }
            log::info!("{} ISSUANCE_FORCED previous_serial={}", ctx, current.serial);
        }

        let certificate_pem = self.sign_bounded(&request.csr, &csr.common_name, &ctx)?;
        let summary = self.parser.parse(&certificate_pem).map_err(|e| {
            log::error!("{} CERT_PARSE_FAILED error={}", ctx, e);
            IssuanceError::SigningFailure {
                reason: format!("signed certificate unreadable: {}", e),
            }
        })?;
        if summary.common_name != csr.common_name {
            log::error!(
                "{} CERT_SUBJECT_DRIFT requested={} signed={}",
                ctx,
                csr.common_name,
                summary.common_name
            );
            return Err(IssuanceError::SigningFailure {
                reason: format!(
                    "signer issued '{}' for subject '{}'",
                    summary.common_name, csr.common_name
                ),
            });
        }

        let now = Utc::now();
        let mut superseded = existing
            .as_ref()
            .map(|previous| previous.superseded.clone())
            .unwrap_or_default();
        if let Some(previous) = &existing {
            superseded.push(SupersededCertificate {
                serial: previous.serial.clone(),
                common_name: previous.certificate_common_name.clone(),
                revoked_at: previous.revoked_at.unwrap_or(now),
            });
        }

        let identity = DeviceIdentity {
            device_id: device_id.to_string(),
            certificate_common_name: summary.common_name,
            issued_at: now,
            certificate_validity_window: ValidityWindow {
                from: summary.valid_from,
                to: summary.valid_to,
            },
            revoked: false,
            revoked_at: None,
            key_status: true,
            certificate_status: true,
            serial: summary.serial,
            fingerprint_sha256: summary.fingerprint_sha256,
            certificate_pem: String::from_utf8_lossy(&certificate_pem).into_owned(),
            address: request
                .address
                .or_else(|| existing.as_ref().and_then(|previous| previous.address)),
            delivery: if self.delivery.is_some() {
                DeliveryState::Pending
            } else {
                DeliveryState::NotRequired
            },
            superseded,
        };

        // Single commit point: the old certificate becomes superseded in the
        // same write that installs the new one.
        self.store.put(device_id, identity.clone())?;
        log::info!(
            "{} IDENTITY_ISSUED cn={} serial={} valid_to={} key_sha256={}",
            ctx,
            identity.certificate_common_name,
            identity.serial,
            identity.certificate_validity_window.to.to_rfc3339(),
            csr.public_key_sha256
        );

        self.ensure_delivered(identity, &ctx)
    }

    /// Mark the live identity for `device_id` revoked.
    pub fn revoke(&self, device_id: &str) -> Result<DeviceIdentity, IssuanceError> {
        let ctx = LogContext::new("revoke").with_device(device_id);
        validate_device_id(device_id)?;
        let _gate = self.gate.acquire(device_id);

        let mut identity = self
            .store
            .get(device_id)
            .ok_or_else(|| IssuanceError::NotProvisioned {
                device_id: device_id.to_string(),
            })?;
        if identity.revoked {
            log::debug!("{} REVOKE_NOOP serial={}", ctx, identity.serial);
            return Ok(identity);
        }

        identity.revoked = true;
        identity.revoked_at = Some(Utc::now());
        self.store.put(device_id, identity.clone())?;
        log::info!("{} IDENTITY_REVOKED serial={}", ctx, identity.serial);
        Ok(identity)
    }

    /// Send the stored certificate for `device_id` again.
    pub fn redeliver(&self, device_id: &str) -> Result<DeviceIdentity, IssuanceError> {
        let ctx = LogContext::new("deliver").with_device(device_id);
        validate_device_id(device_id)?;
        let _gate = self.gate.acquire(device_id);

        let mut identity = self
            .store
            .get(device_id)
            .ok_or_else(|| IssuanceError::NotProvisioned {
                device_id: device_id.to_string(),
            })?;
        if identity.revoked {
            return Err(IssuanceError::Revoked {
                device_id: device_id.to_string(),
            });
        }
        if self.delivery.is_some() {
            identity.delivery = DeliveryState::Pending;
        }
        self.ensure_delivered(identity, &ctx)
    }

    fn sign_bounded(
        &self,
        csr: &[u8],
        subject_cn: &str,
        ctx: &LogContext,
    ) -> Result<Vec<u8>, IssuanceError> {
        let signer = Arc::clone(&self.signer);
        let csr = csr.to_vec();
        let subject = subject_cn.to_string();
        let validity_days = self.settings.validity_days;
        let timeout = self.settings.signing_timeout;

        log::debug!("{} SIGNING_START validity_days={}", ctx, validity_days);
        match run_with_deadline("sign", timeout, move || {
            signer.sign(&csr, &subject, validity_days)
        }) {
            Ok(Ok(pem)) => Ok(pem),
            Ok(Err(e)) => {
                log::warn!("{} SIGNING_FAILED error={}", ctx, e);
                Err(IssuanceError::SigningFailure { reason: e.0 })
            }
            Err(DeadlineError::Elapsed) => {
                log::warn!("{} SIGNING_TIMEOUT timeout={:?}", ctx, timeout);
                Err(IssuanceError::SigningTimeout { timeout })
            }
            Err(other) => {
                log::error!("{} SIGNING_BACKEND_LOST error={:?}", ctx, other);
                Err(IssuanceError::SigningFailure {
                    reason: format!("signing backend failed: {:?}", other),
                })
            }
        }
    }

    /// Deliver a pending certificate and record the delivery.
    fn ensure_delivered(
        &self,
        identity: DeviceIdentity,
        ctx: &LogContext,
    ) -> Result<DeviceIdentity, IssuanceError> {
        let Some(delivery) = self.delivery.as_ref() else {
            return Ok(identity);
        };
        if identity.delivery != DeliveryState::Pending {
            return Ok(identity);
        }

        let channel = Arc::clone(delivery);
        let device_id = identity.device_id.clone();
        let pem = identity.certificate_pem.clone().into_bytes();
        let timeout = self.settings.delivery_timeout;

        let failure = match run_with_deadline("deliver", timeout, move || {
            channel.deliver(&device_id, &pem)
        }) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.0),
            Err(DeadlineError::Elapsed) => Some(format!("delivery timed out after {:?}", timeout)),
            Err(other) => Some(format!("delivery backend failed: {:?}", other)),
        };

        if let Some(reason) = failure {
            log::warn!("{} DELIVERY_FAILED serial={} error={}", ctx, identity.serial, reason);
            return Err(IssuanceError::DeliveryFailure {
                device_id: identity.device_id,
                reason,
            });
        }

        let serial = identity.serial.clone();
        let stored = self.store.update(&identity.device_id, |current| {
            current.filter(|c| c.serial == serial).map(|c| DeviceIdentity {
                delivery: DeliveryState::Delivered,
                ..c.clone()
            })
        })?;
        log::info!("{} CERT_DELIVERED serial={}", ctx, serial);

        Ok(stored.unwrap_or(DeviceIdentity {
            delivery: DeliveryState::Delivered,
            ..identity
        }))
    }
}
