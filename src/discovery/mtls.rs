//! mTLS handshake probe.
//!
//! Connects to a device, presents the engine's client certificate and
//! validates the device's certificate against the engine CA. Device
//! certificates name a device id rather than an address, so name mismatches
//! are tolerated; chain and signature checks are not.

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use x509_parser::prelude::parse_x509_certificate;

use super::{HandshakeProbe, ProbeOutcome};
use crate::issuance::{CaError, ClientIdentity};

/// Upper bound on the post-handshake read that catches a client-cert rejection.
const ALERT_WAIT: Duration = Duration::from_millis(300);

/// Default `HandshakeProbe`, backed by rustls.
#[derive(Debug, Clone)]
pub struct MtlsProber {
    config: Arc<ClientConfig>,
}

impl MtlsProber {
    pub fn new(identity: &ClientIdentity) -> Result<Self, CaError> {
        let provider = Arc::new(ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from(identity.ca_certificate_der.clone()))
            .map_err(tls_error)?;
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .map_err(|e| CaError::Crypto(e.to_string()))?;

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeviceCertVerifier { inner: verifier }))
            .with_client_auth_cert(
                vec![CertificateDer::from(identity.certificate_der.clone())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.private_key_der.clone())),
            )
            .map_err(tls_error)?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    fn handshake(&self, ip: IpAddr, port: u16, timeout: Duration) -> Result<ProbeOutcome, String> {
        let started = Instant::now();
        let mut socket = TcpStream::connect_timeout(&SocketAddr::new(ip, port), timeout)
            .map_err(|e| format!("connect: {}", e))?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        socket
            .set_read_timeout(Some(timeout))
            .and_then(|_| socket.set_write_timeout(Some(timeout)))
            .map_err(|e| format!("socket: {}", e))?;

        let mut conn = ClientConnection::new(Arc::clone(&self.config), ServerName::IpAddress(ip.into()))
            .map_err(|e| format!("tls setup: {}", e))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut socket)
                .map_err(|e| format!("handshake: {}", e))?;
        }

        // TLS 1.3 servers judge the client certificate after our Finished;
        // a rejection arrives as an alert on the first read.
        socket
            .set_read_timeout(Some(ALERT_WAIT.min(timeout)))
            .map_err(|e| format!("socket: {}", e))?;
        let mut buf = [0u8; 1];
        match rustls::Stream::new(&mut conn, &mut socket).read(&mut buf) {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(format!("client certificate rejected: {}", e)),
        }

        let peer_common_name = conn
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|cert| common_name(cert.as_ref()));
        Ok(ProbeOutcome::accepted(peer_common_name, latency_ms))
    }
}

impl HandshakeProbe for MtlsProber {
    fn probe(&self, ip: IpAddr, port: u16, timeout: Duration) -> ProbeOutcome {
        match self.handshake(ip, port, timeout) {
            Ok(outcome) => {
                log::debug!(
                    "MTLS_ACCEPTED ip={} port={} peer_cn={:?}",
                    ip,
                    port,
                    outcome.peer_common_name
                );
                outcome
            }
            Err(reason) => {
                log::debug!("MTLS_REJECTED ip={} port={} reason={}", ip, port, reason);
                ProbeOutcome::rejected(reason)
            }
        }
    }
}

/// Chain validation against the engine CA, ignoring the server name.
#[derive(Debug)]
struct DeviceCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for DeviceCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(e)) if is_name_mismatch(&e) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn is_name_mismatch(error: &CertificateError) -> bool {
    matches!(
        error,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = parse_x509_certificate(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

fn tls_error(e: rustls::Error) -> CaError {
    CaError::Crypto(e.to_string())
}
