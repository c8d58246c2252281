//! TLS client configuration for the STLS upgrade and pairing channels.
//!
//! Wireless-debugging peers present self-signed certificates; trust is
//! established out of band through pairing, not through WebPKI. The client
//! therefore accepts any server certificate and instead presents its own
//! RSA certificate so the peer can match it against its paired-key store.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::error::{ProtocolError, Result};
use crate::keys::KeyMaterial;

/// Builds a TLS 1.3 client configuration with server verification disabled
/// and our key material as the client identity.
pub fn client_config(key: &KeyMaterial) -> Result<ClientConfig> {
    let provider = Arc::new(ring::default_provider());
    let verifier = Arc::new(AcceptAnyServerCert::new(&provider));
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ProtocolError::Tls(format!("protocol version setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(
            vec![key.certificate_der()],
            key.private_key_der().into(),
        )
        .map_err(|e| ProtocolError::Tls(format!("client identity setup failed: {e}")))?;
    Ok(config)
}

/// Certificate verifier that accepts whatever the peer presents.
///
/// Signature checks are skipped along with chain validation: the channel's
/// authenticity comes from the pairing secret, and a forged certificate
/// buys an attacker nothing they could not get from a plain socket.
#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider.signature_verification_algorithms.supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
