//! Per-request TLS verification policy.
//!
//! Translates a request's `skip_tls_checks` set into a `rustls::ClientConfig`
//! for the upstream connection. Strict verification is the default and rides
//! on the HTTP client's built-in TLS; this module only builds the permissive
//! configurations, and every one of them is constructed fresh for its request
//! so a relaxed posture never bleeds into later calls.
//!
//! `all` installs a verifier that accepts anything. Any smaller set installs
//! a verifier that runs full WebPKI verification and forgives exactly the
//! selected failure classes, so e.g. `expired_cert` still rejects an
//! untrusted issuer.

use std::sync::{Arc, OnceLock};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    pki_types::{CertificateDer, ServerName, UnixTime},
};

use crate::{error::ProxyError, params::SkipTlsChecks};

/// Build the client configuration for a request that asked to skip one or
/// more verification checks. Callers must not cache the result.
pub fn permissive_config(skip: &SkipTlsChecks) -> Result<ClientConfig, ProxyError> {
    let verifier: Arc<dyn ServerCertVerifier> = if skip.all {
        Arc::new(AcceptAnyServerCert)
    } else {
        Arc::new(ForgivingVerifier {
            inner: webpki_verifier()?,
            skip: *skip,
        })
    };
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    // The relay speaks HTTP/1.1 on both sides.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// The platform trust store, loaded once.
fn webpki_verifier() -> Result<Arc<WebPkiServerVerifier>, ProxyError> {
    static VERIFIER: OnceLock<Option<Arc<WebPkiServerVerifier>>> = OnceLock::new();
    VERIFIER
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            let result = rustls_native_certs::load_native_certs();
            for error in &result.errors {
                tracing::warn!(error = %error, "skipping unreadable platform root certificate");
            }
            let (added, ignored) = roots.add_parsable_certificates(result.certs);
            tracing::debug!(added, ignored, "loaded platform trust store");
            WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| {
                    tracing::error!(error = %e, "platform trust store unusable");
                    e
                })
                .ok()
        })
        .clone()
        .ok_or_else(|| ProxyError::Internal("platform trust store unavailable".into()))
}

/// Delegates to WebPKI verification and forgives the failure classes the
/// request selected.
#[derive(Debug)]
struct ForgivingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    skip: SkipTlsChecks,
}

/// Whether `skip` forgives this particular certificate failure.
fn forgiven(skip: &SkipTlsChecks, error: &rustls::CertificateError) -> bool {
    use rustls::CertificateError;
    match error {
        CertificateError::Expired
        | CertificateError::ExpiredContext { .. }
        | CertificateError::NotValidYet
        | CertificateError::NotValidYetContext { .. } => skip.forgives_expiry(),
        CertificateError::NotValidForName
        | CertificateError::NotValidForNameContext { .. } => skip.forgives_hostname(),
        CertificateError::UnknownIssuer => skip.forgives_unknown_issuer(),
        _ => false,
    }
}

impl ServerCertVerifier for ForgivingVerifier {
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
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(cert_error))
                if forgiven(&self.skip, &cert_error) =>
            {
                tracing::debug!(error = ?cert_error, "certificate failure forgiven per request");
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => Err(e),
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

/// Verifier for `skip_tls_checks=all`: no chain validation, no validity
/// window, no hostname check, and signature checks waved through.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use rustls::CertificateError;

    use super::*;

    #[test]
    fn all_builds_accept_any_config() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let config = permissive_config(&SkipTlsChecks::everything()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn expiry_tokens_forgive_only_validity_window() {
        let skip = SkipTlsChecks::parse("expired_cert");
        assert!(forgiven(&skip, &CertificateError::Expired));
        assert!(forgiven(&skip, &CertificateError::NotValidYet));
        assert!(!forgiven(&skip, &CertificateError::UnknownIssuer));
        assert!(!forgiven(&skip, &CertificateError::NotValidForName));
    }

    #[test]
    fn issuer_tokens_forgive_unknown_issuer() {
        for list in ["self_signed", "cert_authority", "self_signed,cert_authority"] {
            let skip = SkipTlsChecks::parse(list);
            assert!(forgiven(&skip, &CertificateError::UnknownIssuer), "{list}");
            assert!(!forgiven(&skip, &CertificateError::Expired), "{list}");
        }
    }

    #[test]
    fn hostname_token_forgives_name_mismatch() {
        let skip = SkipTlsChecks::parse("hostname_mismatch");
        assert!(forgiven(&skip, &CertificateError::NotValidForName));
        assert!(!forgiven(&skip, &CertificateError::UnknownIssuer));
    }

    #[test]
    fn revocation_is_never_forgiven_granularly() {
        let skip = SkipTlsChecks::parse("expired_cert,self_signed,hostname_mismatch");
        assert!(!forgiven(&skip, &CertificateError::Revoked));
        assert!(!forgiven(&skip, &CertificateError::BadSignature));
    }
}
