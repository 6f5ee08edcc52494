use anyhow::{Context, Result, anyhow};
use rustls_pemfile::{certs, private_key};
use std::{fs::File, io::BufReader, sync::Arc};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, ServerName, UnixTime},
};

use crate::config::TlsConfig;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

pub fn load_tls_config(tls_config: &TlsConfig) -> Result<rustls::ServerConfig> {
    let cert_file = File::open(&tls_config.cert_file)
        .with_context(|| format!("Failed to open certificate file: {}", tls_config.cert_file))?;
    let key_file = File::open(&tls_config.key_file)
        .with_context(|| format!("Failed to open private key file: {}", tls_config.key_file))?;

    let cert_chain = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate file")?;

    if cert_chain.is_empty() {
        return Err(anyhow!("No certificates found in certificate file"));
    }

    let private_key = private_key(&mut BufReader::new(key_file))
        .context("Failed to parse private key file")?
        .ok_or_else(|| anyhow!("No private key found in key file"))?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .context("Failed to create TLS server config")?;

    Ok(config)
}

/// Client configuration trusting the webpki roots plus an optional extra CA.
///
/// With `insecure_skip_verify` the server certificate is not checked at all.
pub fn load_client_tls_config(
    ca_cert: Option<&str>,
    insecure_skip_verify: bool,
) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?;

    if insecure_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification(provider())))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_cert {
        let file =
            File::open(path).with_context(|| format!("Failed to open CA certificate: {path}"))?;
        let extra = certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse CA certificate")?;
        if extra.is_empty() {
            return Err(anyhow!("No certificates found in CA file {path}"));
        }
        let (added, _) = roots.add_parsable_certificates(extra);
        if added == 0 {
            return Err(anyhow!("No usable certificates in CA file {path}"));
        }
    }

    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

#[derive(Debug)]
struct SkipVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_file_is_reported() {
        let err = load_tls_config(&TlsConfig {
            cert_file: "/nonexistent/cert.pem".into(),
            key_file: "/nonexistent/key.pem".into(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("certificate file"));
    }

    #[test]
    fn client_config_without_extra_ca() {
        assert!(load_client_tls_config(None, false).is_ok());
        assert!(load_client_tls_config(None, true).is_ok());
    }

    #[test]
    fn missing_ca_file_is_reported() {
        assert!(load_client_tls_config(Some("/nonexistent/ca.pem"), false).is_err());
    }
}
