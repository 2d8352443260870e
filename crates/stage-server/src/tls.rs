//! TLS material loading for the signaling listener.

use crate::errors::StageError;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;

/// Load a rustls server configuration from PEM certificate/key paths.
///
/// # Errors
///
/// Returns `StageError::Config` if the files cannot be read or parsed, or
/// if the certificate/key pair is rejected.
pub fn load_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<Arc<rustls::ServerConfig>, StageError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| StageError::Config(format!("failed to read {cert_path}: {e}")))?
        .collect::<Result<_, _>>()
        .map_err(|e| StageError::Config(format!("failed to parse {cert_path}: {e}")))?;

    if certs.is_empty() {
        return Err(StageError::Config(format!(
            "no certificates found in {cert_path}"
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| StageError::Config(format!("failed to read {key_path}: {e}")))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| StageError::Config(format!("invalid TLS certificate/key pair: {e}")))?;

    Ok(Arc::new(config))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_surface_config_error() {
        let result = load_server_config("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(result, Err(StageError::Config(_))));
    }
}
