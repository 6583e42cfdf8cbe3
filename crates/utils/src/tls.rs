use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    server::ServerSessionMemoryCache,
    ServerConfig,
};
use rustls_pemfile::certs;

use std::{error::Error, fs::File, io::BufReader};

/// Loads the `STARTTLS` server configuration from a PEM certificate chain
/// and a PEM private key.
pub fn load_tls_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<ServerConfig, Box<dyn Error + Send + Sync>> {
    let (cert_chain, key) = load_chain_and_key(cert_path, key_path)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    // resumption for clients reconnecting for another message
    config.session_storage = ServerSessionMemoryCache::new(256);
    Ok(config)
}

fn load_chain_and_key(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Box<dyn Error + Send + Sync>>
{
    let cert_file = &mut BufReader::new(File::open(cert_path)?);
    let cert_chain = certs(cert_file)?
        .into_iter()
        .map(CertificateDer::from)
        .collect::<Vec<_>>();
    if cert_chain.is_empty() {
        return Err(format!("no certificates found in {cert_path}").into());
    }

    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| format!("invalid private key {key_path}: {e}"))?;

    Ok((cert_chain, key))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_missing_certificate() {
        let result = load_tls_server_config("missing/cert.pem", "missing/key.pem");
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_certificate_chain() {
        let mut cert = NamedTempFile::new().unwrap();
        writeln!(cert, "not a pem file").unwrap();
        let path = cert.path().to_str().unwrap();

        let error = load_tls_server_config(path, "missing/key.pem").unwrap_err();
        assert!(error.to_string().starts_with("no certificates found"));
    }
}
