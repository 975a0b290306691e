//! TLS termination for the listener side.

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use wsmesh_core::{MeshError, MeshResult};

/// Load TLS certificate and key from PEM files and build an acceptor.
pub fn load_tls_acceptor(key_path: &Path, cert_path: &Path) -> MeshResult<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| MeshError::Config(format!("cannot read cert {}: {e}", cert_path.display())))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| MeshError::Config(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MeshError::Config(format!("bad cert PEM: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| MeshError::Config(format!("bad key PEM: {e}")))?
        .ok_or_else(|| MeshError::Config("no private key found in PEM".into()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| MeshError::Config(format!("TLS config: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
