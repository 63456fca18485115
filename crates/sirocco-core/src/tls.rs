//! TLS termination: certificate loading (file path or inline PEM) and the
//! ALPN-aware acceptor.

use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsConfig;

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// Negotiated application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    Http1,
    H2,
}

/// Build the acceptor. ALPN advertises `h2` first when HTTP/2 is enabled,
/// then `http/1.1`.
pub fn acceptor(cfg: &TlsConfig, http2: bool) -> Result<TlsAcceptor> {
    let certs = load_certs(cfg)?;
    let key = load_key(cfg)?;

    let mut server_config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("invalid certificate/key pair: {e}")))?;

    server_config.alpn_protocols = if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// ALPN chosen during the handshake; absent negotiation means HTTP/1.1.
pub fn negotiated<IO>(stream: &tokio_rustls::server::TlsStream<IO>) -> Alpn {
    let (_, session) = stream.get_ref();
    match session.alpn_protocol() {
        Some(proto) if proto == b"h2" => Alpn::H2,
        _ => Alpn::Http1,
    }
}

fn pem_reader(path: Option<&str>, inline: Option<&str>, what: &str) -> Result<Vec<u8>> {
    match (inline, path) {
        (Some(pem), _) => Ok(pem.as_bytes().to_vec()),
        (None, Some(path)) => std::fs::read(path)
            .map_err(|e| Error::Tls(format!("cannot read {what} from {path}: {e}"))),
        (None, None) => Err(Error::Tls(format!("no {what} configured"))),
    }
}

fn load_certs(cfg: &TlsConfig) -> Result<Vec<CertificateDer<'static>>> {
    let raw = pem_reader(cfg.cert_path.as_deref(), cfg.cert_pem.as_deref(), "certificate")?;
    let mut reader = BufReader::new(raw.as_slice());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Tls(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("certificate PEM contains no certificates".into()));
    }
    Ok(certs)
}

fn load_key(cfg: &TlsConfig) -> Result<PrivateKeyDer<'static>> {
    let raw = pem_reader(cfg.key_path.as_deref(), cfg.key_pem.as_deref(), "private key")?;
    let mut reader = BufReader::new(raw.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| Error::Tls("key PEM contains no private key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_material_is_a_config_error() {
        let cfg = TlsConfig::default();
        assert!(matches!(acceptor(&cfg, false), Err(Error::Tls(_))));
    }

    #[test]
    fn garbage_pem_rejected() {
        let cfg = TlsConfig {
            cert_pem: Some("not a pem".into()),
            key_pem: Some("also not a pem".into()),
            ..Default::default()
        };
        assert!(acceptor(&cfg, true).is_err());
    }
}
