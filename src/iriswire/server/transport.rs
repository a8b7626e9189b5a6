//! Socket plumbing: the boxed stream type used by connection handlers
//! (plaintext or TLS) and TLS acceptor construction from the configured
//! certificate and key files.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::iriswire::config::TlsSettings;
use crate::iriswire::{Error, Result};

/// A duplex byte stream a connection handler can own, regardless of
/// whether the SSL upgrade happened.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

pub fn build_tls_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(&settings.cert)?))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::config(format!("cannot read tls cert: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::config("tls cert file contains no certificates"));
    }
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(&settings.key)?))
            .map_err(|e| Error::config(format!("cannot read tls key: {}", e)))?
            .ok_or_else(|| Error::config("tls key file contains no private key"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
