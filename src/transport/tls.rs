//! Encrypting transport layer (rustls).
//!
//! Trust roots are the webpki set plus an optional PEM CA bundle; a client
//! certificate/key pair is presented when configured.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{Layer, Transport};
use crate::config::TlsOptions;
use crate::error::{NsqError, Result};

/// Build a connector from TLS options.
pub fn build_tls_connector(options: &TlsOptions) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca_file) = &options.ca_file {
        for cert in load_certs(ca_file)? {
            roots.add(cert)?;
        }
    }

    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots);

    let config = match (&options.cert_file, &options.key_file) {
        (Some(cert_file), Some(key_file)) => {
            builder.with_client_auth_cert(load_certs(cert_file)?, load_key(key_file)?)?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(NsqError::Configuration(
                "TLS client certificate and key must be given together".to_string(),
            ))
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(NsqError::Configuration(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        NsqError::Configuration(format!("no private key found in {}", path.display()))
    })
}

impl Transport {
    /// Run a TLS handshake over the current stream.
    ///
    /// Must happen before any compression layer is installed.
    pub async fn upgrade_tls(self, connector: &TlsConnector, server_name: &str) -> Result<Self> {
        if self.is_encrypted() {
            return Err(NsqError::Configuration("TLS already installed".to_string()));
        }
        if self.is_compressed() {
            return Err(NsqError::Configuration(
                "TLS must be installed before compression".to_string(),
            ));
        }
        let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            NsqError::Configuration(format!("invalid TLS server name {:?}: {}", server_name, e))
        })?;

        let Transport { stream, layers } = self;
        let tls = connector.connect(name, stream).await?;
        debug!(server_name, "tls handshake complete");
        Ok(Transport::wrapped(tls, layers, Layer::Tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawCodec;
    use tokio::io::duplex;

    #[test]
    fn test_default_connector_builds() {
        assert!(build_tls_connector(&TlsOptions::default()).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_io_error() {
        let options = TlsOptions {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(build_tls_connector(&options), Err(NsqError::Io(_))));
    }

    #[test]
    fn test_half_client_identity_rejected() {
        let options = TlsOptions {
            key_file: Some("client.key".into()),
            ..Default::default()
        };
        assert!(matches!(
            build_tls_connector(&options),
            Err(NsqError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_tls_after_compression_rejected() {
        let (client, _server) = duplex(1024);
        let transport = Transport::new(client).install_codec(RawCodec).unwrap();
        let connector = build_tls_connector(&TlsOptions::default()).unwrap();
        let result = transport.upgrade_tls(&connector, "localhost").await;
        assert!(matches!(result, Err(NsqError::Configuration(_))));
    }
}
