use std::fs;
use std::io;
use std::io::BufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pkcs8::{EncryptedPrivateKeyInfo, SecretDocument};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use rustls_pemfile::Item;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::warn;

use grid_core::config::network::SslConfig;
use grid_core::error::ClientError;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Builds the rustls client config for `ssl`, or `None` when ssl is disabled.
/// Every piece of configured material is loaded up front so a broken setup
/// fails before the first connection attempt.
pub fn client_config(ssl: &SslConfig) -> Result<Option<Arc<ClientConfig>>, ClientError> {
    if !ssl.enabled {
        if ssl.ca_path.is_some() || ssl.is_mutual() {
            warn!("ssl material is configured but ssl is disabled, connecting in plaintext");
        }
        return Ok(None);
    }
    let ca_path = ssl
        .ca_path
        .as_ref()
        .ok_or(ClientError::TlsConfig("ssl is enabled but no ca_path is configured".to_string()))?;
    let roots = load_roots(ca_path)?;
    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);
    let config = match (&ssl.cert_path, &ssl.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path, ssl.key_passphrase.as_deref())?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::TlsConfig(format!("invalid client certificate or key: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ClientError::TlsConfig(
                "cert_path and key_path must be configured together".to_string(),
            ));
        }
    };
    Ok(Some(Arc::new(config)))
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>, ClientError> {
    fs::read(path).map_err(|e| ClientError::TlsConfig(format!("read {} {} error {}", what, path.display(), e)))
}

pub fn load_certs(path: &Path) -> Result<Vec<Certificate>, ClientError> {
    let pem = read_file(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .map_err(|e| ClientError::TlsConfig(format!("parse certificate {} error {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(ClientError::TlsConfig(format!("no certificate found in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

pub fn load_roots(path: &Path) -> Result<RootCertStore, ClientError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(&cert)
            .map_err(|e| ClientError::TlsConfig(format!("invalid ca certificate in {}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, ClientError> {
    let pem = read_file(path, "private key")?;
    let text = String::from_utf8_lossy(&pem);
    if text.contains(ENCRYPTED_KEY_LABEL) {
        let passphrase = passphrase.ok_or(ClientError::TlsConfig(format!(
            "private key {} is encrypted but no key_passphrase is configured",
            path.display()
        )))?;
        return decrypt_private_key(&text, passphrase)
            .map_err(|e| ClientError::TlsConfig(format!("decrypt private key {} error {}", path.display(), e)));
    }
    if passphrase.is_some() {
        warn!("key_passphrase is set but private key {} is not encrypted", path.display());
    }
    let items = rustls_pemfile::read_all(&mut BufReader::new(pem.as_slice()))
        .map_err(|e| ClientError::TlsConfig(format!("parse private key {} error {}", path.display(), e)))?;
    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or(ClientError::TlsConfig(format!("no private key found in {}", path.display())))
}

fn decrypt_private_key(pem: &str, passphrase: &str) -> anyhow::Result<PrivateKey> {
    let (label, document) = SecretDocument::from_pem(pem).map_err(|e| anyhow::anyhow!("{}", e))?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(anyhow::anyhow!("unexpected pem label {}", label));
    }
    let info = EncryptedPrivateKeyInfo::try_from(document.as_bytes()).map_err(|e| anyhow::anyhow!("{}", e))?;
    let decrypted = info.decrypt(passphrase).map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(PrivateKey(decrypted.as_bytes().to_vec()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use grid_core::config::network::SslConfig;
    use grid_core::error::ClientError;

    use crate::tls::{client_config, load_private_key};

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name)
    }

    fn mutual() -> SslConfig {
        SslConfig {
            enabled: true,
            ca_path: Some(fixture("cert.pem")),
            cert_path: Some(fixture("cert.pem")),
            key_path: Some(fixture("key.pem")),
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled() -> anyhow::Result<()> {
        assert!(client_config(&SslConfig::default())?.is_none());
        Ok(())
    }

    #[test]
    fn test_enabled_without_ca_fails() {
        let ssl = SslConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(client_config(&ssl), Err(ClientError::TlsConfig(_))));
    }

    #[test]
    fn test_missing_material_fails() {
        let ssl = SslConfig {
            key_path: Some(fixture("missing.pem")),
            ..mutual()
        };
        assert!(matches!(client_config(&ssl), Err(ClientError::TlsConfig(_))));
        let ssl = SslConfig {
            key_path: None,
            ..mutual()
        };
        assert!(matches!(client_config(&ssl), Err(ClientError::TlsConfig(_))));
    }

    #[test]
    fn test_mutual_config() -> anyhow::Result<()> {
        assert!(client_config(&mutual())?.is_some());
        Ok(())
    }

    #[test]
    fn test_encrypted_key() -> anyhow::Result<()> {
        let plain = load_private_key(&fixture("key.pem"), None)?;
        let decrypted = load_private_key(&fixture("key-encrypted.pem"), Some("changeit"))?;
        assert_eq!(plain, decrypted);
        assert!(load_private_key(&fixture("key-encrypted.pem"), Some("wrong")).is_err());
        assert!(matches!(
            load_private_key(&fixture("key-encrypted.pem"), None),
            Err(ClientError::TlsConfig(_))
        ));
        let ssl = SslConfig {
            key_path: Some(fixture("key-encrypted.pem")),
            key_passphrase: Some("changeit".to_string()),
            ..mutual()
        };
        assert!(client_config(&ssl)?.is_some());
        Ok(())
    }
}
