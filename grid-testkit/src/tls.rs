use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TlsMode {
    /// Server authentication only.
    Server,
    /// Members also require a client certificate.
    Mutual,
}

/// Self signed certificates written to a scratch directory. The member
/// certificate doubles as the CA clients trust.
pub struct TlsMaterial {
    pub mode: TlsMode,
    pub dir: PathBuf,
    pub ca_path: PathBuf,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    server_config: Arc<ServerConfig>,
}

impl TlsMaterial {
    pub fn generate(mode: TlsMode) -> anyhow::Result<Self> {
        let dir = std::env::temp_dir().join(format!("grid-testkit-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&dir)?;
        let member = rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
        let ca_path = dir.join("ca.pem");
        fs::write(&ca_path, member.serialize_pem()?)?;
        let chain = vec![Certificate(member.serialize_der()?)];
        let key = PrivateKey(member.serialize_private_key_der());
        let builder = ServerConfig::builder().with_safe_defaults();
        let (server_config, client_cert_path, client_key_path) = match mode {
            TlsMode::Server => (builder.with_no_client_auth().with_single_cert(chain, key)?, None, None),
            TlsMode::Mutual => {
                let client = rcgen::generate_simple_self_signed(vec!["grid-client".to_string()])?;
                let cert_path = dir.join("client.pem");
                let key_path = dir.join("client-key.pem");
                fs::write(&cert_path, client.serialize_pem()?)?;
                fs::write(&key_path, client.serialize_private_key_pem())?;
                let mut roots = RootCertStore::empty();
                roots.add(&Certificate(client.serialize_der()?))?;
                let config = builder
                    .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
                    .with_single_cert(chain, key)?;
                (config, Some(cert_path), Some(key_path))
            }
        };
        Ok(Self {
            mode,
            dir,
            ca_path,
            client_cert_path,
            client_key_path,
            server_config: Arc::new(server_config),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }

    /// A CA unrelated to the member certificate.
    pub fn untrusted_ca(&self) -> anyhow::Result<PathBuf> {
        let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let path = self.dir.join(format!("untrusted-{}.pem", Uuid::new_v4().simple()));
        fs::write(&path, other.serialize_pem()?)?;
        Ok(path)
    }
}

impl Drop for TlsMaterial {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}
