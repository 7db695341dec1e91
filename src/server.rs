//! C2S listener: accepts TCP connections and spawns a stream per client.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::C2sConfig;
use crate::error::XmppError;
use crate::router::Router;
use crate::storage::Storage;
use crate::stream::Stream;
use crate::transport::SocketTransport;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Domains served by this process; the first is the default
    pub domains: Vec<String>,
    /// TLS certificate chain path (PEM)
    pub tls_cert_path: String,
    /// TLS private key path (PEM, PKCS#8)
    pub tls_key_path: String,
    /// Per-stream engine configuration
    pub c2s: C2sConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domains: vec!["localhost".to_string()],
            tls_cert_path: "certs/server.crt".to_string(),
            tls_key_path: "certs/server.key".to_string(),
            c2s: C2sConfig::default(),
        }
    }
}

/// C2S server instance.
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
    tls_acceptor: TlsAcceptor,
    listener: TcpListener,
    shutdown_token: tokio_util::sync::CancellationToken,
}

impl Server {
    /// Create a server over a pre-bound listener.
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        listener: TcpListener,
        shutdown_token: tokio_util::sync::CancellationToken,
    ) -> Result<Self, XmppError> {
        let tls_acceptor = load_tls_config(&config)?;
        let router = Arc::new(Router::new(config.domains.clone(), Arc::clone(&storage)));
        Ok(Self {
            config,
            router,
            storage,
            tls_acceptor,
            listener,
            shutdown_token,
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Accept connections until the shutdown token fires.
    pub async fn run(self) -> Result<(), XmppError> {
        let addr = self.listener.local_addr().ok();
        info!(addr = ?addr, domain = %self.config.domains[0], "C2S server listening");

        loop {
            let (tcp, peer_addr) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = self.shutdown_token.cancelled() => {
                    info!("Accept loop stopped");
                    return Ok(());
                }
            };

            info!(peer = %peer_addr, "New C2S connection");
            let transport = SocketTransport::new(tcp, self.tls_acceptor.clone());
            Stream::spawn(
                Box::new(transport),
                Arc::clone(&self.router),
                Arc::clone(&self.storage),
                self.config.c2s.clone(),
            );
        }
    }
}

/// Load the TLS acceptor from the configured certificate and key files.
fn load_tls_config(config: &ServerConfig) -> Result<TlsAcceptor, XmppError> {
    use rustls_pemfile::{certs, pkcs8_private_keys};
    use std::fs::File;
    use std::io::BufReader;
    use tokio_rustls::rustls::{pki_types::PrivateKeyDer, ServerConfig as TlsServerConfig};

    let cert_file = File::open(&config.tls_cert_path).map_err(|e| {
        XmppError::config(format!(
            "Failed to open cert file {}: {}",
            config.tls_cert_path, e
        ))
    })?;
    let key_file = File::open(&config.tls_key_path).map_err(|e| {
        XmppError::config(format!(
            "Failed to open key file {}: {}",
            config.tls_key_path, e
        ))
    })?;

    let certs: Vec<_> = certs(&mut BufReader::new(cert_file))
        .filter_map(|r| r.ok())
        .collect();
    let keys: Vec<_> = pkcs8_private_keys(&mut BufReader::new(key_file))
        .filter_map(|r| r.ok())
        .collect();
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let tls_config = TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
        .map_err(|e| XmppError::config(format!("TLS config error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
