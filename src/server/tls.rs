//! TLS - Terminazione TLS per il listener del server
//!
//! `TlsListener` esegue gli handshake in task separati, così un client lento
//! non blocca l'accept degli altri.

use crate::core::config::ServerConfig;
use crate::core::error::ServerError;
use axum::serve::Listener;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

async fn read_pem(path: Option<&Path>, what: &str) -> Result<Vec<u8>, ServerError> {
    let path = path.ok_or_else(|| ServerError::Tls(format!("{} path not configured", what)))?;
    tokio::fs::read(path)
        .await
        .map_err(|e| ServerError::Tls(format!("cannot read {} {}: {}", what, path.display(), e)))
}

/// Costruisce l'acceptor dai file PEM indicati in configurazione
pub async fn load_tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_pem = read_pem(config.tls_cert_path.as_deref(), "certificate").await?;
    let key_pem = read_pem(config.tls_key_path.as_deref(), "private key").await?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("invalid certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(ServerError::Tls("no certificate found in PEM file".to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| ServerError::Tls(format!("invalid private key: {}", e)))?
        .ok_or_else(|| ServerError::Tls("no private key found in PEM file".to_string()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

type Handshake = Option<(TlsStream<TcpStream>, SocketAddr)>;

pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    handshakes: JoinSet<Handshake>,
    handshake_timeout: Duration,
}

impl TlsListener {
    pub fn new(inner: TcpListener, acceptor: TlsAcceptor, handshake_timeout: Duration) -> Self {
        Self {
            inner,
            acceptor,
            handshakes: JoinSet::new(),
            handshake_timeout,
        }
    }

    fn start_handshake(&mut self, stream: TcpStream, addr: SocketAddr) {
        let acceptor = self.acceptor.clone();
        let limit = self.handshake_timeout;
        self.handshakes.spawn(async move {
            match timeout(limit, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => Some((tls, addr)),
                Ok(Err(e)) => {
                    debug!(%addr, "TLS handshake failed: {}", e);
                    None
                }
                Err(_) => {
                    debug!(%addr, "TLS handshake timed out");
                    None
                }
            }
        });
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, addr)) => self.start_handshake(stream, addr),
                    Err(e) => {
                        // es. troppi file aperti: si riprova dopo una pausa
                        warn!("TCP accept failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Some(done) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {
                    if let Ok(Some(established)) = done {
                        return established;
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}
