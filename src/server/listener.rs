//! HTTPS listener: TCP keep-alive plus TLS termination with an explicit
//! accept loop, so the owning server keeps a handle to the listener and
//! can be shut down externally.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use slog_scope::{debug, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

/// Keep-alive probe period applied to every accepted connection.
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

pub struct HttpsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl HttpsListener {
    pub async fn bind(
        listen_address: &str,
        cert_filename: &str,
        key_filename: &str,
    ) -> Result<Self> {
        // rustls refuses to pick between linked crypto providers on its
        // own.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = load_certificates(cert_filename)?;
        let key = load_private_key(key_filename)?;
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| AppError::Tls(format!("invalid certificate or key: {}", e)))?;

        let listener = TcpListener::bind(listen_address).await?;
        Ok(HttpsListener {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop: every accepted connection gets keep-alive enabled,
    /// then the TLS handshake and `handler` run on their own task.
    /// Returns when `shutdown` fires.
    pub async fn serve<F, Fut>(&self, shutdown: CancellationToken, handler: F) -> Result<()>
    where
        F: Fn(TlsStream<TcpStream>, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("listener_accept_error"; "error" => e.to_string());
                        continue;
                    }
                },
            };

            if let Err(e) = enable_keep_alive(&stream) {
                warn!("keep_alive_setup_failed";
                    "peer_addr" => peer_addr.to_string(),
                    "error" => e.to_string());
            }

            let acceptor = self.acceptor.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(e) => {
                        debug!("tls_handshake_failed";
                            "peer_addr" => peer_addr.to_string(),
                            "error" => e.to_string());
                        return;
                    }
                };
                if let Err(e) = handler(tls_stream, peer_addr).await {
                    debug!("web_connection_handler_error";
                        "peer_addr" => peer_addr.to_string(),
                        "error" => e.to_string());
                }
            });
        }
    }
}

fn enable_keep_alive(stream: &TcpStream) -> std::io::Result<()> {
    let keep_alive = TcpKeepalive::new().with_time(KEEP_ALIVE_PERIOD);
    SockRef::from(stream).set_tcp_keepalive(&keep_alive)
}

fn load_certificates(filename: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(filename)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(AppError::Tls(format!(
            "no certificates found in {}",
            filename
        )));
    }
    Ok(certs)
}

fn load_private_key(filename: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(filename)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| AppError::Tls(format!("no private key found in {}", filename)))
}
