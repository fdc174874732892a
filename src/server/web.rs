//! Web API server: the client-facing HTTPS endpoint. Only the status
//! handler carries a body here; the handshake-adjacent handlers live with
//! the protocol implementations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use serde::Serialize;
use slog_scope::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;

use super::listener::HttpsListener;
use super::support::SupportServices;

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
    build: &'static str,
    build_epoch_seconds: u64,
    uptime_seconds: u64,
    sponsors: usize,
}

/// Run the web API server until shutdown. Setup failures propagate;
/// per-connection failures are logged and absorbed.
pub async fn run_web_server(
    support: Arc<SupportServices>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let Some(web_config) = support.config.web_server.clone() else {
        return Ok(());
    };

    let listener = HttpsListener::bind(
        &web_config.listen_address,
        &web_config.tls_certificate_filename,
        &web_config.tls_private_key_filename,
    )
    .await
    .context("web server listener setup failed")?;

    info!("web_server_started";
        "address" => listener.local_addr().map(|a| a.to_string()).unwrap_or_default());

    let started = Instant::now();
    listener
        .serve(shutdown, move |stream, peer_addr| {
            let support = support.clone();
            async move { handle_web_connection(stream, peer_addr, support, started).await }
        })
        .await?;

    info!("web_server_stopped");
    Ok(())
}

async fn handle_web_connection(
    stream: TlsStream<TcpStream>,
    peer_addr: SocketAddr,
    support: Arc<SupportServices>,
    started: Instant,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let request_line = request_line.trim_end();
    if request_line.is_empty() {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    // Drain the request headers.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line.trim().is_empty() {
            break;
        }
    }

    debug!("web_request";
        "peer_addr" => peer_addr.to_string(),
        "method" => method.to_string(),
        "path" => path.to_string());

    let (status_line, body) = match (method, path) {
        ("GET", "/status") => {
            let body = serde_json::to_string(&StatusBody {
                status: "ok",
                build: env!("VEILTUN_BUILD_VERSION"),
                build_epoch_seconds: env!("VEILTUN_BUILD_EPOCH").parse().unwrap_or(0),
                uptime_seconds: started.elapsed().as_secs(),
                sponsors: support.sponsor_db.sponsor_count(),
            })?;
            ("HTTP/1.1 200 OK", body)
        }
        _ => ("HTTP/1.1 404 Not Found", String::new()),
    };

    let response = format!(
        "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::ServerConfig;
    use crate::server::listener::tests::{generate_test_tls, tls_client};
    use tokio::io::AsyncReadExt;

    fn empty_support() -> Arc<SupportServices> {
        let json = serde_json::json!({
            "tunnel_listeners": [
                { "protocol": "plain",
                  "listen_address": "127.0.0.1:0",
                  "upstream_address": "127.0.0.1:1" }
            ]
        });
        let config: Arc<ServerConfig> = Arc::new(serde_json::from_value(json).unwrap());
        Arc::new(SupportServices::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        crate::logging::init_terminal(false);
        let tls = generate_test_tls();
        let listener = Arc::new(
            HttpsListener::bind(
                "127.0.0.1:0",
                tls.cert_file.path().to_str().unwrap(),
                tls.key_file.path().to_str().unwrap(),
            )
            .await
            .unwrap(),
        );
        let addr = listener.local_addr().unwrap();

        let support = empty_support();
        let started = Instant::now();
        let shutdown = CancellationToken::new();
        let serve = {
            let listener = listener.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                listener
                    .serve(shutdown, move |stream, peer_addr| {
                        let support = support.clone();
                        async move {
                            handle_web_connection(stream, peer_addr, support, started).await
                        }
                    })
                    .await
            })
        };

        let mut client = tls_client(addr, &tls.cert_der).await;
        client
            .write_all(b"GET /status HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"), "response: {}", response);
        assert!(response.contains("\"status\":\"ok\""), "response: {}", response);

        let mut client = tls_client(addr, &tls.cert_der).await;
        client
            .write_all(b"GET /nope HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));

        shutdown.cancel();
        serve.await.unwrap().unwrap();
    }
}
