//! Service supervisor: boots logging and support services, starts the
//! server workers, multiplexes OS signals, and coordinates orderly
//! shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use slog_scope::{error, info};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::logging;

use super::config::ServerConfig;
use super::support::SupportServices;
use super::tunnel::TunnelServer;
use super::web;

/// Load the configuration and run all enabled services until an OS stop
/// signal arrives or a worker fails. SIGUSR1 reloads the support services;
/// SIGUSR2 emits an immediate load record. Returns the first worker error,
/// or Ok for a signal-driven shutdown.
pub async fn run_services(config_json: &[u8]) -> anyhow::Result<()> {
    run_services_with_shutdown(config_json, CancellationToken::new()).await
}

/// As [`run_services`], with an externally owned shutdown token so an
/// embedding process can stop the services without a signal.
pub async fn run_services_with_shutdown(
    config_json: &[u8],
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let config = ServerConfig::load(config_json).context("load config failed")?;

    match &config.log_filename {
        Some(path) => logging::init_file(path, config.log_verbose).context("init logging failed")?,
        None => logging::init_terminal(config.log_verbose),
    }

    let config = Arc::new(config);
    let support =
        Arc::new(SupportServices::new(config.clone()).context("init support services failed")?);

    let start_time = Instant::now();
    // Capacity 1 with non-blocking sends: only the first worker failure
    // needs to drive shutdown, later ones are dropped.
    let (error_tx, mut error_rx) = mpsc::channel::<anyhow::Error>(1);
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    let tunnel_server = Arc::new(TunnelServer::new(support.clone(), shutdown.clone()));

    if config.run_load_monitor() {
        let tunnel_server = tunnel_server.clone();
        let shutdown = shutdown.clone();
        let period = Duration::from_secs(config.load_monitor_period_seconds);
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => log_server_load(start_time, &tunnel_server),
                }
            }
        }));
    }

    if config.run_web_server() {
        let support = support.clone();
        let shutdown = shutdown.clone();
        let error_tx = error_tx.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = web::run_web_server(support, shutdown).await {
                let _ = error_tx.try_send(e);
            }
        }));
    }

    // The tunnel server always runs; it launches one listener per
    // configured tunnel protocol.
    {
        let tunnel_server = tunnel_server.clone();
        let error_tx = error_tx.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = tunnel_server.run().await {
                let _ = error_tx.try_send(e);
            }
        }));
    }

    let mut stop_signal = signal(SignalKind::interrupt()).context("install signal handler failed")?;
    let mut terminate_signal =
        signal(SignalKind::terminate()).context("install signal handler failed")?;
    let mut reload_signal =
        signal(SignalKind::user_defined1()).context("install signal handler failed")?;
    let mut load_signal =
        signal(SignalKind::user_defined2()).context("install signal handler failed")?;

    let mut result: anyhow::Result<()> = Ok(());
    loop {
        tokio::select! {
            _ = reload_signal.recv() => support.reload(),
            _ = load_signal.recv() => log_server_load(start_time, &tunnel_server),
            _ = stop_signal.recv() => {
                info!("shutdown_by_system");
                break;
            }
            _ = terminate_signal.recv() => {
                info!("shutdown_by_system");
                break;
            }
            _ = shutdown.cancelled() => {
                info!("shutdown_by_embedder");
                break;
            }
            received = error_rx.recv() => {
                if let Some(e) = received {
                    error!("service_failed"; "error" => format!("{:#}", e));
                    result = Err(e);
                }
                break;
            }
        }
    }

    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }

    result
}

/// One structured load record: uptime plus the per-protocol counters.
fn log_server_load(start_time: Instant, tunnel_server: &TunnelServer) {
    let stats = tunnel_server.load_stats();
    let stats_json = serde_json::to_string(&stats).unwrap_or_default();
    info!("load";
        "uptime_seconds" => start_time.elapsed().as_secs(),
        "stats" => stats_json);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::listener::tests::generate_test_tls;

    fn tunnel_only_config() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "tunnel_listeners": [
                { "protocol": "plain",
                  "listen_address": "127.0.0.1:0",
                  "upstream_address": "127.0.0.1:1" }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_fails_boot() {
        let err = run_services(b"{ not json").await.unwrap_err();
        assert!(format!("{:#}", err).contains("load config failed"));
    }

    #[tokio::test]
    async fn test_external_shutdown_returns_ok() {
        let shutdown = CancellationToken::new();
        let run = {
            let shutdown = shutdown.clone();
            tokio::spawn(
                async move { run_services_with_shutdown(&tunnel_only_config(), shutdown).await },
            )
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("services did not drain")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_first_worker_error_drives_shutdown() {
        // The web server is configured with an unreadable certificate; its
        // failure must shut down the tunnel server and surface as the run
        // result.
        let tls = generate_test_tls();
        let config = serde_json::to_vec(&serde_json::json!({
            "tunnel_listeners": [
                { "protocol": "plain",
                  "listen_address": "127.0.0.1:0",
                  "upstream_address": "127.0.0.1:1" }
            ],
            "web_server": {
                "listen_address": "127.0.0.1:0",
                "tls_certificate_filename": "/nonexistent/cert.pem",
                "tls_private_key_filename": tls.key_file.path().to_str().unwrap()
            }
        }))
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run_services(&config))
            .await
            .expect("services did not drain");
        let err = result.unwrap_err();
        assert!(
            format!("{:#}", err).contains("web server listener setup failed"),
            "error: {:#}",
            err
        );
    }
}
