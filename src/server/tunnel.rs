//! Tunnel server: accepts client connections on every configured tunnel
//! listener, applies per-client traffic policy, and relays application
//! traffic upstream.
//!
//! Each accepted connection is wrapped interrupt-first, then with the
//! activity monitor (feeding the per-protocol LRU order), then with the
//! throttle, and registered so the shutdown broadcast can interrupt any
//! open relay. The protocol label is opaque here; framing belongs to the
//! protocol implementations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use serde::Serialize;
use slog_scope::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::net::activity::ActivityMonitoredConn;
use crate::net::dial::dial_tcp;
use crate::net::ip_address;
use crate::net::interrupt::InterruptibleConn;
use crate::net::lru::LruConnList;
use crate::net::registry::ConnRegistry;
use crate::net::relay::relay;
use crate::net::throttle::ThrottledConn;

use super::config::TunnelListenerConfig;
use super::support::SupportServices;

/// Load counters for one tunnel protocol.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct LoadStats {
    pub accepted_clients: u64,
    pub active_clients: u64,
    pub peak_clients: u64,
}

pub struct TunnelServer {
    support: Arc<SupportServices>,
    shutdown: CancellationToken,
    clients: Arc<ConnRegistry>,
    pending_dials: Arc<ConnRegistry>,
    stats: Mutex<HashMap<String, LoadStats>>,
    listen_addrs: Mutex<HashMap<String, SocketAddr>>,
}

impl TunnelServer {
    pub fn new(support: Arc<SupportServices>, shutdown: CancellationToken) -> Self {
        TunnelServer {
            support,
            shutdown,
            clients: Arc::new(ConnRegistry::new()),
            pending_dials: Arc::new(ConnRegistry::new()),
            stats: Mutex::new(HashMap::new()),
            listen_addrs: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the per-protocol load counters.
    pub fn load_stats(&self) -> HashMap<String, LoadStats> {
        self.stats.lock().expect("tunnel stats lock poisoned").clone()
    }

    /// Bound address of a running listener, by protocol label.
    pub fn listen_addr(&self, protocol: &str) -> Option<SocketAddr> {
        self.listen_addrs
            .lock()
            .expect("tunnel listen addrs lock poisoned")
            .get(protocol)
            .copied()
    }

    /// Bind and run every configured tunnel listener until the shutdown
    /// broadcast fires, then interrupt open relays and drain.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut bound = Vec::new();
        for listener_config in self.support.config.tunnel_listeners.clone() {
            let listener = TcpListener::bind(&listener_config.listen_address)
                .await
                .with_context(|| {
                    format!(
                        "bind tunnel listener {} on {} failed",
                        listener_config.protocol, listener_config.listen_address
                    )
                })?;
            let local_addr = listener.local_addr()?;
            self.listen_addrs
                .lock()
                .expect("tunnel listen addrs lock poisoned")
                .insert(listener_config.protocol.clone(), local_addr);
            info!("tunnel_listener_started";
                "protocol" => listener_config.protocol.clone(),
                "address" => local_addr.to_string());
            bound.push((listener_config, listener));
        }

        let mut accept_loops = JoinSet::new();
        for (listener_config, listener) in bound {
            let server = self.clone();
            accept_loops.spawn(async move { server.accept_loop(listener_config, listener).await });
        }
        while accept_loops.join_next().await.is_some() {}
        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener_config: TunnelListenerConfig,
        listener: TcpListener,
    ) {
        let protocol = listener_config.protocol;
        let upstream_address = listener_config.upstream_address;
        let max_clients = listener_config.max_clients;
        let lru = LruConnList::new();
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            if let Some(max_clients) = max_clients {
                                if self.active_clients(&protocol) >= max_clients {
                                    // Shed the least-recently-active client
                                    // rather than refuse the new one.
                                    lru.close_oldest();
                                }
                            }
                            self.note_accepted(&protocol);
                            let server = self.clone();
                            let handler_protocol = protocol.clone();
                            let handler_upstream = upstream_address.clone();
                            let handler_lru = lru.clone();
                            handlers.spawn(async move {
                                server
                                    .handle_connection(
                                        handler_protocol,
                                        handler_upstream,
                                        handler_lru,
                                        stream,
                                        peer_addr,
                                    )
                                    .await;
                            });
                        }
                        Err(e) => {
                            warn!("tunnel_accept_error";
                                "protocol" => protocol.clone(),
                                "error" => e.to_string());
                        }
                    }
                }
            }
        }

        // Shutting down: interrupt pending dials and open relays, then
        // wait for the handlers to observe the close.
        self.pending_dials.close_all();
        self.clients.close_all();
        while handlers.join_next().await.is_some() {}

        info!("tunnel_listener_stopped"; "protocol" => protocol);
    }

    async fn handle_connection(
        self: Arc<Self>,
        protocol: String,
        upstream_address: String,
        lru: LruConnList,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) {
        let client_region = self.support.geoip.lookup(peer_addr.ip());
        let rules = self.support.traffic_rules.get_rules(&client_region);

        let client_conn = InterruptibleConn::new(stream);
        let client_handle = client_conn.handle();

        if !self.clients.add(client_handle.clone()) {
            debug!("tunnel_connection_rejected";
                "protocol" => protocol.clone(),
                "peer_addr" => peer_addr.to_string());
            self.note_closed(&protocol);
            return;
        }

        let lru_entry = lru.add(client_handle.clone());
        let monitored =
            ActivityMonitoredConn::new(client_conn, rules.inactivity_timeout, false, Some(lru_entry));
        let monitor = monitored.monitor();
        let client = ThrottledConn::new(monitored, rules.rate_limits);

        debug!("tunnel_connection_accepted";
            "protocol" => protocol.clone(),
            "client_ip" => ip_address(Some(&peer_addr)),
            "client_region" => client_region.clone());

        let dial_config = self
            .support
            .config
            .dial
            .to_dial_config(Some(self.pending_dials.clone()));
        match dial_tcp(&upstream_address, &dial_config).await {
            Ok(upstream_conn) => {
                let upstream_handle = upstream_conn.handle();
                if self.clients.add(upstream_handle.clone()) {
                    // An evicted or force-closed client takes its upstream
                    // leg down with it; otherwise the relay sits on the
                    // healthy side until the idle timeout.
                    let client_watch = client_handle.clone();
                    let upstream_watch = upstream_handle.clone();
                    tokio::spawn(async move {
                        client_watch.closed().await;
                        upstream_watch.close();
                    });
                    relay(&protocol, client, upstream_conn).await;
                    self.clients.remove(&upstream_handle);
                }
            }
            Err(e) => {
                error!("tunnel_upstream_dial_failed";
                    "protocol" => protocol.clone(),
                    "upstream_address" => upstream_address.clone(),
                    "error" => format!("{:#}", e));
            }
        }

        self.clients.remove(&client_handle);
        client_handle.close();

        debug!("tunnel_connection_closed";
            "protocol" => protocol.clone(),
            "peer_addr" => peer_addr.to_string(),
            "client_region" => client_region,
            "active_duration_ms" => monitor.active_duration().as_millis() as u64);

        self.note_closed(&protocol);
    }

    fn active_clients(&self, protocol: &str) -> u64 {
        self.stats
            .lock()
            .expect("tunnel stats lock poisoned")
            .get(protocol)
            .map(|stats| stats.active_clients)
            .unwrap_or(0)
    }

    fn note_accepted(&self, protocol: &str) {
        let mut stats = self.stats.lock().expect("tunnel stats lock poisoned");
        let entry = stats.entry(protocol.to_string()).or_default();
        entry.accepted_clients += 1;
        entry.active_clients += 1;
        if entry.active_clients > entry.peak_clients {
            entry.peak_clients = entry.active_clients;
        }
    }

    fn note_closed(&self, protocol: &str) {
        let mut stats = self.stats.lock().expect("tunnel stats lock poisoned");
        let entry = stats.entry(protocol.to_string()).or_default();
        entry.active_clients = entry.active_clients.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::ServerConfig;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn test_support(upstream: SocketAddr, max_clients: Option<u64>) -> Arc<SupportServices> {
        let json = serde_json::json!({
            "tunnel_listeners": [
                { "protocol": "plain",
                  "listen_address": "127.0.0.1:0",
                  "upstream_address": upstream.to_string(),
                  "max_clients": max_clients }
            ]
        });
        let config: Arc<ServerConfig> = Arc::new(serde_json::from_value(json).unwrap());
        Arc::new(SupportServices::new(config).unwrap())
    }

    async fn wait_for_listener(server: &Arc<TunnelServer>, protocol: &str) -> SocketAddr {
        for _ in 0..100 {
            if let Some(addr) = server.listen_addr(protocol) {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tunnel listener did not start");
    }

    #[tokio::test]
    async fn test_tunnel_relays_and_shuts_down() {
        crate::logging::init_terminal(false);
        let upstream = echo_upstream().await;
        let shutdown = CancellationToken::new();
        let server = Arc::new(TunnelServer::new(test_support(upstream, None), shutdown.clone()));

        let run = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        let addr = wait_for_listener(&server, "plain").await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"through the tunnel").await.unwrap();
        let mut buf = [0u8; 18];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the tunnel");

        let stats = server.load_stats();
        let plain = stats.get("plain").unwrap();
        assert_eq!(plain.accepted_clients, 1);
        assert_eq!(plain.active_clients, 1);
        assert_eq!(plain.peak_clients, 1);

        // The broadcast interrupts the open relay and the server drains.
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("tunnel server did not drain")
            .unwrap()
            .unwrap();

        // The client observes the close.
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
        assert_eq!(server.load_stats().get("plain").unwrap().active_clients, 0);
    }

    #[tokio::test]
    async fn test_max_clients_evicts_least_recently_active() {
        crate::logging::init_terminal(false);
        let upstream = echo_upstream().await;
        let shutdown = CancellationToken::new();
        let server = Arc::new(TunnelServer::new(
            test_support(upstream, Some(1)),
            shutdown.clone(),
        ));

        let run = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        let addr = wait_for_listener(&server, "plain").await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        first.read_exact(&mut buf).await.unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"two").await.unwrap();
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");

        // The first client was evicted to make room.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), first.read_to_end(&mut rest))
            .await
            .expect("evicted client still open")
            .unwrap_or(0);
        assert_eq!(n, 0);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), run).await;
    }
}
