//! Dialer configuration and TCP dialing with pending-dial interruption.

use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use super::interrupt::{CloseHandle, InterruptibleConn};
use super::registry::ConnRegistry;

/// Binds a socket to a network device before connect, to exclude it (and
/// its DNS lookups) from VPN routing.
pub trait DeviceBinder: Send + Sync {
    fn bind_to_device(&self, raw_fd: i32) -> std::io::Result<()>;
}

/// Supplies the untunneled DNS servers used alongside a device binder.
pub trait DnsServerGetter: Send + Sync {
    fn primary_dns_server(&self) -> String;
    fn secondary_dns_server(&self) -> Option<String>;
}

/// Parameters shaping dialer behavior.
#[derive(Clone, Default)]
pub struct DialConfig {
    /// Upstream proxy to connect through, e.g. "http://proxyhost:8080" or
    /// "socks5://proxyhost:1080". HTTP proxies must support CONNECT.
    pub upstream_proxy_url: Option<String>,

    /// Extra headers attached to the CONNECT sent to an HTTP upstream
    /// proxy.
    pub upstream_proxy_custom_headers: Vec<(String, String)>,

    pub connect_timeout: Option<Duration>,

    /// Tracks the dial so `ConnRegistry::close_all` can interrupt it. The
    /// handle is added before the connect begins and removed once the
    /// connect succeeds or fails.
    pub pending_conns: Option<Arc<ConnRegistry>>,

    pub device_binder: Option<Arc<dyn DeviceBinder>>,
    pub dns_server_getter: Option<Arc<dyn DnsServerGetter>>,

    /// Use the alternative TLS stack whose handshake does not fingerprint
    /// as a stock library. Consumed by the TLS dialers layered on top of
    /// the TCP dial.
    pub use_indistinguishable_tls: bool,

    /// Trusted CA bundle for the alternative TLS stack.
    pub trusted_ca_certificates_filename: Option<String>,

    /// Reported region of the host device, for pre-connection strategy
    /// selection.
    pub device_region: Option<String>,

    /// Observes the concrete IP address dialed; may run on another task
    /// than the dial initiator.
    pub resolved_ip_callback: Option<Arc<dyn Fn(IpAddr) + Send + Sync>>,
}

/// Establish a TCP connection to `address` ("host:port") under the dial
/// config: optional upstream proxy leg, connect timeout, device binding,
/// pending-dial registration, and the resolved-IP callback.
pub async fn dial_tcp(
    address: &str,
    config: &DialConfig,
) -> anyhow::Result<InterruptibleConn<TcpStream>> {
    let handle = CloseHandle::new();

    let registered = match &config.pending_conns {
        Some(pending) => {
            if !pending.add(handle.clone()) {
                anyhow::bail!("dial canceled: pending connections are closed");
            }
            true
        }
        None => false,
    };

    let result = dial_tcp_inner(address, config, &handle).await;

    if registered {
        if let Some(pending) = &config.pending_conns {
            pending.remove(&handle);
        }
    }

    Ok(InterruptibleConn::with_handle(result?, handle))
}

async fn dial_tcp_inner(
    address: &str,
    config: &DialConfig,
    handle: &CloseHandle,
) -> anyhow::Result<TcpStream> {
    let (connect_address, proxy) = match &config.upstream_proxy_url {
        Some(url) => {
            let proxy = UpstreamProxy::parse(url)?;
            (proxy.address.clone(), Some(proxy))
        }
        None => (address.to_string(), None),
    };

    let addr = resolve_first(&connect_address).await?;

    if let Some(callback) = &config.resolved_ip_callback {
        callback(addr.ip());
    }

    let connect = async {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(binder) = &config.device_binder {
            binder
                .bind_to_device(socket.as_raw_fd())
                .map_err(|e| anyhow::anyhow!("bind to device failed: {}", e))?;
        }
        let mut stream = socket
            .connect(addr)
            .await
            .with_context(|| format!("connect to {} failed", addr))?;
        if let Some(proxy) = &proxy {
            proxy
                .establish(&mut stream, address, &config.upstream_proxy_custom_headers)
                .await?;
        }
        Ok::<TcpStream, anyhow::Error>(stream)
    };

    let connect = async {
        match config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| anyhow::anyhow!("connect to {} timed out", address))?,
            None => connect.await,
        }
    };

    tokio::select! {
        result = connect => result,
        _ = handle.closed() => anyhow::bail!("dial interrupted"),
    }
}

async fn resolve_first(address: &str) -> anyhow::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("resolve {} failed", address))?;
    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses for {}", address))
}

enum ProxyScheme {
    Http,
    Socks5,
}

struct UpstreamProxy {
    scheme: ProxyScheme,
    address: String,
}

impl UpstreamProxy {
    fn parse(url: &str) -> anyhow::Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| anyhow::anyhow!("invalid upstream proxy URL {:?}", url))?;
        let scheme = match scheme {
            "http" => ProxyScheme::Http,
            "socks5" => ProxyScheme::Socks5,
            other => anyhow::bail!("unsupported upstream proxy scheme {:?}", other),
        };
        let address = rest.trim_end_matches('/').to_string();
        if address.is_empty() {
            anyhow::bail!("invalid upstream proxy URL {:?}", url);
        }
        Ok(UpstreamProxy { scheme, address })
    }

    async fn establish(
        &self,
        stream: &mut TcpStream,
        target: &str,
        custom_headers: &[(String, String)],
    ) -> anyhow::Result<()> {
        match self.scheme {
            ProxyScheme::Http => establish_http_connect(stream, target, custom_headers).await,
            ProxyScheme::Socks5 => establish_socks5(stream, target).await,
        }
    }
}

async fn establish_http_connect(
    stream: &mut TcpStream,
    target: &str,
    custom_headers: &[(String, String)],
) -> anyhow::Result<()> {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    for (name, value) in custom_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let status_line = read_header_line(stream).await?;
    let mut parts = status_line.split_whitespace();
    let _version = parts.next();
    let status = parts.next().unwrap_or("");
    if status != "200" {
        anyhow::bail!("upstream proxy refused CONNECT: {}", status_line.trim());
    }
    // Discard the remaining response headers.
    loop {
        let line = read_header_line(stream).await?;
        if line.trim().is_empty() {
            break;
        }
    }
    Ok(())
}

// Read one CRLF-terminated line a byte at a time so no tunneled bytes past
// the header block are consumed.
async fn read_header_line(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        line.push(byte);
        if byte == b'\n' {
            break;
        }
        if line.len() > 4096 {
            anyhow::bail!("oversized proxy response header line");
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

// SOCKS5 constants
const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

async fn establish_socks5(stream: &mut TcpStream, target: &str) -> anyhow::Result<()> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid dial address {:?}", target))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid dial port in {:?}", target))?;
    let host = host.trim_matches(['[', ']']);

    stream.write_all(&[SOCKS_VERSION, 1, AUTH_NONE]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS_VERSION, AUTH_NONE] {
        anyhow::bail!("upstream SOCKS proxy requires authentication");
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    if let Ok(ip) = host.parse::<IpAddr>() {
        match ip {
            IpAddr::V4(v4) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&v6.octets());
            }
        }
    } else {
        if host.len() > 255 {
            anyhow::bail!("dial hostname too long for SOCKS: {:?}", host);
        }
        request.push(ATYP_DOMAIN);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != REP_SUCCESS {
        anyhow::bail!("upstream SOCKS proxy refused connect: reply {}", reply[1]);
    }
    let bound_len = match reply[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            len + 2
        }
        other => anyhow::bail!("unsupported SOCKS reply address type {}", other),
    };
    let mut bound = vec![0u8; bound_len];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
