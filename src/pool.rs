//! Outbound client pool for origin requests
//!
//! One pooled HTTP client per egress address. Each origin request picks an
//! address uniformly at random so origin-observed traffic is spread across
//! every public address of the host.

use crate::config::OriginConfig;
use crate::error::OriginError;
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Statistics for the origin pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent to origins
    pub total_requests: AtomicU64,
    /// Requests that failed at the transport level
    pub transport_failures: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_transport_failures(&self) -> u64 {
        self.transport_failures.load(Ordering::Relaxed)
    }
}

/// Configuration for the origin pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per origin host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// TCP keep-alive interval
    pub keepalive: Duration,
    /// Source addresses; empty binds to the unspecified address
    pub egress_addresses: Vec<IpAddr>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            egress_addresses: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Build from the `[origin]` section, detecting public interface
    /// addresses when none are listed.
    pub fn from_origin_config(config: &OriginConfig) -> Self {
        let egress_addresses = if config.egress_addresses.is_empty() {
            match public_ipv4_addresses() {
                Ok(addrs) => addrs.into_iter().map(IpAddr::V4).collect(),
                Err(e) => {
                    warn!(error = %e, "Failed to list interface addresses, using default route");
                    Vec::new()
                }
            }
        } else {
            config.egress_addresses.clone()
        };

        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: config.pool_idle_timeout(),
            connect_timeout: config.connect_timeout(),
            keepalive: config.keepalive(),
            egress_addresses,
        }
    }
}

/// Request sent to an origin
#[derive(Debug)]
pub struct OriginRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Fully buffered origin response, content-encoding already removed
#[derive(Debug)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct OriginPool {
    clients: Vec<(Option<IpAddr>, reqwest::Client)>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl OriginPool {
    pub fn new(config: PoolConfig) -> Result<Self, OriginError> {
        let mut clients = Vec::with_capacity(config.egress_addresses.len().max(1));
        if config.egress_addresses.is_empty() {
            clients.push((None, build_client(&config, None)?));
        } else {
            for addr in &config.egress_addresses {
                clients.push((Some(*addr), build_client(&config, Some(*addr))?));
            }
        }

        info!(
            egress_addresses = config.egress_addresses.len(),
            max_idle = config.max_idle_per_host,
            connect_timeout_secs = config.connect_timeout.as_secs(),
            "Origin pool initialized"
        );

        Ok(Self {
            clients,
            stats: Arc::new(PoolStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Pick a client uniformly at random
    fn pick(&self) -> &(Option<IpAddr>, reqwest::Client) {
        let index = if self.clients.len() > 1 {
            rand::thread_rng().gen_range(0..self.clients.len())
        } else {
            0
        };
        &self.clients[index]
    }

    /// Send a request and buffer the whole response body
    pub async fn send(&self, request: OriginRequest) -> Result<OriginResponse, OriginError> {
        let (local_addr, client) = self.pick();
        self.stats.record_request();

        debug!(
            method = %request.method,
            url = %request.url,
            local_addr = ?local_addr,
            "Sending origin request"
        );

        let result = async {
            let response = client
                .request(request.method, request.url)
                .headers(request.headers)
                .body(request.body)
                .send()
                .await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(OriginResponse {
                status,
                headers,
                body,
            })
        }
        .await;

        result.map_err(|e| {
            self.stats.record_failure();
            OriginError::Transport(e)
        })
    }
}

fn build_client(config: &PoolConfig, local_addr: Option<IpAddr>) -> Result<reqwest::Client, OriginError> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(config.connect_timeout)
        .tcp_keepalive(config.keepalive)
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.idle_timeout)
        .local_address(local_addr)
        .build()?;
    Ok(client)
}

/// Whether an address is routable on the public internet
pub fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback()
        || ip.is_link_local()
        || ip.is_private()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast())
}

/// Public IPv4 addresses of the local interfaces
pub fn public_ipv4_addresses() -> std::io::Result<Vec<Ipv4Addr>> {
    let mut addrs: Vec<Ipv4Addr> = interface_ipv4_addresses()?
        .into_iter()
        .filter(|ip| is_public_ipv4(*ip))
        .collect();
    addrs.sort();
    addrs.dedup();
    Ok(addrs)
}

#[cfg(unix)]
fn interface_ipv4_addresses() -> std::io::Result<Vec<Ipv4Addr>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs initialises `head` on success; it is freed below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut result = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` walks the list returned by getifaddrs and is
        // non-null here. An AF_INET `ifa_addr` points at a sockaddr_in.
        unsafe {
            let ifa = &*cursor;
            if !ifa.ifa_addr.is_null() && i32::from((*ifa.ifa_addr).sa_family) == libc::AF_INET {
                let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                result.push(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
            }
            cursor = ifa.ifa_next;
        }
    }

    // SAFETY: `head` came from a successful getifaddrs call.
    unsafe { libc::freeifaddrs(head) };
    Ok(result)
}

#[cfg(not(unix))]
fn interface_ipv4_addresses() -> std::io::Result<Vec<Ipv4Addr>> {
    Ok(Vec::new())
}
