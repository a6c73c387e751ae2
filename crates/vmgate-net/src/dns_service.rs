use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tokio::net::UdpSocket;

use vmgate_core::config::Zone;
use vmgate_core::dns::{
    build_a_response, build_error_response, lookup_zones, parse_query, ZoneAnswer, CLASS_IN,
    RCODE_NOTIMP, RCODE_NXDOMAIN, RCODE_SERVFAIL, TYPE_A,
};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_RESPONSE: usize = 4096;

/// Authoritative resolver for the configured zones with recursive fallback
/// to the host's resolvers.
pub struct DnsService {
    zones: Vec<Zone>,
    upstreams: Vec<SocketAddr>,
}

impl DnsService {
    pub fn new(zones: Vec<Zone>, upstreams: Vec<SocketAddr>) -> Self {
        Self { zones, upstreams }
    }

    /// Parse the host's resolver list once at startup.
    pub fn upstreams_from_resolv_conf(path: &Path) -> Vec<SocketAddr> {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        parse_resolv_conf(&contents)
    }

    /// Answer one raw query. `None` means drop silently (not a query).
    pub async fn handle_query(&self, query: &[u8]) -> Option<Vec<u8>> {
        let parsed = parse_query(query)?;
        if parsed.qtype != TYPE_A || parsed.qclass != CLASS_IN {
            return Some(build_error_response(&parsed, query, RCODE_NOTIMP));
        }
        match lookup_zones(&self.zones, &parsed.name) {
            ZoneAnswer::Records(ips) => {
                tracing::debug!(name = %parsed.name, answers = ips.len(), "authoritative answer");
                Some(build_a_response(&parsed, query, &ips))
            }
            ZoneAnswer::NameError => {
                tracing::debug!(name = %parsed.name, "authoritative nxdomain");
                Some(build_error_response(&parsed, query, RCODE_NXDOMAIN))
            }
            ZoneAnswer::NotHandled => match self.forward(query).await {
                Some(response) => Some(response),
                None => {
                    tracing::warn!(name = %parsed.name, "all upstream resolvers failed");
                    Some(build_error_response(&parsed, query, RCODE_SERVFAIL))
                }
            },
        }
    }

    /// Relay the query verbatim and return the first response in time.
    async fn forward(&self, query: &[u8]) -> Option<Vec<u8>> {
        if self.upstreams.is_empty() {
            return None;
        }
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        let mut buf = [0u8; MAX_RESPONSE];
        for upstream in &self.upstreams {
            if socket.send_to(query, upstream).await.is_err() {
                continue;
            }
            match tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, _))) => return Some(buf[..n].to_vec()),
                _ => continue,
            }
        }
        None
    }
}

fn parse_resolv_conf(contents: &str) -> Vec<SocketAddr> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("nameserver")?;
            let addr: IpAddr = rest.trim().parse().ok()?;
            Some(SocketAddr::new(addr, 53))
        })
        .collect()
}
