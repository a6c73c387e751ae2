use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
    #[error("gateway IP {0} is not inside subnet {1}")]
    GatewayOutsideSubnet(Ipv4Addr, Ipv4Net),
    #[error("static lease {0} is not inside subnet {1}")]
    LeaseOutsideSubnet(Ipv4Addr, Ipv4Net),
    #[error("NAT key {0} is not inside subnet {1}")]
    NatKeyOutsideSubnet(Ipv4Addr, Ipv4Net),
    #[error("MTU {0} is below the IPv4 minimum of 576")]
    MtuTooSmall(usize),
}

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| ConfigError::InvalidMac(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| ConfigError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ConfigError::InvalidMac(s.to_string()));
        }
        Ok(MacAddress(out))
    }
}

/// Parse a hyphenated UUID into its 16 raw bytes.
pub fn parse_uuid(s: &str) -> Result<[u8; 16], ConfigError> {
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        return Err(ConfigError::InvalidUuid(s.to_string()));
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| ConfigError::InvalidUuid(s.to_string()))?;
    }
    Ok(out)
}

/// Format 16 raw bytes as a lowercase hyphenated UUID.
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    let mut s = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            s.push('-');
        }
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Byte-layout convention used to carry Ethernet frames over the VM link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDialect {
    /// VPNKit negotiation handshake, then 2-byte little-endian length prefixes.
    HyperKit,
    /// 4-byte big-endian length prefixes, exactly one connection.
    Qemu,
    /// 2-byte little-endian length prefixes, no handshake.
    Bess,
    /// Qemu framing over inherited stdin/stdout.
    Stdio,
    /// One datagram per frame.
    VfkitUdp,
}

impl LinkDialect {
    /// Dialects that are a point-to-point link: the process ends with the
    /// connection.
    pub fn single_connection(&self) -> bool {
        matches!(self, LinkDialect::Qemu | LinkDialect::Stdio)
    }
}

/// An authoritative DNS record inside a zone. An empty name answers for the
/// zone apex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// A DNS zone served authoritatively by the gateway. `name` carries the
/// trailing dot, e.g. `containers.internal.`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub records: Vec<Record>,
}

/// Immutable network plan, built once at startup.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub subnet: Ipv4Net,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddress,
    pub mtu: usize,
    /// Static DHCP leases, IP to hardware address.
    pub dhcp_static_leases: HashMap<Ipv4Addr, MacAddress>,
    pub dns_zones: Vec<Zone>,
    /// Host listeners started at boot, local address to guest address.
    pub forwards: HashMap<String, String>,
    /// Outbound destination rewrites, virtual IP to host IP.
    pub nat: HashMap<Ipv4Addr, Ipv4Addr>,
    /// Addresses the gateway claims and serves itself.
    pub gateway_virtual_ips: Vec<Ipv4Addr>,
    /// VPNKit client UUID (lowercase hyphenated) to assigned MAC.
    pub vpnkit_uuid_macs: HashMap<String, MacAddress>,
    pub protocol: LinkDialect,
    /// Where sshd lives inside the guest.
    pub ssh_guest_addr: SocketAddrV4,
    pub dial_timeout: Duration,
    pub udp_idle_timeout: Duration,
    pub debug: bool,
}

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

impl Configuration {
    /// The stock 192.168.127.0/24 plan: one static lease for the guest, the
    /// host reachable at a NAT-rewritten virtual address, and the
    /// `containers.internal.` / `crc.testing.` zones.
    pub fn default_plan(
        mtu: usize,
        ssh_port: u16,
        protocol: LinkDialect,
        debug: bool,
    ) -> Result<Self, ConfigError> {
        let gateway_ip = Ipv4Addr::new(192, 168, 127, 1);
        let guest_ip = Ipv4Addr::new(192, 168, 127, 2);
        let host_virtual_ip = Ipv4Addr::new(192, 168, 127, 254);

        let records = vec![
            Record {
                name: "gateway".to_string(),
                ip: gateway_ip,
            },
            Record {
                name: "host".to_string(),
                ip: host_virtual_ip,
            },
        ];

        let config = Configuration {
            subnet: "192.168.127.0/24".parse().expect("static subnet literal"),
            gateway_ip,
            gateway_mac: "5a:94:ef:e4:0c:dd".parse()?,
            mtu,
            dhcp_static_leases: HashMap::from([(guest_ip, "5a:94:ef:e4:0c:ee".parse()?)]),
            dns_zones: vec![
                Zone {
                    name: "containers.internal.".to_string(),
                    records: records.clone(),
                },
                // still used by podman machine CNI
                Zone {
                    name: "crc.testing.".to_string(),
                    records,
                },
            ],
            forwards: HashMap::from([(
                format!(":{ssh_port}"),
                format!("{guest_ip}:22"),
            )]),
            nat: HashMap::from([(host_virtual_ip, Ipv4Addr::LOCALHOST)]),
            gateway_virtual_ips: vec![host_virtual_ip],
            vpnkit_uuid_macs: HashMap::from([(
                "c3d68012-0208-11ea-9fd7-f2189899ab08".to_string(),
                "5a:94:ef:e4:0c:ee".parse()?,
            )]),
            protocol,
            ssh_guest_addr: SocketAddrV4::new(guest_ip, 22),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            debug,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < 576 {
            return Err(ConfigError::MtuTooSmall(self.mtu));
        }
        if !self.subnet.contains(&self.gateway_ip) {
            return Err(ConfigError::GatewayOutsideSubnet(
                self.gateway_ip,
                self.subnet,
            ));
        }
        for ip in self.dhcp_static_leases.keys() {
            if !self.subnet.contains(ip) {
                return Err(ConfigError::LeaseOutsideSubnet(*ip, self.subnet));
            }
        }
        for ip in self.nat.keys() {
            if !self.subnet.contains(ip) {
                return Err(ConfigError::NatKeyOutsideSubnet(*ip, self.subnet));
            }
        }
        Ok(())
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.subnet.netmask()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_roundtrip() {
        let mac: MacAddress = "5a:94:ef:e4:0c:dd".parse().unwrap();
        assert_eq!(mac.0, [0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xdd]);
        assert_eq!(mac.to_string(), "5a:94:ef:e4:0c:dd");
    }

    #[test]
    fn test_mac_parse_rejects_garbage() {
        assert!("5a:94:ef:e4:0c".parse::<MacAddress>().is_err());
        assert!("5a:94:ef:e4:0c:dd:00".parse::<MacAddress>().is_err());
        assert!("zz:94:ef:e4:0c:dd".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_uuid_roundtrip() {
        let uuid = parse_uuid("c3d68012-0208-11ea-9fd7-f2189899ab08").unwrap();
        assert_eq!(format_uuid(&uuid), "c3d68012-0208-11ea-9fd7-f2189899ab08");
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_default_plan_is_valid() {
        let config = Configuration::default_plan(1500, 2222, LinkDialect::HyperKit, false).unwrap();
        assert_eq!(config.gateway_ip, Ipv4Addr::new(192, 168, 127, 1));
        assert_eq!(
            config.nat.get(&Ipv4Addr::new(192, 168, 127, 254)),
            Some(&Ipv4Addr::LOCALHOST)
        );
        assert_eq!(
            config.forwards.get(":2222").map(String::as_str),
            Some("192.168.127.2:22")
        );
        assert_eq!(config.dns_zones.len(), 2);
    }

    #[test]
    fn test_validate_rejects_foreign_lease() {
        let mut config =
            Configuration::default_plan(1500, 2222, LinkDialect::HyperKit, false).unwrap();
        config
            .dhcp_static_leases
            .insert(Ipv4Addr::new(10, 0, 0, 9), MacAddress([2, 0, 0, 0, 0, 1]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseOutsideSubnet(..))
        ));
    }

    #[test]
    fn test_validate_rejects_small_mtu() {
        let mut config =
            Configuration::default_plan(1500, 2222, LinkDialect::HyperKit, false).unwrap();
        config.mtu = 500;
        assert!(matches!(config.validate(), Err(ConfigError::MtuTooSmall(500))));
    }
}
