use std::collections::HashMap;
use std::net::Ipv4Addr;

use vmgate_core::config::{Configuration, MacAddress};

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_ACK: u8 = 5;

const LEASE_SECS: u32 = 3600;
/// Classic BOOTP minimum packet size.
const REPLY_MIN_LEN: usize = 300;

/// Answers DISCOVER and REQUEST against the static lease table. There is
/// no dynamic pool: an unknown chaddr gets silence.
pub struct DhcpResponder {
    gateway_ip: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    /// Hardware address to leased IP.
    leases: HashMap<MacAddress, Ipv4Addr>,
}

impl DhcpResponder {
    pub fn new(config: &Configuration) -> Self {
        let leases = config
            .dhcp_static_leases
            .iter()
            .map(|(ip, mac)| (*mac, *ip))
            .collect();
        Self {
            gateway_ip: config.gateway_ip,
            subnet_mask: config.subnet_mask(),
            leases,
        }
    }

    /// Handle one BOOTP payload; returns the reply payload when one is due.
    pub fn handle(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let request = parse(payload)?;
        let lease_ip = *self.leases.get(&request.chaddr)?;
        let reply_type = match request.message_type {
            MSG_DISCOVER => MSG_OFFER,
            MSG_REQUEST => MSG_ACK,
            _ => return None,
        };
        tracing::debug!(
            chaddr = %request.chaddr,
            ip = %lease_ip,
            kind = if reply_type == MSG_OFFER { "offer" } else { "ack" },
            "dhcp reply"
        );
        Some(self.build_reply(&request, reply_type, lease_ip))
    }

    fn build_reply(&self, request: &DhcpRequest, message_type: u8, lease_ip: Ipv4Addr) -> Vec<u8> {
        let mut reply = Vec::with_capacity(REPLY_MIN_LEN);
        reply.push(BOOTREPLY);
        reply.push(HTYPE_ETHERNET);
        reply.push(6); // hlen
        reply.push(0); // hops
        reply.extend_from_slice(&request.xid);
        reply.extend_from_slice(&[0, 0]); // secs
        reply.extend_from_slice(&request.flags);
        reply.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets()); // ciaddr
        reply.extend_from_slice(&lease_ip.octets()); // yiaddr
        reply.extend_from_slice(&self.gateway_ip.octets()); // siaddr
        reply.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets()); // giaddr
        reply.extend_from_slice(&request.chaddr.0);
        reply.extend_from_slice(&[0u8; 10]); // chaddr padding
        reply.extend_from_slice(&[0u8; 64]); // sname
        reply.extend_from_slice(&[0u8; 128]); // file
        reply.extend_from_slice(&MAGIC_COOKIE);

        reply.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, message_type]);
        reply.extend_from_slice(&[OPT_SERVER_ID, 4]);
        reply.extend_from_slice(&self.gateway_ip.octets());
        reply.extend_from_slice(&[OPT_LEASE_TIME, 4]);
        reply.extend_from_slice(&LEASE_SECS.to_be_bytes());
        reply.extend_from_slice(&[OPT_SUBNET_MASK, 4]);
        reply.extend_from_slice(&self.subnet_mask.octets());
        reply.extend_from_slice(&[OPT_ROUTER, 4]);
        reply.extend_from_slice(&self.gateway_ip.octets());
        reply.extend_from_slice(&[OPT_DNS, 4]);
        reply.extend_from_slice(&self.gateway_ip.octets());
        reply.push(OPT_END);

        if reply.len() < REPLY_MIN_LEN {
            reply.resize(REPLY_MIN_LEN, 0);
        }
        reply
    }
}

struct DhcpRequest {
    xid: [u8; 4],
    flags: [u8; 2],
    chaddr: MacAddress,
    message_type: u8,
}

fn parse(payload: &[u8]) -> Option<DhcpRequest> {
    if payload.len() < 240 {
        return None;
    }
    if payload[0] != BOOTREQUEST || payload[1] != HTYPE_ETHERNET || payload[2] != 6 {
        return None;
    }
    if payload[236..240] != MAGIC_COOKIE {
        return None;
    }

    let mut xid = [0u8; 4];
    xid.copy_from_slice(&payload[4..8]);
    let mut flags = [0u8; 2];
    flags.copy_from_slice(&payload[10..12]);
    let mut chaddr = [0u8; 6];
    chaddr.copy_from_slice(&payload[28..34]);

    let message_type = options(&payload[240..])
        .find(|(code, _)| *code == OPT_MESSAGE_TYPE)
        .and_then(|(_, data)| data.first().copied())?;

    Some(DhcpRequest {
        xid,
        flags,
        chaddr: MacAddress(chaddr),
        message_type,
    })
}

fn options(mut data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> + '_ {
    std::iter::from_fn(move || loop {
        let (&code, rest) = data.split_first()?;
        match code {
            0 => {
                data = rest;
                continue;
            }
            OPT_END => return None,
            _ => {
                let (&len, rest) = rest.split_first()?;
                let len = usize::from(len);
                if rest.len() < len {
                    return None;
                }
                let (value, rest) = rest.split_at(len);
                data = rest;
                return Some((code, value));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmgate_core::config::{Configuration, LinkDialect};

    fn responder() -> DhcpResponder {
        let config = Configuration::default_plan(1500, 2222, LinkDialect::HyperKit, false).unwrap();
        DhcpResponder::new(&config)
    }

    fn request(chaddr: [u8; 6], message_type: u8) -> Vec<u8> {
        let mut p = vec![0u8; 240];
        p[0] = BOOTREQUEST;
        p[1] = HTYPE_ETHERNET;
        p[2] = 6;
        p[4..8].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        p[10] = 0x80; // broadcast flag
        p[28..34].copy_from_slice(&chaddr);
        p[236..240].copy_from_slice(&MAGIC_COOKIE);
        p.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, message_type, OPT_END]);
        p
    }

    fn option_value<'a>(reply: &'a [u8], code: u8) -> Option<&'a [u8]> {
        options(&reply[240..]).find(|(c, _)| *c == code).map(|(_, v)| v)
    }

    const KNOWN_MAC: [u8; 6] = [0x5A, 0x94, 0xEF, 0xE4, 0x0C, 0xEE];

    #[test]
    fn test_discover_yields_offer_with_lease() {
        let reply = responder().handle(&request(KNOWN_MAC, MSG_DISCOVER)).unwrap();

        assert_eq!(reply[0], BOOTREPLY);
        assert_eq!(&reply[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]); // xid echoed
        assert_eq!(reply[10], 0x80); // flags echoed
        assert_eq!(&reply[16..20], &[192, 168, 127, 2]); // yiaddr
        assert_eq!(&reply[28..34], &KNOWN_MAC);
        assert!(reply.len() >= REPLY_MIN_LEN);

        assert_eq!(option_value(&reply, OPT_MESSAGE_TYPE), Some(&[MSG_OFFER][..]));
        assert_eq!(
            option_value(&reply, OPT_ROUTER),
            Some(&[192, 168, 127, 1][..])
        );
        assert_eq!(option_value(&reply, OPT_DNS), Some(&[192, 168, 127, 1][..]));
        assert_eq!(
            option_value(&reply, OPT_SUBNET_MASK),
            Some(&[255, 255, 255, 0][..])
        );
        assert_eq!(
            option_value(&reply, OPT_LEASE_TIME),
            Some(&LEASE_SECS.to_be_bytes()[..])
        );
    }

    #[test]
    fn test_request_yields_ack() {
        let reply = responder().handle(&request(KNOWN_MAC, MSG_REQUEST)).unwrap();
        assert_eq!(option_value(&reply, OPT_MESSAGE_TYPE), Some(&[MSG_ACK][..]));
        assert_eq!(&reply[16..20], &[192, 168, 127, 2]);
    }

    #[test]
    fn test_unknown_chaddr_is_ignored() {
        let unknown = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
        assert!(responder().handle(&request(unknown, MSG_DISCOVER)).is_none());
    }

    #[test]
    fn test_other_message_types_ignored() {
        let release = 7;
        assert!(responder().handle(&request(KNOWN_MAC, release)).is_none());
    }

    #[test]
    fn test_truncated_packet_ignored() {
        assert!(responder().handle(&[0u8; 100]).is_none());
    }
}
