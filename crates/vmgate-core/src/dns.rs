use std::net::Ipv4Addr;

use crate::config::Zone;

pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

/// Response codes carried in the low nibble of the second flags byte.
pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_NOTIMP: u8 = 4;

const ANSWER_TTL: u32 = 60;

/// Parsed single-question DNS query.
#[derive(Debug)]
pub struct DnsQuery {
    pub id: u16,
    /// Lowercase, with trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Offset one past the question section, for echoing it back.
    question_end: usize,
}

/// Parse a standard single-question query from a raw UDP payload.
pub fn parse_query(data: &[u8]) -> Option<DnsQuery> {
    if data.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qdcount = u16::from_be_bytes([data[4], data[5]]);

    // QR=0, OPCODE=0 only
    if flags & 0xF800 != 0 || qdcount == 0 {
        return None;
    }

    let mut offset = 12;
    let mut name = String::new();
    loop {
        let label_len = *data.get(offset)? as usize;
        offset += 1;
        if label_len == 0 {
            break;
        }
        // no compression pointers in a question
        if label_len >= 0xC0 {
            return None;
        }
        let label = data.get(offset..offset + label_len)?;
        name.push_str(std::str::from_utf8(label).ok()?);
        name.push('.');
        offset += label_len;
    }

    let qtype = u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]);
    let qclass = u16::from_be_bytes([*data.get(offset + 2)?, *data.get(offset + 3)?]);

    Some(DnsQuery {
        id,
        name: name.to_lowercase(),
        qtype,
        qclass,
        question_end: offset + 4,
    })
}

/// Outcome of matching a query name against the configured zones.
#[derive(Debug, PartialEq, Eq)]
pub enum ZoneAnswer {
    /// The name belongs to a zone and has records.
    Records(Vec<Ipv4Addr>),
    /// The name belongs to a zone but nothing matches.
    NameError,
    /// No zone claims the name; recurse upstream.
    NotHandled,
}

/// Authoritative lookup: the first zone whose name is a suffix of the query
/// owns the answer.
pub fn lookup_zones(zones: &[Zone], name: &str) -> ZoneAnswer {
    for zone in zones {
        let zone_name = zone.name.to_lowercase();
        let Some(prefix) = name.strip_suffix(&zone_name) else {
            continue;
        };
        // apex query: empty prefix; otherwise the prefix is one label plus dot
        let label = match prefix.strip_suffix('.') {
            Some(label) => label,
            None if prefix.is_empty() => "",
            None => continue,
        };
        let ips: Vec<Ipv4Addr> = zone
            .records
            .iter()
            .filter(|r| r.name.eq_ignore_ascii_case(label))
            .map(|r| r.ip)
            .collect();
        return if ips.is_empty() {
            ZoneAnswer::NameError
        } else {
            ZoneAnswer::Records(ips)
        };
    }
    ZoneAnswer::NotHandled
}

fn response_header(query: &DnsQuery, data: &[u8], rcode: u8, ancount: u16) -> Vec<u8> {
    let mut response = Vec::with_capacity(query.question_end + 16 * ancount as usize);
    response.extend_from_slice(&query.id.to_be_bytes());
    // QR=1, AA=1, preserve RD; RA=1
    response.push(0x84 | (data[2] & 0x01));
    response.push(0x80 | rcode);
    response.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    response.extend_from_slice(&ancount.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    response.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    response.extend_from_slice(&data[12..query.question_end]);
    response
}

/// Build an authoritative NOERROR answer carrying one A record per address.
pub fn build_a_response(query: &DnsQuery, data: &[u8], ips: &[Ipv4Addr]) -> Vec<u8> {
    let mut response = response_header(query, data, RCODE_NOERROR, ips.len() as u16);
    for ip in ips {
        // pointer to the question name at offset 12
        response.extend_from_slice(&[0xC0, 0x0C]);
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&CLASS_IN.to_be_bytes());
        response.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        response.extend_from_slice(&4u16.to_be_bytes());
        response.extend_from_slice(&ip.octets());
    }
    response
}

/// Build an empty response with the given RCODE, echoing the question.
pub fn build_error_response(query: &DnsQuery, data: &[u8], rcode: u8) -> Vec<u8> {
    response_header(query, data, rcode, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Record;

    fn query_bytes(name: &str, qtype: u16) -> Vec<u8> {
        let mut q = Vec::new();
        q.extend_from_slice(&[0x12, 0x34]); // ID
        q.extend_from_slice(&[0x01, 0x00]); // RD
        q.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
        q.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        for label in name.trim_end_matches('.').split('.') {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&qtype.to_be_bytes());
        q.extend_from_slice(&CLASS_IN.to_be_bytes());
        q
    }

    fn zones() -> Vec<Zone> {
        vec![Zone {
            name: "containers.internal.".to_string(),
            records: vec![
                Record {
                    name: "gateway".to_string(),
                    ip: Ipv4Addr::new(192, 168, 127, 1),
                },
                Record {
                    name: "host".to_string(),
                    ip: Ipv4Addr::new(192, 168, 127, 254),
                },
            ],
        }]
    }

    #[test]
    fn test_parse_query() {
        let data = query_bytes("Gateway.Containers.Internal.", TYPE_A);
        let query = parse_query(&data).unwrap();
        assert_eq!(query.id, 0x1234);
        assert_eq!(query.name, "gateway.containers.internal.");
        assert_eq!(query.qtype, TYPE_A);
        assert_eq!(query.qclass, CLASS_IN);
    }

    #[test]
    fn test_parse_rejects_responses_and_truncated() {
        let mut data = query_bytes("host.containers.internal.", TYPE_A);
        data[2] |= 0x80; // QR=1
        assert!(parse_query(&data).is_none());
        assert!(parse_query(&[0u8; 5]).is_none());
    }

    #[test]
    fn test_zone_lookup() {
        let zones = zones();
        assert_eq!(
            lookup_zones(&zones, "gateway.containers.internal."),
            ZoneAnswer::Records(vec![Ipv4Addr::new(192, 168, 127, 1)])
        );
        assert_eq!(
            lookup_zones(&zones, "host.containers.internal."),
            ZoneAnswer::Records(vec![Ipv4Addr::new(192, 168, 127, 254)])
        );
        assert_eq!(
            lookup_zones(&zones, "missing.containers.internal."),
            ZoneAnswer::NameError
        );
        assert_eq!(lookup_zones(&zones, "example.com."), ZoneAnswer::NotHandled);
    }

    #[test]
    fn test_a_response_carries_address() {
        let data = query_bytes("gateway.containers.internal.", TYPE_A);
        let query = parse_query(&data).unwrap();
        let response = build_a_response(&query, &data, &[Ipv4Addr::new(192, 168, 127, 1)]);

        assert_eq!(&response[0..2], &data[0..2]); // ID echoed
        assert_eq!(response[2] & 0x80, 0x80); // QR
        assert_eq!(response[3] & 0x0F, RCODE_NOERROR);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1); // ANCOUNT
        let tail: [u8; 4] = response[response.len() - 4..].try_into().unwrap();
        assert_eq!(Ipv4Addr::from(tail), Ipv4Addr::new(192, 168, 127, 1));
    }

    #[test]
    fn test_error_response_rcode() {
        let data = query_bytes("nope.containers.internal.", TYPE_A);
        let query = parse_query(&data).unwrap();
        let response = build_error_response(&query, &data, RCODE_NXDOMAIN);
        assert_eq!(response[3] & 0x0F, RCODE_NXDOMAIN);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 0);
        // question echoed back intact
        assert_eq!(&response[12..], &data[12..]);
    }
}
