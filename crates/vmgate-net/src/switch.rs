use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpAddress, IpProtocol,
    Ipv4Packet, Ipv4Repr, TcpPacket, UdpPacket, UdpRepr,
};
use tokio::sync::Notify;

use vmgate_core::config::MacAddress;
use vmgate_core::stats::TrafficCounters;

/// Outbound frames queued toward the VM before the oldest is dropped.
const TX_QUEUE_DEPTH: usize = 512;

const DHCP_SERVER_PORT: u16 = 67;

/// Where an inbound frame goes after classification.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameClass {
    /// ARP, ICMP and established/neutral TCP traffic: inject into the stack.
    Stack,
    /// UDP to port 67: DHCP, answered at frame level.
    Dhcp { payload: Vec<u8> },
    /// Any other UDP, handed to the UDP forwarder.
    Udp {
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: Vec<u8>,
    },
    /// The first segment of a new guest-initiated TCP flow.
    TcpSyn { src: SocketAddrV4, dst: SocketAddrV4 },
    /// Not for us.
    Discard,
}

/// Classify one Ethernet frame from the guest.
pub fn classify(frame: &[u8]) -> FrameClass {
    let Ok(eth) = EthernetFrame::new_checked(frame) else {
        return FrameClass::Discard;
    };
    match eth.ethertype() {
        EthernetProtocol::Arp => FrameClass::Stack,
        EthernetProtocol::Ipv4 => {
            let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
                return FrameClass::Discard;
            };
            match ip.next_header() {
                IpProtocol::Udp => {
                    let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
                        return FrameClass::Discard;
                    };
                    if udp.dst_port() == DHCP_SERVER_PORT {
                        FrameClass::Dhcp {
                            payload: udp.payload().to_vec(),
                        }
                    } else {
                        FrameClass::Udp {
                            src: SocketAddrV4::new(ip.src_addr(), udp.src_port()),
                            dst: SocketAddrV4::new(ip.dst_addr(), udp.dst_port()),
                            payload: udp.payload().to_vec(),
                        }
                    }
                }
                IpProtocol::Tcp => {
                    let Ok(tcp) = TcpPacket::new_checked(ip.payload()) else {
                        return FrameClass::Discard;
                    };
                    if tcp.syn() && !tcp.ack() {
                        FrameClass::TcpSyn {
                            src: SocketAddrV4::new(ip.src_addr(), tcp.src_port()),
                            dst: SocketAddrV4::new(ip.dst_addr(), tcp.dst_port()),
                        }
                    } else {
                        FrameClass::Stack
                    }
                }
                IpProtocol::Icmp => FrameClass::Stack,
                _ => FrameClass::Discard,
            }
        }
        _ => FrameClass::Discard,
    }
}

/// Build a complete Ethernet/IPv4/UDP frame with computed checksums.
pub fn build_udp_frame(
    src_mac: MacAddress,
    dst_mac: MacAddress,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    let checksums = ChecksumCapabilities::default();
    let udp_repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let ip_repr = Ipv4Repr {
        src_addr: *src.ip(),
        dst_addr: *dst.ip(),
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac.0),
        dst_addr: EthernetAddress(dst_mac.0),
        ethertype: EthernetProtocol::Ipv4,
    };

    let mut buf = vec![0u8; eth_repr.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len];
    let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
    eth_repr.emit(&mut eth);
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &checksums);
    let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
    udp_repr.emit(
        &mut udp,
        &IpAddress::Ipv4(*src.ip()),
        &IpAddress::Ipv4(*dst.ip()),
        payload.len(),
        |b| b.copy_from_slice(payload),
        &checksums,
    );
    buf
}

/// The virtual NIC's host side: outbound frames pass through one bounded
/// queue, inbound classification happens in the link read loop. Holds the
/// byte counters and the learned guest MAC.
pub struct Switch {
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    counters: Arc<TrafficCounters>,
    guest_mac: Mutex<Option<MacAddress>>,
}

impl Switch {
    pub fn new(counters: Arc<TrafficCounters>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(TX_QUEUE_DEPTH)),
            notify: Notify::new(),
            counters,
            guest_mac: Mutex::new(None),
        }
    }

    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }

    /// Queue a frame toward the VM. A full queue drops the oldest frame and
    /// counts it.
    pub fn send_to_guest(&self, frame: Vec<u8>) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= TX_QUEUE_DEPTH {
                queue.pop_front();
                self.counters.add_dropped_frame();
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Wait for the next frame to write to the VM link.
    pub async fn next_for_guest(&self) -> Vec<u8> {
        loop {
            if let Some(frame) = self.queue.lock().unwrap().pop_front() {
                self.counters.add_sent(frame.len() as u64);
                return frame;
            }
            self.notify.notified().await;
        }
    }

    /// Record the sender address of an inbound frame.
    pub fn learn_guest_mac(&self, frame: &[u8]) {
        if frame.len() < 12 {
            return;
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&frame[6..12]);
        // broadcast/multicast sources are not endpoints
        if mac[0] & 0x01 != 0 {
            return;
        }
        *self.guest_mac.lock().unwrap() = Some(MacAddress(mac));
    }

    pub fn guest_mac(&self) -> Option<MacAddress> {
        *self.guest_mac.lock().unwrap()
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
