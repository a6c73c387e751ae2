use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use vmgate_core::config::MacAddress;
use vmgate_core::nat::{is_link_local, NatTable};
use vmgate_core::stats::TrafficCounters;

use crate::dns_service::DnsService;
use crate::switch::{build_udp_frame, Switch};

const DNS_PORT: u16 = 53;
const FLOW_QUEUE: usize = 64;
const DATAGRAM_MAX: usize = 65535;

type FlowKey = (SocketAddrV4, SocketAddrV4);

/// Per-flow UDP proxying with idle expiry.
///
/// Flows are keyed on (guest endpoint, original destination); each owns a
/// host socket and a task that dies after the idle interval without
/// traffic. DNS for the gateway address short-circuits into the mini-DNS.
pub struct UdpForwarder {
    gateway_ip: Ipv4Addr,
    gateway_mac: MacAddress,
    idle_timeout: Duration,
    nat: Arc<NatTable>,
    dns: Arc<DnsService>,
    switch: Arc<Switch>,
    counters: Arc<TrafficCounters>,
    flows: Mutex<HashMap<FlowKey, mpsc::Sender<Vec<u8>>>>,
    token: CancellationToken,
}

impl UdpForwarder {
    pub fn new(
        gateway_ip: Ipv4Addr,
        gateway_mac: MacAddress,
        idle_timeout: Duration,
        nat: Arc<NatTable>,
        dns: Arc<DnsService>,
        switch: Arc<Switch>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let counters = switch.counters().clone();
        Arc::new(Self {
            gateway_ip,
            gateway_mac,
            idle_timeout,
            nat,
            dns,
            switch,
            counters,
            flows: Mutex::new(HashMap::new()),
            token,
        })
    }

    /// Route one datagram from the guest.
    pub async fn handle_datagram(
        self: &Arc<Self>,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: Vec<u8>,
    ) {
        if *dst.ip() == self.gateway_ip && dst.port() == DNS_PORT {
            self.serve_dns(src, dst, payload).await;
            return;
        }
        if is_link_local(*dst.ip()) {
            return;
        }

        let key = (src, dst);
        let sender = {
            let flows = self.flows.lock().unwrap();
            flows.get(&key).cloned()
        };
        let sender = match sender {
            Some(sender) => sender,
            None => self.open_flow(key).await,
        };
        // a full queue or a just-expired flow costs this datagram only
        let _ = sender.try_send(payload);
    }

    async fn serve_dns(self: &Arc<Self>, src: SocketAddrV4, dst: SocketAddrV4, payload: Vec<u8>) {
        let this = self.clone();
        let Some(guest_mac) = self.switch.guest_mac() else {
            return;
        };
        tokio::spawn(async move {
            if let Some(answer) = this.dns.handle_query(&payload).await {
                let frame = build_udp_frame(this.gateway_mac, guest_mac, dst, src, &answer);
                this.switch.send_to_guest(frame);
            }
        });
    }

    async fn open_flow(self: &Arc<Self>, key: FlowKey) -> mpsc::Sender<Vec<u8>> {
        let (tx, rx) = mpsc::channel(FLOW_QUEUE);
        {
            let mut flows = self.flows.lock().unwrap();
            if let Some(existing) = flows.get(&key) {
                return existing.clone();
            }
            flows.insert(key, tx.clone());
        }
        self.counters.udp_flow_opened();

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_flow(key, rx).await {
                tracing::debug!(src = %key.0, dst = %key.1, error = %e, "udp flow ended");
            }
            this.flows.lock().unwrap().remove(&key);
            this.counters.udp_flow_closed();
        });
        tx
    }

    async fn run_flow(
        self: &Arc<Self>,
        (src, dst): FlowKey,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) -> std::io::Result<()> {
        let target = SocketAddrV4::new(self.nat.translate(*dst.ip()), dst.port());
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(SocketAddr::V4(target)).await?;
        tracing::debug!(src = %src, dst = %dst, target = %target, "udp flow opened");

        let mut buf = vec![0u8; DATAGRAM_MAX];
        let mut deadline = Instant::now() + self.idle_timeout;
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                outbound = rx.recv() => {
                    match outbound {
                        Some(datagram) => {
                            socket.send(&datagram).await?;
                            deadline = Instant::now() + self.idle_timeout;
                        }
                        None => break,
                    }
                }
                inbound = socket.recv(&mut buf) => {
                    let n = inbound?;
                    // replies appear to come from the address the guest
                    // actually sent to
                    if let Some(guest_mac) = self.switch.guest_mac() {
                        let frame = build_udp_frame(
                            self.gateway_mac,
                            guest_mac,
                            dst,
                            src,
                            &buf[..n],
                        );
                        self.switch.send_to_guest(frame);
                    }
                    deadline = Instant::now() + self.idle_timeout;
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        Ok(())
    }

    pub fn active_flows(&self) -> usize {
        self.flows.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use vmgate_core::config::{Configuration, LinkDialect};

    fn forwarder(idle: Duration) -> Arc<UdpForwarder> {
        let config = Configuration::default_plan(1500, 2222, LinkDialect::HyperKit, false).unwrap();
        let counters = Arc::new(TrafficCounters::new());
        let switch = Arc::new(Switch::new(counters));
        // teach the switch a guest MAC so replies can be framed
        let mut frame = vec![0u8; 64];
        frame[6..12].copy_from_slice(&[0x5A, 0x94, 0xEF, 0xE4, 0x0C, 0xEE]);
        switch.learn_guest_mac(&frame);

        UdpForwarder::new(
            config.gateway_ip,
            config.gateway_mac,
            idle,
            Arc::new(NatTable::new(config.nat.clone())),
            Arc::new(DnsService::new(config.dns_zones.clone(), Vec::new())),
            switch,
            CancellationToken::new(),
        )
    }

    fn guest(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 2), port)
    }

    #[tokio::test]
    async fn test_link_local_never_creates_flow() {
        let fwd = forwarder(Duration::from_secs(90));
        let dst = SocketAddrV4::new(Ipv4Addr::new(169, 254, 10, 10), 9999);
        fwd.handle_datagram(guest(5000), dst, b"nope".to_vec()).await;
        assert_eq!(fwd.active_flows(), 0);
    }

    #[tokio::test]
    async fn test_flow_roundtrip_and_reuse() {
        let fwd = forwarder(Duration::from_secs(90));

        // an echo peer on the host loopback
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            loop {
                let Ok((n, from)) = echo.recv_from(&mut buf).await else {
                    break;
                };
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        // the virtual host address is rewritten to loopback before dialing
        let dst = SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 254), echo_port);
        fwd.handle_datagram(guest(5000), dst, b"ping".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fwd.active_flows(), 1);

        // the reply comes back as a frame sourced from the original address
        let frame = fwd.switch.next_for_guest().await;
        let parsed = crate::switch::classify(&frame);
        match parsed {
            crate::switch::FrameClass::Udp { src, dst: to, payload } => {
                assert_eq!(src, dst);
                assert_eq!(to, guest(5000));
                assert_eq!(payload, b"ping");
            }
            other => panic!("expected a udp reply frame, got {other:?}"),
        }

        // same 4-tuple reuses the flow
        fwd.handle_datagram(guest(5000), dst, b"pong".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fwd.active_flows(), 1);
    }

    #[tokio::test]
    async fn test_idle_flow_expires_and_remaps() {
        let fwd = forwarder(Duration::from_millis(100));

        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();
        let dst = SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 254), port);

        fwd.handle_datagram(guest(6000), dst, b"one".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fwd.active_flows(), 1);

        // no traffic for longer than the idle interval: the mapping is gone
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fwd.active_flows(), 0);

        // a later datagram on the same tuple creates a fresh mapping
        fwd.handle_datagram(guest(6000), dst, b"two".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fwd.active_flows(), 1);
    }

    #[tokio::test]
    async fn test_dns_query_answered_from_zones() {
        let fwd = forwarder(Duration::from_secs(90));

        let mut query = Vec::new();
        query.extend_from_slice(&[0x12, 0x34, 0x01, 0x00, 0x00, 0x01]);
        query.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        for label in ["gateway", "containers", "internal"] {
            query.push(label.len() as u8);
            query.extend_from_slice(label.as_bytes());
        }
        query.push(0);
        query.extend_from_slice(&1u16.to_be_bytes());
        query.extend_from_slice(&1u16.to_be_bytes());

        let dns_at = SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 1), 53);
        fwd.handle_datagram(guest(7000), dns_at, query).await;

        let frame = fwd.switch.next_for_guest().await;
        match crate::switch::classify(&frame) {
            crate::switch::FrameClass::Udp { src, dst: to, payload } => {
                assert_eq!(src, dns_at);
                assert_eq!(to, guest(7000));
                let tail: [u8; 4] = payload[payload.len() - 4..].try_into().unwrap();
                assert_eq!(Ipv4Addr::from(tail), Ipv4Addr::new(192, 168, 127, 1));
            }
            other => panic!("expected a dns reply frame, got {other:?}"),
        }
        // no proxy flow for gateway dns
        assert_eq!(fwd.active_flows(), 0);
    }
}
