use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::UnixDatagram;
use tokio_util::sync::CancellationToken;

use vmgate_core::api::ApiError;
use vmgate_core::config::{Configuration, LinkDialect, MacAddress};
use vmgate_core::nat::NatTable;
use vmgate_core::ssh::bastion::ConnectCallback;
use vmgate_core::stats::TrafficCounters;
use vmgate_core::BoxedStream;

use crate::dhcp::DhcpResponder;
use crate::dns_service::DnsService;
use crate::forwarder::inbound::InboundForwarder;
use crate::forwarder::tcp::TcpForwarder;
use crate::forwarder::udp::UdpForwarder;
use crate::http::{self, ControlContext};
use crate::link::{vpnkit_negotiate, FrameCodec, LinkError};
use crate::stack::{spawn_stack, StackConfig, StackHandle};
use crate::switch::{build_udp_frame, classify, FrameClass, Switch};
use crate::transport::{LinkListener, TransportError};

const RESOLV_CONF: &str = "/etc/resolv.conf";
const BROADCAST_MAC: MacAddress = MacAddress([0xFF; 6]);

#[derive(Debug, Error)]
pub enum NetError {
    #[error("the VM link closed")]
    LinkClosed,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The assembled gateway: one switch, one stack, the forwarders and the
/// services living at the gateway address.
pub struct VirtualNetwork {
    config: Arc<Configuration>,
    counters: Arc<TrafficCounters>,
    switch: Arc<Switch>,
    stack: StackHandle,
    dhcp: DhcpResponder,
    tcp: Arc<TcpForwarder>,
    udp: Arc<UdpForwarder>,
    inbound: Arc<InboundForwarder>,
    control: Arc<ControlContext>,
    token: CancellationToken,
}

impl VirtualNetwork {
    pub fn new(config: Configuration, token: CancellationToken) -> Arc<VirtualNetwork> {
        let config = Arc::new(config);
        let counters = Arc::new(TrafficCounters::new());
        let switch = Arc::new(Switch::new(counters.clone()));
        let nat = Arc::new(NatTable::new(config.nat.clone()));
        let dhcp = DhcpResponder::new(&config);

        let upstreams = DnsService::upstreams_from_resolv_conf(Path::new(RESOLV_CONF));
        if upstreams.is_empty() {
            tracing::warn!("no host resolvers found; recursive DNS will fail");
        }
        let dns = Arc::new(DnsService::new(config.dns_zones.clone(), upstreams));

        let stack = spawn_stack(
            StackConfig {
                gateway_ip: config.gateway_ip,
                gateway_mac: config.gateway_mac,
                virtual_ips: config.gateway_virtual_ips.clone(),
                subnet_prefix: config.subnet.prefix_len(),
                mtu: config.mtu,
            },
            switch.clone(),
            token.clone(),
        );

        let inbound = InboundForwarder::new(
            stack.clone(),
            config.dial_timeout,
            counters.clone(),
            token.clone(),
        );
        let control = Arc::new(ControlContext {
            forwarder: inbound.clone(),
            nat: nat.clone(),
            counters: counters.clone(),
        });
        let tcp = TcpForwarder::new(
            config.gateway_ip,
            config.gateway_virtual_ips.clone(),
            config.dial_timeout,
            nat.clone(),
            stack.clone(),
            counters.clone(),
            control.clone(),
            token.clone(),
        );
        let udp = UdpForwarder::new(
            config.gateway_ip,
            config.gateway_mac,
            config.udp_idle_timeout,
            nat,
            dns,
            switch.clone(),
            token.clone(),
        );

        Arc::new(VirtualNetwork {
            config,
            counters,
            switch,
            stack,
            dhcp,
            tcp,
            udp,
            inbound,
            control,
            token,
        })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }

    pub fn control(&self) -> &Arc<ControlContext> {
        &self.control
    }

    /// Start the host listeners configured at boot.
    pub async fn start_forwards(&self) -> Result<(), ApiError> {
        for (local, remote) in &self.config.forwards {
            self.inbound
                .expose(local, remote, vmgate_core::api::TransportProtocol::Tcp)
                .await?;
            tracing::info!(%local, %remote, "forwarding");
        }
        Ok(())
    }

    /// Connect callback for the SSH forwarder: dial sshd inside the guest
    /// through the stack.
    pub fn ssh_dialer(self: &Arc<Self>) -> ConnectCallback {
        let stack = self.stack.clone();
        let addr = self.config.ssh_guest_addr;
        let timeout = self.config.dial_timeout;
        Arc::new(move || {
            let stack = stack.clone();
            Box::pin(async move {
                let stream = stack.dial(addr, timeout).await.map_err(io::Error::from)?;
                Ok(Box::new(stream) as BoxedStream)
            })
        })
    }

    /// Accept loop for one link listener. Single-connection dialects end
    /// the network when their connection ends.
    pub async fn run_link_listener(
        self: &Arc<Self>,
        listener: LinkListener,
        dialect: LinkDialect,
    ) -> Result<(), NetError> {
        if dialect.single_connection() {
            let conn = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            match self.serve_link(conn, dialect).await {
                Ok(()) => {
                    if self.token.is_cancelled() {
                        return Ok(());
                    }
                    Err(NetError::LinkClosed)
                }
                Err(e) => Err(NetError::Link(e)),
            }
        } else {
            loop {
                let conn = tokio::select! {
                    _ = self.token.cancelled() => return Ok(()),
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "link accept failed");
                            continue;
                        }
                    },
                };
                // one client at a time; a drop frees the slot for the next
                if let Err(e) = self.serve_link(conn, dialect).await {
                    tracing::error!(error = %e, "link connection ended");
                }
            }
        }
    }

    /// Drive one framed link connection until it ends.
    pub async fn serve_link(
        &self,
        mut conn: BoxedStream,
        dialect: LinkDialect,
    ) -> Result<(), LinkError> {
        if dialect == LinkDialect::HyperKit {
            let handshake =
                vpnkit_negotiate(&mut conn, &self.config.vpnkit_uuid_macs, self.config.mtu).await?;
            tracing::info!(mac = %handshake.mac, mtu = handshake.mtu, "vpnkit client attached");
        } else {
            tracing::info!(?dialect, "link client attached");
        }

        let codec = FrameCodec::new(dialect, self.config.mtu);
        let (mut read_half, mut write_half) = tokio::io::split(conn);

        let write_loop = async {
            loop {
                let frame = tokio::select! {
                    _ = self.token.cancelled() => return Ok(()),
                    frame = self.switch.next_for_guest() => frame,
                };
                codec.write_frame(&mut write_half, &frame).await?;
            }
        };
        let read_loop = async {
            let mut buf = Vec::with_capacity(codec.max_frame());
            loop {
                tokio::select! {
                    _ = self.token.cancelled() => return Ok(()),
                    read = codec.read_frame(&mut read_half, &mut buf) => { read?; }
                }
                self.handle_frame(std::mem::take(&mut buf)).await;
            }
        };

        tokio::select! {
            result = write_loop => result,
            result = read_loop => result,
        }
    }

    /// Drive a datagram link (one datagram per frame). Replies go to the
    /// last peer that sent us anything.
    pub async fn serve_datagram_link(&self, socket: UnixDatagram) -> io::Result<()> {
        let socket = Arc::new(socket);
        let peer: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
        let max_frame = self.config.mtu + crate::link::ETHERNET_HEADER_LEN;

        let recv_loop = {
            let socket = socket.clone();
            let peer = peer.clone();
            async move {
                let mut buf = vec![0u8; max_frame];
                loop {
                    let (n, from) = tokio::select! {
                        _ = self.token.cancelled() => return Ok(()),
                        received = socket.recv_from(&mut buf) => received?,
                    };
                    if let Some(path) = from.as_pathname() {
                        *peer.lock().unwrap() = Some(path.to_path_buf());
                    }
                    self.handle_frame(buf[..n].to_vec()).await;
                }
            }
        };
        let send_loop = async {
            loop {
                let frame = tokio::select! {
                    _ = self.token.cancelled() => return Ok::<(), io::Error>(()),
                    frame = self.switch.next_for_guest() => frame,
                };
                let target = peer.lock().unwrap().clone();
                if let Some(path) = target {
                    if let Err(e) = socket.send_to(&frame, &path).await {
                        tracing::debug!(error = %e, "datagram link send failed");
                    }
                }
            }
        };

        tokio::select! {
            result = recv_loop => result,
            result = send_loop => result,
        }
    }

    /// Accept loop for one control-surface listener.
    pub async fn run_services_listener(self: &Arc<Self>, listener: LinkListener) {
        loop {
            let conn = tokio::select! {
                _ = self.token.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "services accept failed");
                        continue;
                    }
                },
            };
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = http::serve_connection(conn, &this.control).await {
                    tracing::debug!(error = %e, "control connection ended");
                }
            });
        }
    }

    async fn handle_frame(&self, frame: Vec<u8>) {
        self.counters.add_received(frame.len() as u64);
        self.switch.learn_guest_mac(&frame);
        match classify(&frame) {
            FrameClass::Stack => self.stack.inject(frame).await,
            FrameClass::Dhcp { payload } => self.handle_dhcp(&payload),
            FrameClass::Udp { src, dst, payload } => {
                self.udp.handle_datagram(src, dst, payload).await;
            }
            FrameClass::TcpSyn { src, dst } => self.tcp.handle_syn(frame, src, dst).await,
            FrameClass::Discard => {}
        }
    }

    fn handle_dhcp(&self, payload: &[u8]) {
        let Some(reply) = self.dhcp.handle(payload) else {
            return;
        };
        let dst_mac = self.switch.guest_mac().unwrap_or(BROADCAST_MAC);
        let frame = build_udp_frame(
            self.config.gateway_mac,
            dst_mac,
            std::net::SocketAddrV4::new(self.config.gateway_ip, 67),
            std::net::SocketAddrV4::new(std::net::Ipv4Addr::BROADCAST, 68),
            &reply,
        );
        self.switch.send_to_guest(frame);
    }
}
