use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use vmgate_core::nat::{is_link_local, NatTable};
use vmgate_core::pump::pump;
use vmgate_core::stats::TrafficCounters;

use crate::http::{self, ControlContext};
use crate::stack::StackHandle;

const CONTROL_PORT: u16 = 80;

type FlowKey = (SocketAddrV4, SocketAddrV4);

/// Guest-initiated TCP flows.
///
/// A new SYN is held at the gate while the host side is dialed; only a
/// successful dial (or a locally served destination) admits the flow into
/// the stack. A failed dial feeds the SYN to a socketless stack, which
/// answers with a reset.
pub struct TcpForwarder {
    gateway_ip: Ipv4Addr,
    virtual_ips: Vec<Ipv4Addr>,
    dial_timeout: Duration,
    nat: Arc<NatTable>,
    stack: StackHandle,
    counters: Arc<TrafficCounters>,
    control: Arc<ControlContext>,
    /// Gated flows; `true` once admitted into the stack.
    flows: Mutex<HashMap<FlowKey, bool>>,
    token: CancellationToken,
}

impl TcpForwarder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway_ip: Ipv4Addr,
        virtual_ips: Vec<Ipv4Addr>,
        dial_timeout: Duration,
        nat: Arc<NatTable>,
        stack: StackHandle,
        counters: Arc<TrafficCounters>,
        control: Arc<ControlContext>,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway_ip,
            virtual_ips,
            dial_timeout,
            nat,
            stack,
            counters,
            control,
            flows: Mutex::new(HashMap::new()),
            token,
        })
    }

    /// Handle a SYN seen on the link.
    pub async fn handle_syn(self: &Arc<Self>, frame: Vec<u8>, src: SocketAddrV4, dst: SocketAddrV4) {
        if is_link_local(*dst.ip()) {
            return;
        }

        let key = (src, dst);
        let existing = {
            let mut flows = self.flows.lock().unwrap();
            let existing = flows.get(&key).copied();
            if existing.is_none() {
                flows.insert(key, false);
            }
            existing
        };
        match existing {
            // dial still in flight; drop the retransmission
            Some(false) => return,
            // admitted; the stack's socket owns retransmits now
            Some(true) => {
                self.stack.inject(frame).await;
                return;
            }
            None => {}
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.connect_flow(frame, key).await;
            this.flows.lock().unwrap().remove(&key);
        });
    }

    async fn connect_flow(self: &Arc<Self>, frame: Vec<u8>, key: FlowKey) {
        let (src, dst) = key;
        let translated = self.nat.translate(*dst.ip());

        // a gateway-claimed address with no rewrite is served in-process
        if translated == *dst.ip() && self.is_claimed(*dst.ip()) {
            if dst.port() == CONTROL_PORT {
                self.serve_control(frame, key).await;
            } else {
                // nothing listens here; the stack will refuse it
                self.stack.inject(frame).await;
            }
            return;
        }

        let target = SocketAddr::V4(SocketAddrV4::new(translated, dst.port()));
        let host_side =
            match tokio::time::timeout(self.dial_timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(src = %src, dst = %dst, target = %target, error = %e, "tcp dial failed");
                    self.stack.inject(frame).await;
                    return;
                }
                Err(_) => {
                    tracing::debug!(src = %src, dst = %dst, target = %target, "tcp dial timed out");
                    self.stack.inject(frame).await;
                    return;
                }
            };

        let guest_side = match self.stack.admit(frame, dst).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(src = %src, dst = %dst, error = %e, "flow not admitted");
                return;
            }
        };
        self.mark_admitted(key);
        self.counters.tcp_opened();
        tracing::debug!(src = %src, dst = %dst, target = %target, "tcp flow established");

        let result = tokio::select! {
            _ = self.token.cancelled() => Ok((0, 0)),
            pumped = pump(guest_side, host_side) => pumped,
        };
        match result {
            Ok((sent, received)) => {
                tracing::debug!(src = %src, dst = %dst, sent, received, "tcp flow closed");
            }
            Err(e) => tracing::debug!(src = %src, dst = %dst, error = %e, "tcp flow ended"),
        }
        self.counters.tcp_closed();
    }

    async fn serve_control(self: &Arc<Self>, frame: Vec<u8>, key: FlowKey) {
        let guest_side = match self.stack.admit(frame, key.1).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(dst = %key.1, error = %e, "control flow not admitted");
                return;
            }
        };
        self.mark_admitted(key);
        if let Err(e) = http::serve_connection(guest_side, &self.control).await {
            tracing::debug!(error = %e, "control connection ended");
        }
    }

    fn mark_admitted(&self, key: FlowKey) {
        if let Some(admitted) = self.flows.lock().unwrap().get_mut(&key) {
            *admitted = true;
        }
    }

    fn is_claimed(&self, ip: Ipv4Addr) -> bool {
        ip == self.gateway_ip || self.virtual_ips.contains(&ip)
    }
}
