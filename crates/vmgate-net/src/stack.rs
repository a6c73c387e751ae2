use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    EthernetAddress, HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::{CancellationToken, PollSender};

use vmgate_core::config::MacAddress;

use crate::switch::Switch;

const TCP_BUFFER_SIZE: usize = 256 * 1024;
const CHUNK_SIZE: usize = 16 * 1024;
const CHANNEL_DEPTH: usize = 32;
const MAX_CONNECTIONS: usize = 1024;
const EPHEMERAL_PORT_START: u16 = 40000;
const EPHEMERAL_PORT_END: u16 = 65000;
/// Wakeup ceiling when smoltcp has no timer pending.
const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum StackError {
    #[error("connection refused")]
    Refused,
    #[error("connect timed out")]
    TimedOut,
    #[error("connection table is full")]
    ConnectionLimit,
    #[error("listen failed: {0}")]
    Listen(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("stack is shut down")]
    Closed,
}

impl From<StackError> for io::Error {
    fn from(e: StackError) -> io::Error {
        let kind = match e {
            StackError::Refused => io::ErrorKind::ConnectionRefused,
            StackError::TimedOut => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

/// Parameters for the in-process stack.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: MacAddress,
    /// Additional /32 addresses the interface answers ARP for.
    pub virtual_ips: Vec<Ipv4Addr>,
    pub subnet_prefix: u8,
    pub mtu: usize,
}

enum StackCmd {
    /// Raw Ethernet frame from the guest.
    Inject(Vec<u8>),
    /// Gated SYN: listen on exactly its destination, feed the frame in, and
    /// hand back the flow as a stream.
    Admit {
        frame: Vec<u8>,
        local: SocketAddrV4,
        reply: oneshot::Sender<Result<StackStream, StackError>>,
    },
    /// Open a connection through the stack toward the guest.
    Dial {
        remote: SocketAddrV4,
        timeout: Duration,
        reply: oneshot::Sender<Result<StackStream, StackError>>,
    },
}

/// Handle used by the forwarders to reach the stack task.
#[derive(Clone)]
pub struct StackHandle {
    cmd_tx: mpsc::Sender<StackCmd>,
    notify: Arc<Notify>,
}

impl StackHandle {
    /// Dispatch a frame into the stack (wire to stack direction).
    pub async fn inject(&self, frame: Vec<u8>) {
        if self.cmd_tx.send(StackCmd::Inject(frame)).await.is_err() {
            tracing::debug!("frame dropped, stack is gone");
        }
        self.notify.notify_one();
    }

    /// Admit a gated SYN and return the guest-side flow.
    pub async fn admit(&self, frame: Vec<u8>, local: SocketAddrV4) -> Result<StackStream, StackError> {
        let (reply, answer) = oneshot::channel();
        self.cmd_tx
            .send(StackCmd::Admit { frame, local, reply })
            .await
            .map_err(|_| StackError::Closed)?;
        self.notify.notify_one();
        answer.await.map_err(|_| StackError::Closed)?
    }

    /// Dial into the guest; resolves once established or failed.
    pub async fn dial(
        &self,
        remote: SocketAddrV4,
        timeout: Duration,
    ) -> Result<StackStream, StackError> {
        let (reply, answer) = oneshot::channel();
        self.cmd_tx
            .send(StackCmd::Dial {
                remote,
                timeout,
                reply,
            })
            .await
            .map_err(|_| StackError::Closed)?;
        self.notify.notify_one();
        answer.await.map_err(|_| StackError::Closed)?
    }
}

/// One TCP flow surfaced as an async byte stream.
///
/// Reads see guest bytes in order and EOF once the guest half-closes.
/// Shutting down the write half sends a FIN after buffered data drains;
/// dropping the whole stream closes the flow the same way, discarding
/// anything the guest still sends.
pub struct StackStream {
    rx: mpsc::Receiver<Bytes>,
    leftover: Option<Bytes>,
    tx: PollSender<Bytes>,
    notify: Arc<Notify>,
    endpoint: SocketAddrV4,
}

impl StackStream {
    /// The flow endpoint this stream stands in for: the guest's chosen
    /// destination for admitted flows, the dialed guest address for dials.
    pub fn endpoint(&self) -> SocketAddrV4 {
        self.endpoint
    }
}

impl AsyncRead for StackStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(chunk) = self.leftover.take() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            if n < chunk.len() {
                self.leftover = Some(chunk.slice(n..));
            }
            return Poll::Ready(Ok(()));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.leftover = Some(chunk.slice(n..));
                }
                self.notify.notify_one();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())), // FIN from the peer
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for StackStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(CHUNK_SIZE);
                if self.tx.send_item(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                self.notify.notify_one();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        self.notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for StackStream {
    fn drop(&mut self) {
        self.notify.notify_one();
    }
}

/// In-memory phy device: queues of whole Ethernet frames.
struct VirtualDevice {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl VirtualDevice {
    fn new(mtu: usize) -> Self {
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            mtu,
        }
    }
}

struct VirtRxToken(Vec<u8>);

impl RxToken for VirtRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct VirtTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for VirtTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.0.push_back(buf);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtRxToken;
    type TxToken<'a> = VirtTxToken<'a>;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.inbound
            .pop_front()
            .map(|frame| (VirtRxToken(frame), VirtTxToken(&mut self.outbound)))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(VirtTxToken(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.mtu + crate::link::ETHERNET_HEADER_LEN;
        caps
    }
}

fn smoltcp_now() -> SmolInstant {
    let millis = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    SmolInstant::from_millis(millis)
}

/// A pending dial awaiting establishment.
struct PendingConnect {
    reply: oneshot::Sender<Result<StackStream, StackError>>,
    stream: Option<StackStream>,
    deadline: Instant,
}

struct Conn {
    handle: SocketHandle,
    /// Socket to adapter; `None` once EOF has been delivered or the reader
    /// went away.
    to_peer: Option<mpsc::Sender<Bytes>>,
    from_peer: mpsc::Receiver<Bytes>,
    pending_in: Option<Bytes>,
    pending_out: Option<Bytes>,
    out_offset: usize,
    peer_write_closed: bool,
    fin_queued: bool,
    established_seen: bool,
    connect: Option<PendingConnect>,
    dial_port: Option<u16>,
}

/// Spawn the owning task for the in-process stack. Frames the stack emits
/// land in the switch's outbound queue.
pub fn spawn_stack(
    config: StackConfig,
    switch: Arc<Switch>,
    token: CancellationToken,
) -> StackHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(512);
    let notify = Arc::new(Notify::new());
    let handle = StackHandle {
        cmd_tx,
        notify: notify.clone(),
    };

    tokio::spawn(run_stack(config, switch, token, cmd_rx, notify));
    handle
}

async fn run_stack(
    config: StackConfig,
    switch: Arc<Switch>,
    token: CancellationToken,
    mut cmd_rx: mpsc::Receiver<StackCmd>,
    notify: Arc<Notify>,
) {
    let mut device = VirtualDevice::new(config.mtu);
    let hw_addr = HardwareAddress::Ethernet(EthernetAddress(config.gateway_mac.0));
    let mut iface = Interface::new(IfaceConfig::new(hw_addr), &mut device, smoltcp_now());
    iface.update_ip_addrs(|addrs| {
        addrs
            .push(IpCidr::new(
                IpAddress::Ipv4(config.gateway_ip),
                config.subnet_prefix,
            ))
            .expect("gateway address fits the interface address table");
        for vip in &config.virtual_ips {
            addrs
                .push(IpCidr::new(IpAddress::Ipv4(*vip), 32))
                .expect("virtual address fits the interface address table");
        }
    });
    // flows are admitted for arbitrary external destinations
    iface.set_any_ip(true);
    iface
        .routes_mut()
        .add_default_ipv4_route(config.gateway_ip)
        .expect("default route fits the route table");

    let mut sockets = SocketSet::new(vec![]);
    let mut conns: Vec<Conn> = Vec::new();
    let mut dial_ports: HashMap<u16, ()> = HashMap::new();
    let mut next_port = EPHEMERAL_PORT_START;

    tracing::debug!(gateway = %config.gateway_ip, "stack task started");

    loop {
        // drain control traffic before every poll
        loop {
            match cmd_rx.try_recv() {
                Ok(cmd) => handle_cmd(
                    cmd,
                    &config,
                    &notify,
                    &mut iface,
                    &mut sockets,
                    &mut device,
                    &mut conns,
                    &mut dial_ports,
                    &mut next_port,
                ),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        let now = smoltcp_now();
        let _ = iface.poll(now, &mut device, &mut sockets);

        conns.retain_mut(|conn| {
            let keep = service_conn(conn, &mut sockets);
            if !keep {
                sockets.remove(conn.handle);
                if let Some(port) = conn.dial_port.take() {
                    dial_ports.remove(&port);
                }
            }
            keep
        });

        // poll again so freshly queued socket data becomes segments now
        // rather than on the next wakeup
        let _ = iface.poll(smoltcp_now(), &mut device, &mut sockets);

        while let Some(frame) = device.outbound.pop_front() {
            switch.send_to_guest(frame);
        }

        let delay = iface
            .poll_delay(smoltcp_now(), &sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
            .unwrap_or(IDLE_POLL);
        if delay == Duration::ZERO {
            continue;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => handle_cmd(
                        cmd,
                        &config,
                        &notify,
                        &mut iface,
                        &mut sockets,
                        &mut device,
                        &mut conns,
                        &mut dial_ports,
                        &mut next_port,
                    ),
                    // every handle is gone; nothing can admit or dial again
                    None => break,
                }
            }
            _ = notify.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    for conn in &mut conns {
        if let Some(pending) = conn.connect.take() {
            let _ = pending.reply.send(Err(StackError::Closed));
        }
        sockets.get_mut::<tcp::Socket>(conn.handle).abort();
    }
    tracing::debug!("stack task stopped");
}

#[allow(clippy::too_many_arguments)]
fn handle_cmd(
    cmd: StackCmd,
    config: &StackConfig,
    notify: &Arc<Notify>,
    iface: &mut Interface,
    sockets: &mut SocketSet<'static>,
    device: &mut VirtualDevice,
    conns: &mut Vec<Conn>,
    dial_ports: &mut HashMap<u16, ()>,
    next_port: &mut u16,
) {
    match cmd {
        StackCmd::Inject(frame) => device.inbound.push_back(frame),
        StackCmd::Admit {
            frame,
            local,
            reply,
        } => {
            if conns.len() >= MAX_CONNECTIONS {
                // still inject so the stack answers the SYN with a reset
                device.inbound.push_back(frame);
                let _ = reply.send(Err(StackError::ConnectionLimit));
                return;
            }
            let mut socket = new_socket();
            let endpoint = IpListenEndpoint {
                addr: Some(IpAddress::Ipv4(*local.ip())),
                port: local.port(),
            };
            if let Err(e) = socket.listen(endpoint) {
                device.inbound.push_back(frame);
                let _ = reply.send(Err(StackError::Listen(e.to_string())));
                return;
            }
            let handle = sockets.add(socket);
            device.inbound.push_back(frame);
            let (conn, stream) = new_conn(handle, local, notify.clone());
            conns.push(conn);
            let _ = reply.send(Ok(stream));
        }
        StackCmd::Dial {
            remote,
            timeout,
            reply,
        } => {
            if conns.len() >= MAX_CONNECTIONS {
                let _ = reply.send(Err(StackError::ConnectionLimit));
                return;
            }
            let Some(port) = allocate_port(dial_ports, next_port) else {
                let _ = reply.send(Err(StackError::ConnectionLimit));
                return;
            };
            let mut socket = new_socket();
            let local = IpEndpoint::new(IpAddress::Ipv4(config.gateway_ip), port);
            let remote_endpoint = IpEndpoint::new(IpAddress::Ipv4(*remote.ip()), remote.port());
            if let Err(e) = socket.connect(iface.context(), remote_endpoint, local) {
                dial_ports.remove(&port);
                let _ = reply.send(Err(StackError::Connect(e.to_string())));
                return;
            }
            let handle = sockets.add(socket);
            let (mut conn, stream) = new_conn(handle, remote, notify.clone());
            conn.dial_port = Some(port);
            conn.connect = Some(PendingConnect {
                reply,
                stream: Some(stream),
                deadline: Instant::now() + timeout,
            });
            conns.push(conn);
        }
    }
}

fn new_socket() -> tcp::Socket<'static> {
    let rx = tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]);
    let tx = tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]);
    let mut socket = tcp::Socket::new(rx, tx);
    socket.set_nagle_enabled(false);
    socket
}

fn new_conn(handle: SocketHandle, peer: SocketAddrV4, notify: Arc<Notify>) -> (Conn, StackStream) {
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
    let conn = Conn {
        handle,
        to_peer: Some(in_tx),
        from_peer: out_rx,
        pending_in: None,
        pending_out: None,
        out_offset: 0,
        peer_write_closed: false,
        fin_queued: false,
        established_seen: false,
        connect: None,
        dial_port: None,
    };
    let stream = StackStream {
        rx: in_rx,
        leftover: None,
        tx: PollSender::new(out_tx),
        notify,
        endpoint: peer,
    };
    (conn, stream)
}

fn allocate_port(dial_ports: &mut HashMap<u16, ()>, next_port: &mut u16) -> Option<u16> {
    for _ in EPHEMERAL_PORT_START..EPHEMERAL_PORT_END {
        let candidate = *next_port;
        *next_port = if candidate >= EPHEMERAL_PORT_END {
            EPHEMERAL_PORT_START
        } else {
            candidate + 1
        };
        if !dial_ports.contains_key(&candidate) {
            dial_ports.insert(candidate, ());
            return Some(candidate);
        }
    }
    None
}

/// Move bytes between one socket and its adapter. Returns false when the
/// connection is finished and the socket can be dropped.
fn service_conn(conn: &mut Conn, sockets: &mut SocketSet<'static>) -> bool {
    let socket = sockets.get_mut::<tcp::Socket>(conn.handle);
    let state = socket.state();

    if matches!(
        state,
        tcp::State::Established
            | tcp::State::FinWait1
            | tcp::State::FinWait2
            | tcp::State::CloseWait
            | tcp::State::Closing
            | tcp::State::LastAck
            | tcp::State::TimeWait
    ) {
        conn.established_seen = true;
    }

    // resolve a pending dial
    if let Some(pending) = conn.connect.take() {
        if conn.established_seen {
            if let Some(stream) = pending.stream {
                let _ = pending.reply.send(Ok(stream));
            }
        } else if state == tcp::State::Closed {
            let _ = pending.reply.send(Err(StackError::Refused));
            return false;
        } else if Instant::now() >= pending.deadline {
            socket.abort();
            let _ = pending.reply.send(Err(StackError::TimedOut));
            return false;
        } else {
            conn.connect = Some(pending);
        }
    }

    // nobody reads this flow anymore; discard inbound, the write side
    // still drains and closes gracefully below
    if let Some(to_peer) = &conn.to_peer {
        if to_peer.is_closed() {
            conn.to_peer = None;
            conn.pending_in = None;
        }
    }

    // adapter -> socket
    loop {
        if conn.pending_out.is_none() {
            match conn.from_peer.try_recv() {
                Ok(chunk) => {
                    conn.pending_out = Some(chunk);
                    conn.out_offset = 0;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    conn.peer_write_closed = true;
                    break;
                }
            }
        }
        let Some(chunk) = conn.pending_out.as_ref() else {
            break;
        };
        if !socket.can_send() {
            break;
        }
        match socket.send_slice(&chunk[conn.out_offset..]) {
            Ok(sent) => {
                conn.out_offset += sent;
                if conn.out_offset >= chunk.len() {
                    conn.pending_out = None;
                } else {
                    break; // window is full
                }
            }
            Err(tcp::SendError::InvalidState) => {
                conn.pending_out = None;
                conn.peer_write_closed = true;
                break;
            }
        }
    }
    if conn.peer_write_closed && conn.pending_out.is_none() && !conn.fin_queued {
        socket.close();
        conn.fin_queued = true;
    }

    // socket -> adapter
    loop {
        if conn.pending_in.is_none() {
            if !socket.can_recv() {
                break;
            }
            let mut scratch = [0u8; CHUNK_SIZE];
            match socket.recv_slice(&mut scratch) {
                Ok(0) => break,
                Ok(n) => conn.pending_in = Some(Bytes::copy_from_slice(&scratch[..n])),
                Err(_) => break,
            }
        }
        let Some(to_peer) = conn.to_peer.as_ref() else {
            conn.pending_in = None;
            break;
        };
        let chunk = conn.pending_in.take().unwrap();
        match to_peer.try_send(chunk) {
            Ok(()) => continue,
            Err(TrySendError::Full(chunk)) => {
                conn.pending_in = Some(chunk);
                break;
            }
            Err(TrySendError::Closed(_)) => {
                conn.to_peer = None;
                break;
            }
        }
    }

    // guest sent FIN and everything buffered has been delivered: EOF
    if conn.established_seen && !socket.may_recv() && conn.pending_in.is_none() {
        conn.to_peer = None;
    }

    if state == tcp::State::Closed && conn.pending_in.is_none() {
        conn.to_peer = None;
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_allocator_wraps_and_skips() {
        let mut ports = HashMap::new();
        let mut next = EPHEMERAL_PORT_END - 1;
        assert_eq!(allocate_port(&mut ports, &mut next), Some(EPHEMERAL_PORT_END - 1));
        assert_eq!(allocate_port(&mut ports, &mut next), Some(EPHEMERAL_PORT_END));
        // wrapped around
        assert_eq!(allocate_port(&mut ports, &mut next), Some(EPHEMERAL_PORT_START));
        // a held port is skipped
        let mut next = EPHEMERAL_PORT_START;
        assert_eq!(allocate_port(&mut ports, &mut next), Some(EPHEMERAL_PORT_START + 1));
    }

    fn test_handle() -> SocketHandle {
        let mut sockets = SocketSet::new(vec![]);
        sockets.add(new_socket())
    }

    #[tokio::test]
    async fn test_stream_eof_after_channel_close() {
        use tokio::io::AsyncReadExt;
        let notify = Arc::new(Notify::new());
        let (conn, mut stream) = new_conn(
            test_handle(),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 2), 80),
            notify,
        );
        drop(conn); // closes the socket-side sender

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_stream_write_then_drain() {
        use tokio::io::AsyncWriteExt;
        let notify = Arc::new(Notify::new());
        let (mut conn, mut stream) = new_conn(
            test_handle(),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 127, 2), 80),
            notify,
        );
        stream.write_all(b"payload").await.unwrap();
        stream.shutdown().await.unwrap();

        let chunk = conn.from_peer.recv().await.unwrap();
        assert_eq!(&chunk[..], b"payload");
        assert!(conn.from_peer.recv().await.is_none()); // write half closed
    }
}
