use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

use vmgate_core::api::{ApiError, ForwardEntry, TransportProtocol};
use vmgate_core::pump::pump;
use vmgate_core::stats::TrafficCounters;
use vmgate_core::BoxedStream;

use crate::stack::StackHandle;
use crate::transport::LinkListener;

type ForwardKey = (String, TransportProtocol);

struct Entry {
    remote: SocketAddrV4,
    cancel: CancellationToken,
}

/// Host-side listeners that dial into the guest through the stack.
///
/// The listener set is mutated at runtime by the control surface; one mutex
/// guards it, and each listener carries a child token so removal releases
/// the port promptly.
pub struct InboundForwarder {
    entries: Mutex<HashMap<ForwardKey, Entry>>,
    stack: StackHandle,
    dial_timeout: Duration,
    counters: Arc<TrafficCounters>,
    token: CancellationToken,
}

impl InboundForwarder {
    pub fn new(
        stack: StackHandle,
        dial_timeout: Duration,
        counters: Arc<TrafficCounters>,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            stack,
            dial_timeout,
            counters,
            token,
        })
    }

    /// Bind `local` and forward each accepted connection to `remote` inside
    /// the guest. Conflicts on a live `{local, protocol}` are structured
    /// errors.
    pub async fn expose(
        self: &Arc<Self>,
        local: &str,
        remote: &str,
        protocol: TransportProtocol,
    ) -> Result<(), ApiError> {
        if protocol == TransportProtocol::Udp {
            return Err(ApiError::UnsupportedProtocol);
        }
        let remote: SocketAddrV4 = remote.parse().map_err(|e: std::net::AddrParseError| {
            ApiError::InvalidRemote {
                remote: remote.to_string(),
                reason: e.to_string(),
            }
        })?;

        let key = (local.to_string(), protocol);
        {
            let entries = self.entries.lock().unwrap();
            if entries.contains_key(&key) {
                return Err(ApiError::AlreadyExposed {
                    local: local.to_string(),
                });
            }
        }

        let cancel = self.token.child_token();
        let listener = if let Some(path) = local.strip_prefix("unix://") {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ApiError::Io(e)),
            }
            LinkListener::Unix(UnixListener::bind(path)?)
        } else {
            let addr = normalize_local(local)?;
            LinkListener::Tcp(TcpListener::bind(addr).await?)
        };
        self.spawn_accept_loop(listener, remote, cancel.clone());

        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&key) {
            cancel.cancel();
            return Err(ApiError::AlreadyExposed {
                local: local.to_string(),
            });
        }
        entries.insert(key, Entry { remote, cancel });
        tracing::info!(local, remote = %remote, "forward exposed");
        Ok(())
    }

    /// Stop the listener bound to `local` and release its port.
    pub fn unexpose(&self, local: &str, protocol: TransportProtocol) -> Result<(), ApiError> {
        let key = (local.to_string(), protocol);
        let entry = self.entries.lock().unwrap().remove(&key);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(local, "forward unexposed");
                Ok(())
            }
            None => Err(ApiError::NotExposed {
                local: local.to_string(),
            }),
        }
    }

    pub fn list(&self) -> Vec<ForwardEntry> {
        let entries = self.entries.lock().unwrap();
        let mut all: Vec<ForwardEntry> = entries
            .iter()
            .map(|((local, protocol), entry)| ForwardEntry {
                local: local.clone(),
                remote: entry.remote.to_string(),
                protocol: *protocol,
            })
            .collect();
        all.sort_by(|a, b| a.local.cmp(&b.local));
        all
    }

    fn spawn_accept_loop(
        self: &Arc<Self>,
        listener: LinkListener,
        remote: SocketAddrV4,
        cancel: CancellationToken,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "inbound accept failed");
                            continue;
                        }
                    },
                };
                let this = this.clone();
                tokio::spawn(async move {
                    this.tunnel(conn, remote).await;
                });
            }
            // leaving the loop drops the listener and releases the bind
        });
    }

    async fn tunnel(&self, conn: BoxedStream, remote: SocketAddrV4) {
        let guest_side = match self.stack.dial(remote, self.dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "guest dial failed");
                return;
            }
        };
        self.counters.tcp_opened();
        match pump(conn, guest_side).await {
            Ok((sent, received)) => {
                tracing::debug!(remote = %remote, sent, received, "inbound flow closed");
            }
            Err(e) => tracing::debug!(remote = %remote, error = %e, "inbound flow ended"),
        }
        self.counters.tcp_closed();
    }
}

/// `:8080` means every interface; anything else must parse as host:port.
fn normalize_local(local: &str) -> Result<SocketAddr, ApiError> {
    let text = if local.starts_with(':') {
        format!("0.0.0.0{local}")
    } else {
        local.to_string()
    };
    text.parse().map_err(|e: std::net::AddrParseError| {
        ApiError::InvalidLocal {
            local: local.to_string(),
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_local() {
        assert_eq!(
            normalize_local(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            normalize_local("127.0.0.1:2222").unwrap(),
            "127.0.0.1:2222".parse::<SocketAddr>().unwrap()
        );
        assert!(normalize_local("not-an-address").is_err());
    }
}
