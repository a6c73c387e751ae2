use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use russh::client::Msg;
use russh::ChannelStream;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::bastion::{Bastion, ConnectCallback};
use super::SshError;
use crate::pump::pump;

const INITIAL_DIAL_ATTEMPTS: u32 = 60;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const CHANNEL_ATTEMPTS: u32 = 3;
const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Forwards connections on a local Unix socket through an SSH channel to a
/// Unix socket inside the guest.
pub struct SshForward {
    listener: UnixListener,
    bastion: Bastion,
    socket_path: PathBuf,
}

impl SshForward {
    /// Listen on `socket_path` (owner-only, umask 0177) and establish the
    /// bastion, retrying the stack-side dial while sshd comes up.
    pub async fn new(
        token: &CancellationToken,
        socket_path: &Path,
        dest: &Url,
        identity: Option<&Path>,
        connect: ConnectCallback,
    ) -> Result<SshForward, SshError> {
        match std::fs::remove_file(socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SshError::Io(e)),
        }

        let listener = listen_unix(socket_path)?;
        tracing::info!(socket = %socket_path.display(), "socket forward listening");

        let initial = initial_connection(token, &connect).await?;
        let bastion = Bastion::create(dest, identity, None, initial, connect).await?;
        tracing::info!(dest = %dest, "ssh bastion connected");

        Ok(SshForward {
            listener,
            bastion,
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// Accept one local connection and tunnel it. Tunnel failures are
    /// logged and only cost the one accepted connection; the forwarder
    /// keeps serving.
    pub async fn accept_and_tunnel(&mut self, token: &CancellationToken) -> Result<(), SshError> {
        let (conn, _) = tokio::select! {
            _ = token.cancelled() => return Err(SshError::Cancelled),
            accepted = self.listener.accept() => accepted?,
        };

        let tunnel = match connect_tunnel(token, &mut self.bastion).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                tracing::error!(error = %e, "dropping forwarded connection");
                drop(conn);
                return Ok(());
            }
        };

        tokio::spawn(async move {
            match pump(conn, tunnel).await {
                Ok((sent, received)) => {
                    tracing::debug!(sent, received, "ssh tunnel closed");
                }
                Err(e) => tracing::debug!(error = %e, "ssh tunnel ended"),
            }
        });
        Ok(())
    }

    /// Close the bastion and remove the local socket. The listener dies
    /// with the struct, unblocking pending accepts.
    pub async fn close(self) {
        self.bastion.close().await;
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!(socket = %self.socket_path.display(), error = %e, "could not remove forward socket");
            }
        }
    }
}

fn listen_unix(path: &Path) -> io::Result<UnixListener> {
    // only the owner may connect
    let old_mask = unsafe { libc::umask(0o177) };
    let listener = UnixListener::bind(path);
    unsafe { libc::umask(old_mask) };
    listener
}

/// First dial toward sshd inside the guest: up to 60 attempts with
/// exponential backoff capped at one second.
async fn initial_connection(
    token: &CancellationToken,
    connect: &ConnectCallback,
) -> Result<crate::BoxedStream, SshError> {
    let mut backoff = INITIAL_BACKOFF;
    let mut last_error = io::Error::new(io::ErrorKind::TimedOut, "sshd never came up");

    for _ in 0..INITIAL_DIAL_ATTEMPTS {
        if token.is_cancelled() {
            return Err(SshError::Cancelled);
        }
        match connect().await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(backoff = ?backoff, error = %e, "waiting for sshd");
                last_error = e;
            }
        }
        if !sleep_cancellable(token, backoff).await {
            return Err(SshError::Cancelled);
        }
        backoff = next_backoff(backoff);
    }
    Err(SshError::Dial(last_error))
}

/// Open a channel to the remote path, probing and rebuilding the bastion
/// when the transport has died underneath it.
async fn connect_tunnel(
    token: &CancellationToken,
    bastion: &mut Bastion,
) -> Result<ChannelStream<Msg>, SshError> {
    let mut attempt = 1;
    loop {
        let channel_error = match bastion.open_tunnel().await {
            Ok(tunnel) => return Ok(tunnel),
            Err(e) => e,
        };
        if attempt >= CHANNEL_ATTEMPTS {
            return Err(SshError::Tunnel {
                path: bastion.path.clone(),
                source: channel_error,
            });
        }
        attempt += 1;

        if !bastion.is_alive().await {
            let mut reconnects = 1;
            loop {
                match bastion.reconnect().await {
                    Ok(()) => break,
                    Err(e) => {
                        if reconnects >= RECONNECT_ATTEMPTS {
                            return Err(e);
                        }
                        if !sleep_cancellable(token, RECONNECT_DELAY).await {
                            return Err(SshError::Cancelled);
                        }
                        reconnects += 1;
                    }
                }
            }
        }

        if !sleep_cancellable(token, RECONNECT_DELAY).await {
            return Err(SshError::Cancelled);
        }
    }
}

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_BACKOFF)
}

/// Returns false if the token fired before the interval elapsed.
async fn sleep_cancellable(token: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = INITIAL_BACKOFF;
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(200));
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(400));
        for _ in 0..10 {
            delay = next_backoff(delay);
        }
        assert_eq!(delay, MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_sleep_cancellable_aborts() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!sleep_cancellable(&token, Duration::from_secs(60)).await);

        let fresh = CancellationToken::new();
        assert!(sleep_cancellable(&fresh, Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connection_gives_up() {
        let token = CancellationToken::new();
        let connect: ConnectCallback = std::sync::Arc::new(|| {
            Box::pin(async {
                Err::<crate::BoxedStream, _>(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "no sshd",
                ))
            }) as super::super::bastion::DialFuture
        });
        let result = initial_connection(&token, &connect).await;
        assert!(matches!(result, Err(SshError::Dial(_))));
    }
}
