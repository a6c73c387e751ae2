use std::io;
use std::sync::Mutex;

use thiserror::Error;
use tokio::net::{TcpListener, UnixDatagram, UnixListener};
use url::Url;

use vmgate_core::BoxedStream;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid listener URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported listener scheme {0}")]
    UnsupportedScheme(String),
    #[error("{0} already exists")]
    PathExists(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A bound VM-link listener. `accept` yields type-erased byte streams so
/// the framing layer never inspects the underlying transport.
pub enum LinkListener {
    Tcp(TcpListener),
    Unix(UnixListener),
    #[cfg(target_os = "linux")]
    Vsock(tokio::sync::Mutex<tokio_vsock::VsockListener>),
    /// A pre-opened connection handed down as a file descriptor; yields it
    /// exactly once.
    Fd(Mutex<Option<std::os::unix::net::UnixStream>>),
}

impl LinkListener {
    /// Bind one of `unix://PATH`, `tcp://HOST:PORT`, `vsock://CID:PORT` or
    /// `fd://N`.
    pub async fn bind(raw: &str) -> Result<LinkListener, TransportError> {
        let url = parse_url(raw)?;
        match url.scheme() {
            "unix" => {
                let path = url_path(&url);
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(TransportError::Io(e)),
                }
                Ok(LinkListener::Unix(UnixListener::bind(path)?))
            }
            "tcp" => {
                let addr = host_port(&url, raw)?;
                Ok(LinkListener::Tcp(TcpListener::bind(addr).await?))
            }
            #[cfg(target_os = "linux")]
            "vsock" => {
                let cid: u32 = url
                    .host_str()
                    .and_then(|h| h.parse().ok())
                    .ok_or_else(|| TransportError::InvalidUrl {
                        url: raw.to_string(),
                        reason: "vsock CID must be numeric".to_string(),
                    })?;
                let port = url.port().ok_or_else(|| TransportError::InvalidUrl {
                    url: raw.to_string(),
                    reason: "missing vsock port".to_string(),
                })?;
                let addr = tokio_vsock::VsockAddr::new(cid, u32::from(port));
                Ok(LinkListener::Vsock(tokio::sync::Mutex::new(tokio_vsock::VsockListener::bind(addr)?)))
            }
            "fd" => {
                let fd: i32 = url
                    .host_str()
                    .and_then(|h| h.parse().ok())
                    .ok_or_else(|| TransportError::InvalidUrl {
                        url: raw.to_string(),
                        reason: "fd number must be numeric".to_string(),
                    })?;
                // Safety: ownership of the descriptor is transferred to us by
                // whoever launched the process with it open.
                let stream = unsafe {
                    use std::os::fd::FromRawFd;
                    std::os::unix::net::UnixStream::from_raw_fd(fd)
                };
                stream.set_nonblocking(true)?;
                Ok(LinkListener::Fd(Mutex::new(Some(stream))))
            }
            other => Err(TransportError::UnsupportedScheme(other.to_string())),
        }
    }

    pub async fn accept(&self) -> io::Result<BoxedStream> {
        match self {
            LinkListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            LinkListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            #[cfg(target_os = "linux")]
            LinkListener::Vsock(listener) => {
                let (stream, _) = listener.lock().await.accept().await?;
                Ok(Box::new(stream))
            }
            LinkListener::Fd(slot) => {
                let stream = slot.lock().unwrap().take();
                match stream {
                    Some(stream) => Ok(Box::new(tokio::net::UnixStream::from_std(stream)?)),
                    // the descriptor was a single connection; block forever
                    // and let cancellation tear the accept loop down
                    None => std::future::pending().await,
                }
            }
        }
    }
}

/// Bind the datagram flavor (`unixgram://PATH`), one datagram per frame.
pub async fn bind_datagram(raw: &str) -> Result<UnixDatagram, TransportError> {
    let url = parse_url(raw)?;
    if url.scheme() != "unixgram" {
        return Err(TransportError::UnsupportedScheme(url.scheme().to_string()));
    }
    let path = url_path(&url);
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(TransportError::Io(e)),
    }
    Ok(UnixDatagram::bind(path)?)
}

/// Refuse to bind a unix listener over an existing path without removing
/// it, for dialects that want the caller to clean up explicitly.
pub fn unix_path_available(raw: &str) -> Result<(), TransportError> {
    let url = parse_url(raw)?;
    if url.scheme() == "unix" {
        let path = url_path(&url);
        if std::path::Path::new(&path).exists() {
            return Err(TransportError::PathExists(path));
        }
    }
    Ok(())
}

fn parse_url(raw: &str) -> Result<Url, TransportError> {
    Url::parse(raw).map_err(|e| TransportError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

// unix URLs are written both as unix:///tmp/x.sock and unix:/tmp/x.sock
fn url_path(url: &Url) -> String {
    url.path().to_string()
}

fn host_port(url: &Url, raw: &str) -> Result<String, TransportError> {
    let host = url.host_str().ok_or_else(|| TransportError::InvalidUrl {
        url: raw.to_string(),
        reason: "missing host".to_string(),
    })?;
    let port = url.port().ok_or_else(|| TransportError::InvalidUrl {
        url: raw.to_string(),
        reason: "missing port".to_string(),
    })?;
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_unix_listener_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.sock");
        let url = format!("unix://{}", path.display());

        let listener = LinkListener::bind(&url).await.unwrap();
        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        client.write_all(b"frame").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame");
    }

    #[tokio::test]
    async fn test_unix_listener_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();
        let url = format!("unix://{}", path.display());
        assert!(LinkListener::bind(&url).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_listener() {
        let listener = LinkListener::bind("tcp://127.0.0.1:0").await;
        // port 0 resolves; scheme is accepted
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_unknown_scheme() {
        assert!(matches!(
            LinkListener::bind("gopher://x:1").await,
            Err(TransportError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_unix_path_available() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu.sock");
        let url = format!("unix://{}", path.display());
        assert!(unix_path_available(&url).is_ok());
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            unix_path_available(&url),
            Err(TransportError::PathExists(_))
        ));
    }
}
