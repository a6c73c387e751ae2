pub mod bastion;
pub mod forward;
pub mod known_hosts;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use bastion::{Bastion, ConnectCallback, HostKeyPolicy};
pub use forward::SshForward;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("ssh destination is missing a user")]
    MissingUser,
    #[error("ssh destination is missing a host")]
    MissingHost,
    #[error("ssh destination is missing a remote socket path")]
    MissingPath,
    #[error("no available auth methods")]
    NoAuthMethods,
    #[error("failed to load identity {path}: {source}")]
    Identity {
        path: PathBuf,
        source: russh::keys::Error,
    },
    #[error("authentication failed for {user}")]
    AuthenticationFailed { user: String },
    #[error("host key for {0} not found in known_hosts")]
    UnknownHostKey(String),
    #[error("connection to sshd failed: {0}")]
    Dial(#[source] io::Error),
    #[error("could not reestablish ssh tunnel on {path}: {source}")]
    Tunnel {
        path: String,
        source: russh::Error,
    },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
