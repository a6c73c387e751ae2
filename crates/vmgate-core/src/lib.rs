pub mod api;
pub mod config;
pub mod dns;
pub mod nat;
pub mod pump;
pub mod ssh;
pub mod stats;

use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream usable as one side of a tunnel or pump.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Owned, type-erased tunnel stream.
pub type BoxedStream = Box<dyn TunnelStream + 'static>;
