use std::collections::HashMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use vmgate_core::config::{format_uuid, LinkDialect, MacAddress};

/// Ethernet header on top of the MTU.
pub const ETHERNET_HEADER_LEN: usize = 14;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("unknown vpnkit client UUID {0}")]
    UnknownUuid(String),
    #[error("dialect {0:?} is datagram-framed, not stream-framed")]
    NotStreamFramed(LinkDialect),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Length-prefix codec for one link connection. The dialect fixes the
/// prefix layout; the MTU bounds every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    dialect: LinkDialect,
    max_frame: usize,
}

impl FrameCodec {
    pub fn new(dialect: LinkDialect, mtu: usize) -> Self {
        Self {
            dialect,
            max_frame: mtu + ETHERNET_HEADER_LEN,
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Read exactly one frame into `buf`, returning its length. Partial
    /// reads are drained; a short peer write never yields a torn frame.
    pub async fn read_frame<R>(&self, reader: &mut R, buf: &mut Vec<u8>) -> Result<usize, LinkError>
    where
        R: AsyncRead + Unpin,
    {
        let len = match self.dialect {
            LinkDialect::HyperKit | LinkDialect::Bess => {
                usize::from(reader.read_u16_le().await?)
            }
            LinkDialect::Qemu | LinkDialect::Stdio => {
                let len = reader.read_u32().await?;
                usize::try_from(len).unwrap_or(usize::MAX)
            }
            LinkDialect::VfkitUdp => return Err(LinkError::NotStreamFramed(self.dialect)),
        };
        if len > self.max_frame {
            return Err(LinkError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        buf.resize(len, 0);
        reader.read_exact(buf).await?;
        Ok(len)
    }

    /// Write one length-prefixed frame, fully drained.
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &[u8]) -> Result<(), LinkError>
    where
        W: AsyncWrite + Unpin,
    {
        if frame.len() > self.max_frame {
            return Err(LinkError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame,
            });
        }
        match self.dialect {
            LinkDialect::HyperKit | LinkDialect::Bess => {
                writer.write_u16_le(frame.len() as u16).await?;
            }
            LinkDialect::Qemu | LinkDialect::Stdio => {
                writer.write_u32(frame.len() as u32).await?;
            }
            LinkDialect::VfkitUdp => return Err(LinkError::NotStreamFramed(self.dialect)),
        }
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Result of the VPNKit attach negotiation.
#[derive(Debug, Clone, Copy)]
pub struct VpnkitHandshake {
    pub uuid: [u8; 16],
    pub mac: MacAddress,
    pub mtu: u16,
}

/// Run the server side of the VPNKit handshake: read the 16-byte client
/// UUID and requested MTU, answer with the granted MTU, the frame size
/// bound, and the MAC assigned to that UUID.
pub async fn vpnkit_negotiate<S>(
    stream: &mut S,
    uuid_macs: &HashMap<String, MacAddress>,
    mtu: usize,
) -> Result<VpnkitHandshake, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut uuid = [0u8; 16];
    stream.read_exact(&mut uuid).await?;
    let requested_mtu = stream.read_u16_le().await?;

    let uuid_text = format_uuid(&uuid);
    let mac = uuid_macs
        .get(&uuid_text)
        .copied()
        .ok_or(LinkError::UnknownUuid(uuid_text))?;

    let granted = (mtu as u16).min(if requested_mtu == 0 {
        u16::MAX
    } else {
        requested_mtu
    });
    stream.write_u16_le(granted).await?;
    stream
        .write_u16_le(granted + ETHERNET_HEADER_LEN as u16)
        .await?;
    stream.write_all(&mac.0).await?;
    stream.flush().await?;

    Ok(VpnkitHandshake {
        uuid,
        mac,
        mtu: granted,
    })
}
