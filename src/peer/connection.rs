use super::{Handshake, PeerMessage, HANDSHAKE_LEN};
use crate::config::PeerId;
use crate::error::{Result, SwarmError};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Commands for a session's writer task
#[derive(Debug)]
pub enum Outbound {
    Message(PeerMessage),
    /// Flush what is queued ahead, then half-close the send side
    Shutdown,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// A connection to a peer before it is split into reader and writer
pub struct PeerConnection<S> {
    stream: S,
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub async fn send_handshake(&mut self, our_id: PeerId) -> Result<()> {
        self.stream
            .write_all(&Handshake::new(our_id).to_bytes())
            .await?;
        self.stream.flush().await?;
        debug!("Sent handshake as peer {}", our_id);
        Ok(())
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        self.stream.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                SwarmError::InvalidHandshake("connection closed mid-handshake".to_string())
            } else {
                SwarmError::Io(e)
            }
        })?;
        Handshake::from_bytes(&buf)
    }

    #[cfg(test)]
    pub async fn send_message(&mut self, message: &PeerMessage) -> Result<()> {
        write_message(&mut self.stream, message).await
    }

    #[cfg(test)]
    pub async fn receive_message(&mut self) -> Result<PeerMessage> {
        read_message(&mut self.stream).await
    }

    pub fn into_split(self) -> (ReadHalf<S>, WriteHalf<S>) {
        tokio::io::split(self.stream)
    }
}

/// Read one frame: length prefix, type byte, then exactly `length - 1` payload bytes.
///
/// A frame cut short by the remote closing is `ConnectionClosed`.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PeerMessage> {
    let mut length_buf = [0u8; 4];
    read_full(reader, &mut length_buf).await?;

    let length = u32::from_be_bytes(length_buf) as usize;
    if length == 0 {
        return Ok(PeerMessage::KeepAlive);
    }
    if length > MAX_FRAME_LEN {
        return Err(SwarmError::Protocol(format!(
            "Frame of {} bytes exceeds limit",
            length
        )));
    }

    let mut message_id = [0u8; 1];
    read_full(reader, &mut message_id).await?;

    let mut payload = vec![0u8; length - 1];
    read_full(reader, &mut payload).await?;

    PeerMessage::from_parts(message_id[0], &payload)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &PeerMessage,
) -> Result<()> {
    writer.write_all(&message.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(SwarmError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Drains the outbound queue onto the socket, in queue order.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: OutboundReceiver,
    remote: PeerId,
) {
    while let Some(command) = outbound.recv().await {
        match command {
            Outbound::Message(message) => {
                if let Err(e) = write_message(&mut writer, &message).await {
                    warn!("Failed to send {} to peer {}: {}", message.kind(), remote, e);
                    break;
                }
                debug!("Sent {} to peer {}", message.kind(), remote);
            }
            Outbound::Shutdown => {
                debug!("Half-closing connection to peer {}", remote);
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of connection to peer {} failed: {}", remote, e);
    }
}
