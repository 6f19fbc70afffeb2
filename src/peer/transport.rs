use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};

/// Frames larger than this are dropped as hostile.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Framed peer wire over a TCP stream.
///
/// `receive_message` is cancellation safe: partially read frames stay in the
/// internal buffer across calls, so the session can poll it from a select
/// loop.
pub struct PeerTransport {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl PeerTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub async fn send_handshake(
        &mut self,
        handshake: &Handshake,
        deadline: Duration,
    ) -> Result<(), PeerError> {
        timeout(deadline, self.stream.write_all(&handshake.encode()))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn receive_handshake(&mut self, deadline: Duration) -> Result<Handshake, PeerError> {
        timeout(deadline, self.fill_to(HANDSHAKE_LEN))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        timeout(WRITE_TIMEOUT, self.stream.write_all(&message.encode()))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        self.fill_to(4).await?;
        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(PeerError::Malformed("frame too large"));
        }

        self.fill_to(4 + length).await?;
        let frame = self.read_buf.split_to(4 + length);
        Message::decode(frame.freeze())
    }

    async fn fill_to(&mut self, len: usize) -> Result<(), PeerError> {
        while self.read_buf.len() < len {
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }
}
