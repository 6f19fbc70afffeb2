use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;
/// The block size used for requests (16 KiB). The last block of a piece may
/// be shorter; requests longer than this are refused.
pub const BLOCK_SIZE: u32 = 1 << 14;

/// One-byte message ids following the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    /// DHT port announcement (BEP-5).
    Port = 9,
    /// Extension protocol wrapper (BEP-10).
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            other => Err(PeerError::InvalidMessageId(other)),
        }
    }
}

/// The 68-byte handshake exchanged before any messages.
///
/// Reserved bits advertise capabilities: byte 5 bit 4 is the extension
/// protocol (BEP-10), byte 7 bit 0 is DHT (BEP-5).
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// A handshake advertising extension-protocol and DHT support.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        reserved[7] |= 0x01;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & 0x01 != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN || data[0] as usize != PROTOCOL.len() {
            return Err(PeerError::InvalidHandshake);
        }
        if &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }
        let mut reserved = [0u8; 8];
        let mut info_hash = [0u8; 20];
        let mut peer_id = [0u8; 20];
        reserved.copy_from_slice(&data[20..28]);
        info_hash.copy_from_slice(&data[28..48]);
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A peer wire message: 4-byte big-endian length prefix, 1-byte id (absent
/// for keep-alive), payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_header(&mut buf, 1, MessageId::Choke),
            Message::Unchoke => put_header(&mut buf, 1, MessageId::Unchoke),
            Message::Interested => put_header(&mut buf, 1, MessageId::Interested),
            Message::NotInterested => put_header(&mut buf, 1, MessageId::NotInterested),
            Message::Have { piece } => {
                put_header(&mut buf, 5, MessageId::Have);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                put_header(&mut buf, 1 + bits.len() as u32, MessageId::Bitfield);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                put_header(&mut buf, 13, MessageId::Request);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                put_header(&mut buf, 9 + data.len() as u32, MessageId::Piece);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                put_header(&mut buf, 13, MessageId::Cancel);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                put_header(&mut buf, 3, MessageId::Port);
                buf.put_u16(*port);
            }
            Message::Extended { id, payload } => {
                put_header(&mut buf, 2 + payload.len() as u32, MessageId::Extended);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    /// Decodes one message from a complete frame (length prefix included).
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::Malformed("truncated length prefix"));
        }
        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() < length {
            return Err(PeerError::Malformed("truncated frame"));
        }

        let id = MessageId::try_from(data.get_u8())?;
        let need = |n: usize| {
            if length - 1 < n {
                Err(PeerError::Malformed("payload too short"))
            } else {
                Ok(())
            }
        };

        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                need(4)?;
                Ok(Message::Have {
                    piece: data.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(length - 1))),
            MessageId::Request => {
                need(12)?;
                Ok(Message::Request {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Piece => {
                need(8)?;
                let index = data.get_u32();
                let begin = data.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: data.copy_to_bytes(length - 9),
                })
            }
            MessageId::Cancel => {
                need(12)?;
                Ok(Message::Cancel {
                    index: data.get_u32(),
                    begin: data.get_u32(),
                    length: data.get_u32(),
                })
            }
            MessageId::Port => {
                need(2)?;
                Ok(Message::Port(data.get_u16()))
            }
            MessageId::Extended => {
                need(1)?;
                let id = data.get_u8();
                Ok(Message::Extended {
                    id,
                    payload: data.copy_to_bytes(length - 2),
                })
            }
        }
    }
}

fn put_header(buf: &mut BytesMut, length: u32, id: MessageId) {
    buf.put_u32(length);
    buf.put_u8(id as u8);
}
