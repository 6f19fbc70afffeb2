//! Metadata exchange messages (ut_metadata, BEP-9).

use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode_prefix, encode, Value};

/// Metadata is transferred in 16 KiB pieces.
pub const METADATA_PIECE_SIZE: usize = 1 << 14;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

/// A ut_metadata message. The wire form is a bencoded header dict; data
/// messages carry the raw piece bytes immediately after the dict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request {
        piece: u32,
    },
    Data {
        piece: u32,
        total_size: i64,
        data: Bytes,
    },
    Reject {
        piece: u32,
    },
}

impl MetadataMessage {
    pub fn encode(&self) -> Bytes {
        let mut dict = BTreeMap::new();
        let (msg_type, piece) = match self {
            MetadataMessage::Request { piece } => (MSG_REQUEST, *piece),
            MetadataMessage::Data { piece, .. } => (MSG_DATA, *piece),
            MetadataMessage::Reject { piece } => (MSG_REJECT, *piece),
        };
        dict.insert(Bytes::from_static(b"msg_type"), Value::Integer(msg_type));
        dict.insert(Bytes::from_static(b"piece"), Value::Integer(piece as i64));
        if let MetadataMessage::Data { total_size, .. } = self {
            dict.insert(Bytes::from_static(b"total_size"), Value::Integer(*total_size));
        }

        let mut out = encode(&Value::Dict(dict));
        if let MetadataMessage::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, used) = decode_prefix(payload)?;
        let dict = header
            .as_dict()
            .ok_or(PeerError::Malformed("metadata header is not a dict"))?;

        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(Value::as_integer)
            .ok_or(PeerError::Malformed("metadata msg_type missing"))?;
        let piece = dict
            .get(b"piece".as_slice())
            .and_then(Value::as_integer)
            .filter(|&p| p >= 0)
            .ok_or(PeerError::Malformed("metadata piece missing"))? as u32;

        match msg_type {
            MSG_REQUEST => Ok(MetadataMessage::Request { piece }),
            MSG_REJECT => Ok(MetadataMessage::Reject { piece }),
            MSG_DATA => {
                let total_size = dict
                    .get(b"total_size".as_slice())
                    .and_then(Value::as_integer)
                    .ok_or(PeerError::Malformed("metadata total_size missing"))?;
                let data = Bytes::copy_from_slice(&payload[used..]);
                if data.len() > METADATA_PIECE_SIZE {
                    return Err(PeerError::Malformed("metadata piece too large"));
                }
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data,
                })
            }
            _ => Err(PeerError::Malformed("unknown metadata msg_type")),
        }
    }
}

/// Number of 16 KiB pieces covering `total_size` bytes of metadata.
pub fn metadata_piece_count(total_size: usize) -> usize {
    total_size.div_ceil(METADATA_PIECE_SIZE)
}
