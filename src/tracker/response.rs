use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::bencode::Value;

use super::error::TrackerError;

/// The event field of an announce (BEP-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

/// A parsed announce reply: the re-announce interval and the peer list.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    /// Parses a bencoded announce reply. Accepts both the compact byte-string
    /// form and the dictionary-list form of the `peers` key.
    pub fn from_value(value: &Value) -> Result<Self, TrackerError> {
        let dict = value
            .as_dict()
            .ok_or(TrackerError::InvalidResponse("expected dict"))?;

        if let Some(reason) = dict
            .get(b"failure reason".as_slice())
            .and_then(Value::as_str)
        {
            return Err(TrackerError::Failure(reason.to_string()));
        }

        let interval = dict
            .get(b"interval".as_slice())
            .and_then(Value::as_integer)
            .filter(|&n| n > 0)
            .ok_or(TrackerError::InvalidResponse("missing interval"))? as u32;

        let mut peers = Vec::new();
        match dict.get(b"peers".as_slice()) {
            Some(Value::Bytes(compact)) => peers = parse_compact_peers(compact),
            Some(Value::List(list)) => {
                for peer in list {
                    let ip = peer
                        .get(b"ip")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse::<IpAddr>().ok());
                    let port = peer
                        .get(b"port")
                        .and_then(Value::as_integer)
                        .filter(|&p| (1..=u16::MAX as i64).contains(&p));
                    if let (Some(ip), Some(port)) = (ip, port) {
                        peers.push(SocketAddr::new(ip, port as u16));
                    }
                }
            }
            _ => {}
        }

        Ok(Self { interval, peers })
    }
}

/// Parses the compact peer format: 6 bytes per peer, 4-byte IPv4 address
/// then big-endian port.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}
