use std::fmt;

use rand::Rng as _;

const PEER_ID_PREFIX: &[u8] = b"-TI0001-";

/// A 20-byte peer identifier, Azureus style.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        rand::rng().fill(&mut id[8..]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            if let Ok(client) = std::str::from_utf8(&self.0[1..7]) {
                return write!(f, "PeerId({})", client);
            }
        }
        write!(f, "PeerId({:02x?})", &self.0[..8])
    }
}
