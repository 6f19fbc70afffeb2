//! Extension protocol handshake (BEP-10).

use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode, encode, Value};

/// Extended-message id of the extension handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The id under which we accept `ut_metadata` messages. Advertised in our
/// handshake's `m` dict; the peer addresses metadata messages to us with it.
pub const UT_METADATA_LOCAL_ID: u8 = 1;

/// The dictionary exchanged in extended message 0.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    /// Extension name to extended-message id, the `m` key.
    pub extensions: BTreeMap<String, u8>,
    /// Total metadata size in bytes, if the sender has the info dictionary.
    pub metadata_size: Option<i64>,
}

impl ExtensionHandshake {
    /// Our handshake: `ut_metadata` support plus the metadata size once
    /// known.
    pub fn ours(metadata_size: Option<i64>) -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert("ut_metadata".to_string(), UT_METADATA_LOCAL_ID);
        Self {
            extensions,
            metadata_size,
        }
    }

    /// The id the peer wants `ut_metadata` messages addressed to.
    pub fn ut_metadata(&self) -> Option<u8> {
        self.extensions.get("ut_metadata").copied()
    }

    pub fn encode(&self) -> Bytes {
        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(
                Bytes::copy_from_slice(name.as_bytes()),
                Value::Integer(*id as i64),
            );
        }
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Integer(size));
        }
        Bytes::from(encode(&Value::Dict(dict)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or(PeerError::Malformed("extension handshake is not a dict"))?;

        let mut extensions = BTreeMap::new();
        if let Some(m) = dict.get(b"m".as_slice()).and_then(Value::as_dict) {
            for (key, val) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer()) {
                    // id 0 means the peer disabled the extension
                    if (1..=255).contains(&id) {
                        extensions.insert(name.to_string(), id as u8);
                    }
                }
            }
        }

        let metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(Value::as_integer);

        Ok(Self {
            extensions,
            metadata_size,
        })
    }
}
