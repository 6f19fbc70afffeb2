//! Fetching the info dictionary from peers (BEP-9).
//!
//! A torrent started from a bare info hash learns the metadata size from
//! peers' extension handshakes, takes the modal value, and pulls the 16 KiB
//! pieces from whoever supports `ut_metadata`. The assembled bytes are only
//! accepted when their SHA-1 matches the info hash.

use std::collections::HashMap;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::metainfo::InfoHash;
use crate::peer::{SessionId, METADATA_PIECE_SIZE};

/// Advertised sizes above this are rejected outright.
const MAX_METADATA_SIZE: i64 = 10 * 1024 * 1024;

#[derive(Debug)]
pub enum MetadataProgress {
    Incomplete,
    /// All pieces present and the SHA-1 gate passed.
    Complete(Bytes),
    /// All pieces were present but hashed wrong; ownership was reset.
    Corrupt,
}

#[derive(Debug)]
struct Fetch {
    buf: Vec<u8>,
    owned: Vec<bool>,
    /// Outstanding requests, piece to the session asked.
    assigned: HashMap<u32, SessionId>,
}

#[derive(Debug)]
pub struct InfoSync {
    info_hash: InfoHash,
    /// Frequency of metadata sizes peers have advertised.
    size_freq: HashMap<i64, u32>,
    fetch: Option<Fetch>,
}

impl InfoSync {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            size_freq: HashMap::new(),
            fetch: None,
        }
    }

    pub fn record_size(&mut self, size: i64) {
        *self.size_freq.entry(size).or_default() += 1;
    }

    pub fn allocated(&self) -> bool {
        self.fetch.is_some()
    }

    /// Allocates the buffer from the modal advertised size. Returns whether
    /// a fetch is in place afterwards.
    pub fn try_allocate(&mut self) -> bool {
        if self.fetch.is_some() {
            return true;
        }
        let Some((&size, _)) = self
            .size_freq
            .iter()
            .max_by_key(|entry| (*entry.1, *entry.0))
        else {
            return false;
        };
        if size <= 0 || size > MAX_METADATA_SIZE {
            return false;
        }
        let pieces = crate::peer::metadata_piece_count(size as usize);
        self.fetch = Some(Fetch {
            buf: vec![0u8; size as usize],
            owned: vec![false; pieces],
            assigned: HashMap::new(),
        });
        true
    }

    /// Picks up to `limit` unowned, unassigned pieces and assigns them to
    /// `session`.
    pub fn assign_requests(&mut self, session: SessionId, limit: usize) -> Vec<u32> {
        let Some(fetch) = &mut self.fetch else {
            return Vec::new();
        };
        let mut picked = Vec::new();
        for (piece, owned) in fetch.owned.iter().enumerate() {
            if picked.len() >= limit {
                break;
            }
            let piece = piece as u32;
            if !owned && !fetch.assigned.contains_key(&piece) {
                fetch.assigned.insert(piece, session);
                picked.push(piece);
            }
        }
        picked
    }

    pub fn on_reject(&mut self, piece: u32, session: SessionId) {
        if let Some(fetch) = &mut self.fetch {
            if fetch.assigned.get(&piece) == Some(&session) {
                fetch.assigned.remove(&piece);
            }
        }
    }

    pub fn unassign_session(&mut self, session: SessionId) {
        if let Some(fetch) = &mut self.fetch {
            fetch.assigned.retain(|_, s| *s != session);
        }
    }

    pub fn on_data(
        &mut self,
        session: SessionId,
        piece: u32,
        total_size: i64,
        data: &[u8],
    ) -> MetadataProgress {
        self.record_size(total_size);
        if !self.try_allocate() {
            return MetadataProgress::Incomplete;
        }
        let fetch = self.fetch.as_mut().expect("allocated above");

        let start = piece as usize * METADATA_PIECE_SIZE;
        if start >= fetch.buf.len() {
            return MetadataProgress::Incomplete;
        }
        let expected = (fetch.buf.len() - start).min(METADATA_PIECE_SIZE);
        if data.len() != expected {
            debug!(piece, got = data.len(), expected, "ignoring missized metadata piece");
            fetch.assigned.remove(&piece);
            return MetadataProgress::Incomplete;
        }

        fetch.buf[start..start + expected].copy_from_slice(data);
        fetch.owned[piece as usize] = true;
        if fetch.assigned.get(&piece) == Some(&session) {
            fetch.assigned.remove(&piece);
        }

        if !fetch.owned.iter().all(|&o| o) {
            return MetadataProgress::Incomplete;
        }

        let digest: [u8; 20] = Sha1::digest(&fetch.buf).into();
        if digest == *self.info_hash.as_bytes() {
            MetadataProgress::Complete(Bytes::copy_from_slice(&fetch.buf))
        } else {
            debug!("assembled metadata failed its hash check, refetching");
            fetch.owned.iter_mut().for_each(|o| *o = false);
            fetch.assigned.clear();
            MetadataProgress::Corrupt
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_info() -> (Bytes, InfoHash) {
        let (mi, _) = crate::metainfo::Builder::new("x", 16384)
            .file("x", vec![1u8; 100])
            .build();
        (mi.raw_info().clone(), mi.info_hash)
    }

    #[test]
    fn modal_size_wins() {
        let mut sync = InfoSync::new(InfoHash([0u8; 20]));
        sync.record_size(100);
        sync.record_size(200);
        sync.record_size(200);
        assert!(sync.try_allocate());
        assert_eq!(sync.fetch.as_ref().unwrap().buf.len(), 200);
    }

    #[test]
    fn oversized_metadata_rejected() {
        let mut sync = InfoSync::new(InfoHash([0u8; 20]));
        sync.record_size(MAX_METADATA_SIZE + 1);
        assert!(!sync.try_allocate());
        sync.record_size(0);
        assert!(!sync.try_allocate());
    }

    #[test]
    fn single_piece_fetch_completes() {
        let (raw, hash) = raw_info();
        let mut sync = InfoSync::new(hash);
        match sync.on_data(1, 0, raw.len() as i64, &raw) {
            MetadataProgress::Complete(bytes) => assert_eq!(bytes, raw),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn corrupt_metadata_resets_ownership() {
        let (raw, hash) = raw_info();
        let mut sync = InfoSync::new(hash);
        let mut garbage = raw.to_vec();
        garbage[0] ^= 0xff;
        assert!(matches!(
            sync.on_data(1, 0, garbage.len() as i64, &garbage),
            MetadataProgress::Corrupt
        ));
        // a clean refetch still succeeds
        assert!(matches!(
            sync.on_data(2, 0, raw.len() as i64, &raw),
            MetadataProgress::Complete(_)
        ));
    }

    #[test]
    fn assignment_round_trip() {
        let mut sync = InfoSync::new(InfoHash([0u8; 20]));
        sync.record_size(METADATA_PIECE_SIZE as i64 * 2 + 5);
        assert!(sync.try_allocate());

        let first = sync.assign_requests(1, 8);
        assert_eq!(first, vec![0, 1, 2]);
        // already assigned: nothing left for another session
        assert!(sync.assign_requests(2, 8).is_empty());

        sync.on_reject(1, 1);
        assert_eq!(sync.assign_requests(2, 8), vec![1]);

        sync.unassign_session(1);
        assert_eq!(sync.assign_requests(3, 1), vec![0]);
    }

    #[test]
    fn missized_piece_ignored() {
        let (raw, hash) = raw_info();
        let mut sync = InfoSync::new(hash);
        sync.record_size(raw.len() as i64);
        assert!(sync.try_allocate());
        assert!(matches!(
            sync.on_data(1, 0, raw.len() as i64, &raw[..raw.len() - 1]),
            MetadataProgress::Incomplete
        ));
        assert!(matches!(
            sync.on_data(1, 9, raw.len() as i64, &raw),
            MetadataProgress::Incomplete
        ));
    }
}
