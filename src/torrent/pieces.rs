//! The piece registry: block-level progress, rarity bookkeeping, and the
//! piece-selection policy.
//!
//! Every block of every piece is in exactly one of three sets: unrequested,
//! pending (assigned to at least one session), or complete (written to
//! storage). Only the coordinator mutates this state, so transitions are
//! strictly ordered.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::peer::{Bitfield, BlockRequest, SessionId, BLOCK_SIZE};

/// Endgame begins when fewer than this many blocks remain unrequested
/// across the whole torrent.
pub const ENDGAME_THRESHOLD: usize = 20;

/// A candidate piece as shown to the selector.
#[derive(Debug, Clone, Copy)]
pub struct PieceView {
    pub index: u32,
    /// How many connected peers own the piece.
    pub rarity: u32,
    /// Some of the piece's blocks are pending or complete.
    pub started: bool,
}

/// Orders candidate pieces for block assignment. Injected via
/// `Config::selector_factory`.
pub trait PieceSelector: Send {
    /// Picks the next piece to draw blocks from, or `None` to stop.
    fn next_piece(&mut self, candidates: &[PieceView]) -> Option<u32>;
}

/// The default policy: pieces we already started come first so they finish
/// and verify early, then ascending rarity, ties broken by index.
pub struct RarestFirst;

impl PieceSelector for RarestFirst {
    fn next_piece(&mut self, candidates: &[PieceView]) -> Option<u32> {
        candidates
            .iter()
            .min_by_key(|v| (!v.started, v.rarity, v.index))
            .map(|v| v.index)
    }
}

pub type SelectorFactory = fn() -> Box<dyn PieceSelector>;

/// Outcome of marking a block complete.
#[derive(Debug)]
pub enum BlockCompletion {
    /// The block was already complete; an endgame double-delivery.
    Duplicate,
    Completed {
        /// Every block of the piece is now complete.
        piece_done: bool,
        /// Other sessions still holding the block in flight; they get a
        /// cancel broadcast.
        cancel: Vec<SessionId>,
    },
}

#[derive(Debug)]
struct Piece {
    index: u32,
    length: u32,
    verified: bool,
    rarity: u32,
    /// Block offsets nobody has been asked for.
    unrequested: BTreeSet<u32>,
    /// Block offset to the sessions it is in flight on. More than one
    /// holder only happens in endgame.
    pending: HashMap<u32, Vec<SessionId>>,
    /// Block offset to the session that delivered it.
    complete: HashMap<u32, SessionId>,
}

impl Piece {
    fn new(index: u32, length: u32, block_size: u32) -> Self {
        Self {
            index,
            length,
            verified: false,
            rarity: 0,
            unrequested: (0..length).step_by(block_size as usize).collect(),
            pending: HashMap::new(),
            complete: HashMap::new(),
        }
    }

    fn num_blocks(&self, block_size: u32) -> usize {
        self.length.div_ceil(block_size) as usize
    }

    fn block_len(&self, begin: u32, block_size: u32) -> u32 {
        (self.length - begin).min(block_size)
    }

    fn started(&self) -> bool {
        !self.verified && (!self.pending.is_empty() || !self.complete.is_empty())
    }
}

pub struct PieceTable {
    pieces: Vec<Piece>,
    owned: Bitfield,
    block_size: u32,
    unrequested_total: usize,
    selector: Box<dyn PieceSelector>,
}

impl PieceTable {
    pub fn new(total_length: u64, piece_length: u64, selector: Box<dyn PieceSelector>) -> Self {
        let block_size = (piece_length.min(BLOCK_SIZE as u64)) as u32;
        let num_pieces = total_length.div_ceil(piece_length) as u32;
        let pieces: Vec<Piece> = (0..num_pieces)
            .map(|i| {
                let start = i as u64 * piece_length;
                let len = (total_length - start).min(piece_length) as u32;
                Piece::new(i, len, block_size)
            })
            .collect();
        let unrequested_total = pieces.iter().map(|p| p.unrequested.len()).sum();
        Self {
            pieces,
            owned: Bitfield::new(num_pieces as usize),
            block_size,
            unrequested_total,
            selector,
        }
    }

    pub fn owned(&self) -> &Bitfield {
        &self.owned
    }

    pub fn num_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn verified_count(&self) -> u32 {
        self.owned.count() as u32
    }

    pub fn have_all(&self) -> bool {
        self.owned.is_complete()
    }

    pub fn is_verified(&self, piece: u32) -> bool {
        self.pieces
            .get(piece as usize)
            .is_some_and(|p| p.verified)
    }

    pub fn piece_len(&self, piece: u32) -> u32 {
        self.pieces[piece as usize].length
    }

    pub fn rarity(&self, piece: u32) -> u32 {
        self.pieces[piece as usize].rarity
    }

    /// Fewer unrequested blocks left than the endgame threshold.
    pub fn endgame(&self) -> bool {
        self.unrequested_total < ENDGAME_THRESHOLD && !self.have_all()
    }

    pub fn on_have(&mut self, piece: u32) {
        if let Some(p) = self.pieces.get_mut(piece as usize) {
            p.rarity += 1;
        }
    }

    pub fn on_bitfield(&mut self, peer: &Bitfield) {
        for p in &mut self.pieces {
            if peer.has_piece(p.index as usize) {
                p.rarity += 1;
            }
        }
    }

    /// Rarity bookkeeping when a peer leaves the swarm.
    pub fn on_session_gone(&mut self, peer: &Bitfield, session: SessionId) {
        for p in &mut self.pieces {
            if peer.has_piece(p.index as usize) {
                p.rarity = p.rarity.saturating_sub(1);
            }
        }
        self.unassign_session(session);
    }

    /// Returns a choked or dropped session's pending blocks to the pool.
    /// Blocks other sessions also hold (endgame) stay pending on them.
    pub fn unassign_session(&mut self, session: SessionId) {
        for piece in &mut self.pieces {
            let mut freed = Vec::new();
            piece.pending.retain(|&begin, holders| {
                holders.retain(|&s| s != session);
                if holders.is_empty() {
                    freed.push(begin);
                    false
                } else {
                    true
                }
            });
            for begin in freed {
                piece.unrequested.insert(begin);
                self.unrequested_total += 1;
            }
        }
    }

    /// Hands out up to `want` blocks for `session`, moving them from
    /// unrequested to pending. In endgame, blocks pending on other sessions
    /// are handed out a second time.
    pub fn pick_requests(
        &mut self,
        session: SessionId,
        peer: &Bitfield,
        want: usize,
    ) -> Vec<BlockRequest> {
        let mut out = Vec::new();
        let mut exhausted: HashSet<u32> = HashSet::new();

        while out.len() < want {
            let endgame = self.endgame();
            let candidates: Vec<PieceView> = self
                .pieces
                .iter()
                .filter(|p| {
                    !p.verified
                        && !exhausted.contains(&p.index)
                        && peer.has_piece(p.index as usize)
                        && (!p.unrequested.is_empty()
                            || (endgame
                                && p.pending.values().any(|h| !h.contains(&session))))
                })
                .map(|p| PieceView {
                    index: p.index,
                    rarity: p.rarity,
                    started: p.started(),
                })
                .collect();

            let Some(index) = self.selector.next_piece(&candidates) else {
                break;
            };
            if !candidates.iter().any(|v| v.index == index) {
                break;
            }
            let block_size = self.block_size;
            let piece = &mut self.pieces[index as usize];

            while out.len() < want {
                let Some(&begin) = piece.unrequested.iter().next() else {
                    break;
                };
                piece.unrequested.remove(&begin);
                piece.pending.entry(begin).or_default().push(session);
                self.unrequested_total -= 1;
                out.push(BlockRequest::new(
                    index,
                    begin,
                    piece.block_len(begin, block_size),
                ));
            }

            if endgame {
                let mut dup: Vec<u32> = piece
                    .pending
                    .iter()
                    .filter(|(_, holders)| !holders.contains(&session))
                    .map(|(&begin, _)| begin)
                    .collect();
                dup.sort_unstable();
                for begin in dup {
                    if out.len() >= want {
                        break;
                    }
                    piece
                        .pending
                        .get_mut(&begin)
                        .expect("offset taken from pending")
                        .push(session);
                    out.push(BlockRequest::new(
                        index,
                        begin,
                        piece.block_len(begin, block_size),
                    ));
                }
            }
            exhausted.insert(index);
        }
        out
    }

    /// Moves a block from pending to complete and records the contributor.
    pub fn set_block_complete(
        &mut self,
        index: u32,
        begin: u32,
        session: SessionId,
    ) -> BlockCompletion {
        let block_size = self.block_size;
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            return BlockCompletion::Duplicate;
        };
        if piece.complete.contains_key(&begin) {
            return BlockCompletion::Duplicate;
        }

        let mut cancel = match piece.pending.remove(&begin) {
            Some(holders) => holders,
            None => {
                // a block the registry does not believe is in flight;
                // completing it twice would be a coordinator bug, but a
                // late delivery after a choke round-trip lands here too
                debug_assert!(piece.unrequested.contains(&begin), "block completed twice");
                if !piece.unrequested.remove(&begin) {
                    return BlockCompletion::Duplicate;
                }
                self.unrequested_total -= 1;
                Vec::new()
            }
        };
        cancel.retain(|&s| s != session);
        piece.complete.insert(begin, session);

        BlockCompletion::Completed {
            piece_done: piece.complete.len() == piece.num_blocks(block_size),
            cancel,
        }
    }

    /// A verified piece enters the owned bitmap and leaves selection.
    pub fn on_piece_verified(&mut self, index: u32) {
        let piece = &mut self.pieces[index as usize];
        debug_assert_eq!(
            piece.complete.len(),
            piece.num_blocks(self.block_size),
            "verified piece must be fully complete"
        );
        piece.verified = true;
        self.owned.set_piece(index as usize);
    }

    /// A corrupt piece returns every block to unrequested. Returns the
    /// bytes each contributing session fed into it, for the
    /// malliciousness ledger.
    pub fn on_piece_corrupt(&mut self, index: u32) -> Vec<(SessionId, u64)> {
        let block_size = self.block_size;
        let piece = &mut self.pieces[index as usize];

        let mut blame: HashMap<SessionId, u64> = HashMap::new();
        for (&begin, &session) in &piece.complete {
            *blame.entry(session).or_default() += piece.block_len(begin, block_size) as u64;
        }
        piece.complete.clear();
        piece.pending.clear();
        piece.unrequested = (0..piece.length).step_by(block_size as usize).collect();
        self.unrequested_total += piece.unrequested.len();

        blame.into_iter().collect()
    }

    /// Seed-on-start: storage already holds a verified copy of everything.
    pub fn mark_all_verified(&mut self) {
        self.unrequested_total = 0;
        for piece in &mut self.pieces {
            piece.unrequested.clear();
            piece.pending.clear();
            piece.verified = true;
            self.owned.set_piece(piece.index as usize);
        }
    }

    /// Bytes not yet covered by verified pieces.
    pub fn bytes_left(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|p| !p.verified)
            .map(|p| p.length as u64)
            .sum()
    }

    #[cfg(test)]
    fn assert_partition(&self) {
        for p in &self.pieces {
            let mut seen = BTreeSet::new();
            for &b in &p.unrequested {
                assert!(seen.insert(b));
            }
            for &b in p.pending.keys() {
                assert!(seen.insert(b), "block both unrequested/complete and pending");
            }
            for &b in p.complete.keys() {
                assert!(seen.insert(b), "block both pending and complete");
            }
            assert_eq!(seen.len(), p.num_blocks(self.block_size));
        }
    }
}
