//! The choking policy.
//!
//! Every 10 seconds the coordinator asks the choker to re-rank interested
//! peers; the best few by observed throughput keep their unchoke slots, and
//! every third review an optimistic slot goes to a random interested peer so
//! fast strangers can prove themselves. Recently connected peers get extra
//! weight in the optimistic draw.

use std::time::Duration;

use rand::Rng as _;

use crate::peer::SessionId;

/// Interval between regular unchoke reviews.
pub const CHOKER_INTERVAL: Duration = Duration::from_secs(10);

/// Regular unchoke slots; the optimistic slot comes on top.
const REGULAR_SLOTS: usize = 3;

/// Reviews per optimistic rotation (3 x 10 s = 30 s).
const OPTIMISTIC_EVERY: u32 = 3;

/// Peers connected less than this count as fresh and get a weighted
/// optimistic draw.
const FRESH_WINDOW: Duration = Duration::from_secs(60);
const FRESH_WEIGHT: usize = 3;

/// A snapshot of one session as the choker sees it.
#[derive(Debug, Clone, Copy)]
pub struct ChokerPeer {
    pub id: SessionId,
    /// The peer wants our data; only interested peers hold slots.
    pub interested: bool,
    /// Throughput over the last window: download rate while leeching,
    /// upload rate while seeding.
    pub rate: u64,
    /// We are currently not choking this peer.
    pub unchoked: bool,
    pub connected_for: Duration,
}

pub struct Choker {
    reviews: u32,
    optimistic: Option<SessionId>,
}

impl Choker {
    pub fn new() -> Self {
        Self {
            reviews: 0,
            optimistic: None,
        }
    }

    /// Recomputes the unchoked set and returns only the transitions:
    /// `(session, true)` to unchoke, `(session, false)` to choke.
    ///
    /// `rotate` advances the review counter; off-tick reviews (admission,
    /// drops, interest changes) pass `false` so they cannot spin the
    /// optimistic slot faster than its 30-second cadence.
    pub fn review(&mut self, peers: &[ChokerPeer], rotate: bool) -> Vec<(SessionId, bool)> {
        if rotate {
            self.reviews = self.reviews.wrapping_add(1);
        }

        let mut ranked: Vec<&ChokerPeer> = peers.iter().filter(|p| p.interested).collect();
        ranked.sort_by(|a, b| b.rate.cmp(&a.rate).then(a.id.cmp(&b.id)));
        let regular: Vec<SessionId> = ranked.iter().take(REGULAR_SLOTS).map(|p| p.id).collect();

        // drop the optimistic pick if it left or earned a regular slot
        if let Some(opt) = self.optimistic {
            let gone = !peers.iter().any(|p| p.id == opt && p.interested);
            if gone || regular.contains(&opt) {
                self.optimistic = None;
            }
        }

        let rotation_due = rotate && self.reviews % OPTIMISTIC_EVERY == 1;
        if self.optimistic.is_none() || rotation_due {
            self.optimistic = pick_optimistic(peers, &regular);
        }

        let mut decisions = Vec::new();
        for peer in peers {
            let should_unchoke =
                regular.contains(&peer.id) || self.optimistic == Some(peer.id);
            if should_unchoke != peer.unchoked {
                decisions.push((peer.id, should_unchoke));
            }
        }
        decisions
    }

    pub fn optimistic(&self) -> Option<SessionId> {
        self.optimistic
    }
}

fn pick_optimistic(peers: &[ChokerPeer], regular: &[SessionId]) -> Option<SessionId> {
    let mut draw = Vec::new();
    for peer in peers {
        if !peer.interested || regular.contains(&peer.id) {
            continue;
        }
        let weight = if peer.connected_for < FRESH_WINDOW {
            FRESH_WEIGHT
        } else {
            1
        };
        draw.extend(std::iter::repeat_n(peer.id, weight));
    }
    if draw.is_empty() {
        return None;
    }
    Some(draw[rand::rng().random_range(0..draw.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: SessionId, interested: bool, rate: u64, unchoked: bool) -> ChokerPeer {
        ChokerPeer {
            id,
            interested,
            rate,
            unchoked,
            connected_for: Duration::from_secs(300),
        }
    }

    #[test]
    fn unchokes_fastest_interested() {
        let mut choker = Choker::new();
        let peers = vec![
            peer(1, true, 100, false),
            peer(2, true, 500, false),
            peer(3, true, 300, false),
            peer(4, true, 50, false),
            peer(5, false, 900, false), // not interested, never unchoked
        ];
        let decisions = choker.review(&peers, true);
        let unchoked: Vec<SessionId> = decisions
            .iter()
            .filter(|(_, u)| *u)
            .map(|(id, _)| *id)
            .collect();
        // three regular slots (2, 3, 1) plus the optimistic pick (4)
        assert!(unchoked.contains(&2));
        assert!(unchoked.contains(&3));
        assert!(unchoked.contains(&1));
        assert!(!unchoked.contains(&5));
        assert_eq!(choker.optimistic(), Some(4));
    }

    #[test]
    fn only_transitions_are_emitted() {
        let mut choker = Choker::new();
        let peers = vec![peer(1, true, 10, false), peer(2, true, 5, false)];
        let first = choker.review(&peers, true);
        assert_eq!(first.len(), 2);

        // same ranking, already unchoked: nothing to say
        let peers = vec![peer(1, true, 10, true), peer(2, true, 5, true)];
        assert!(choker.review(&peers, true).is_empty());
    }

    #[test]
    fn chokes_peer_that_lost_interest() {
        let mut choker = Choker::new();
        let peers = vec![peer(1, true, 10, false)];
        choker.review(&peers, true);

        let peers = vec![peer(1, false, 10, true)];
        let decisions = choker.review(&peers, true);
        assert_eq!(decisions, vec![(1, false)]);
        assert_eq!(choker.optimistic(), None);
    }

    #[test]
    fn optimistic_survives_off_tick_reviews() {
        let mut choker = Choker::new();
        let mut peers: Vec<ChokerPeer> = (1..=5).map(|id| peer(id, true, id * 100, false)).collect();
        choker.review(&peers, true);
        let opt = choker.optimistic().expect("one peer outside regular slots");
        for p in &mut peers {
            p.unchoked = true;
        }
        // a burst of admission/drop reviews must not rotate the slot
        for _ in 0..10 {
            choker.review(&peers, false);
            assert_eq!(choker.optimistic(), Some(opt));
        }
    }

    #[test]
    fn optimistic_cleared_when_peer_leaves() {
        let mut choker = Choker::new();
        let peers = vec![peer(9, true, 1, false)];
        choker.review(&peers, true);
        assert_eq!(choker.optimistic(), Some(9));

        let decisions = choker.review(&[], true);
        assert!(decisions.is_empty());
        assert_eq!(choker.optimistic(), None);
    }
}
