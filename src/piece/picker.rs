use super::Bitfield;
use crate::config::PeerId;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// Selects which pieces to request next and tracks what is in flight.
///
/// At most one request per piece is outstanding at a time.
#[derive(Debug, Default)]
pub struct PiecePicker {
    outstanding: HashMap<u32, PeerId>,
}

impl PiecePicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pieces the remote has, we lack, and nobody has been asked for yet.
    pub fn candidates(&self, local: &Bitfield, remote: &Bitfield) -> Vec<u32> {
        local
            .missing_from(remote)
            .map(|index| index as u32)
            .filter(|index| !self.outstanding.contains_key(index))
            .collect()
    }

    /// Pick a candidate uniformly at random and record it against `peer`.
    ///
    /// Random choice keeps peers from converging on the same pieces.
    pub fn pick<R: Rng + ?Sized>(
        &mut self,
        local: &Bitfield,
        remote: &Bitfield,
        peer: PeerId,
        rng: &mut R,
    ) -> Option<u32> {
        let index = *self.candidates(local, remote).choose(rng)?;
        self.outstanding.insert(index, peer);
        debug!("Requesting piece {} from peer {}", index, peer);
        Some(index)
    }

    /// The piece arrived or its request failed.
    pub fn release(&mut self, index: u32) -> Option<PeerId> {
        self.outstanding.remove(&index)
    }

    /// Drop every request sent to `peer`, returning how many were released.
    pub fn release_peer(&mut self, peer: PeerId) -> usize {
        let before = self.outstanding.len();
        self.outstanding.retain(|_, owner| *owner != peer);
        before - self.outstanding.len()
    }

    pub fn has_outstanding(&self, peer: PeerId) -> bool {
        self.outstanding.values().any(|&owner| owner == peer)
    }

    pub fn requested_from(&self, index: u32) -> Option<PeerId> {
        self.outstanding.get(&index).copied()
    }

    #[cfg(test)]
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}
