use super::{Swarm, SwarmState};
use crate::config::PeerId;
use crate::events::SwarmEvent;
use crate::peer::PeerMessage;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Pick up to `k` preferred neighbors from `(peer, rate)` candidates.
///
/// A seeder picks at random since download rate means nothing to it.
/// Otherwise the fastest win; shuffling before the stable sort randomises
/// the order among equal rates.
pub fn select_preferred<R: Rng + ?Sized>(
    mut candidates: Vec<(PeerId, f64)>,
    k: usize,
    seeding: bool,
    rng: &mut R,
) -> Vec<PeerId> {
    candidates.shuffle(rng);
    if !seeding {
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    }
    candidates.into_iter().take(k).map(|(peer, _)| peer).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreferredOutcome {
    /// Selected peers, sorted
    pub selected: Vec<PeerId>,
    /// Whether the set differs from the previous round
    pub changed: bool,
}

impl SwarmState {
    /// One preferred-neighbor round: unchoke the chosen, choke the rest, and
    /// open a new rate window for everyone.
    ///
    /// The current optimistically unchoked peer is left unchoked even when not selected.
    pub fn recompute_preferred<R: Rng + ?Sized>(
        &mut self,
        k: usize,
        interval: Duration,
        rng: &mut R,
    ) -> PreferredOutcome {
        let window = interval.as_secs_f64().max(f64::EPSILON);
        let candidates: Vec<(PeerId, f64)> = self
            .peers
            .iter()
            .filter(|(_, rel)| rel.state.remote_interested)
            .map(|(&peer, rel)| {
                let rate = (rel.downloaded - rel.last_downloaded) as f64 / window;
                (peer, rate)
            })
            .collect();

        let mut selected = select_preferred(candidates, k, self.local.is_complete(), rng);
        selected.sort_unstable();

        for (peer, rel) in self.peers.iter_mut() {
            if selected.contains(peer) {
                if rel.state.choking_remote {
                    rel.send(PeerMessage::Unchoke);
                    rel.state.choking_remote = false;
                }
            } else if !rel.state.choking_remote && self.optimistic != Some(*peer) {
                rel.send(PeerMessage::Choke);
                rel.state.choking_remote = true;
            }
            rel.last_downloaded = rel.downloaded;
        }

        let changed = selected != self.preferred;
        self.preferred = selected.clone();
        PreferredOutcome { selected, changed }
    }

    /// One optimistic-unchoke round. Returns the newly chosen peer, if any.
    pub fn rotate_optimistic<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<PeerId> {
        let mut candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, rel)| rel.state.remote_interested && rel.state.choking_remote)
            .map(|(&peer, _)| peer)
            .collect();
        candidates.sort_unstable();

        let choice = *candidates.choose(rng)?;
        if let Some(rel) = self.peers.get_mut(&choice) {
            rel.send(PeerMessage::Unchoke);
            rel.state.choking_remote = false;
        }

        if let Some(previous) = self.optimistic.filter(|&p| p != choice) {
            let still_preferred = self.preferred.contains(&previous);
            if let Some(rel) = self.peers.get_mut(&previous) {
                if !rel.state.choking_remote && !still_preferred {
                    rel.send(PeerMessage::Choke);
                    rel.state.choking_remote = true;
                }
            }
        }

        self.optimistic = Some(choice);
        Some(choice)
    }
}

impl Swarm {
    /// Start the preferred-neighbor and optimistic-unchoke tasks.
    ///
    /// Both exit at their next wake-up after the stop token is cancelled.
    pub fn spawn_schedulers(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        let preferred = tokio::spawn(self.clone().preferred_neighbor_loop());
        let optimistic = tokio::spawn(self.clone().optimistic_unchoke_loop());
        (preferred, optimistic)
    }

    async fn preferred_neighbor_loop(self) {
        let period = self.config().unchoking_interval();
        let k = self.config().preferred_neighbors;
        let stop = self.stop_token();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = self
                .lock()
                .await
                .recompute_preferred(k, period, &mut rand::thread_rng());

            if outcome.changed {
                self.record(SwarmEvent::PreferredNeighborsChanged {
                    neighbors: outcome.selected,
                });
            } else {
                debug!("Preferred neighbors unchanged: {:?}", outcome.selected);
            }
        }

        info!("Preferred-neighbor scheduler stopped");
    }

    async fn optimistic_unchoke_loop(self) {
        let period = self.config().optimistic_unchoking_interval();
        let stop = self.stop_token();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let change = {
                let mut state = self.lock().await;
                let previous = state.optimistic;
                let chosen = state.rotate_optimistic(&mut rand::thread_rng());
                chosen.filter(|&chosen| Some(chosen) != previous)
            };

            if let Some(neighbor) = change {
                self.record(SwarmEvent::OptimisticUnchokeChanged { neighbor });
            }
        }

        info!("Optimistic-unchoke scheduler stopped");
    }
}
