//! Shared swarm state and the coordinator that owns it.
//!
//! One coarse lock guards the local bitfield, the outstanding requests and
//! the relationship table. Sessions and both scheduler tasks take it only for
//! a decide-and-send step; sends are queued on each session's writer channel
//! and never block under the lock.

mod choking;
mod session;

pub use session::Direction;

use crate::config::{CommonConfig, PeerId};
use crate::error::{Result, SwarmError};
use crate::events::{EventSink, SwarmEvent};
use crate::peer::{Outbound, OutboundSender, PeerMessage, PeerState};
use crate::piece::{Bitfield, PiecePicker};
use crate::storage::PieceStore;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything this peer knows about one connected remote
pub struct PeerRelationship {
    outbound: OutboundSender,
    /// Mirror of the remote's bitfield, all false until it tells us otherwise
    pub bitfield: Bitfield,
    pub state: PeerState,
    /// Cumulative bytes received from this peer
    pub downloaded: u64,
    /// `downloaded` at the start of the current rate window
    pub last_downloaded: u64,
    closing: bool,
}

impl PeerRelationship {
    pub fn new(outbound: OutboundSender, num_pieces: usize) -> Self {
        Self {
            outbound,
            bitfield: Bitfield::new(num_pieces, false),
            state: PeerState::default(),
            downloaded: 0,
            last_downloaded: 0,
            closing: false,
        }
    }

    /// Queue a message; a dead writer means the session is already ending.
    pub fn send(&self, message: PeerMessage) {
        if self.outbound.send(Outbound::Message(message)).is_err() {
            debug!("Dropping message for a closed connection");
        }
    }

    /// Start a graceful close: half-close our side and let the reader drain.
    pub fn shutdown(&mut self) {
        if !self.closing {
            self.closing = true;
            let _ = self.outbound.send(Outbound::Shutdown);
        }
    }

    /// Update our interest in the remote, sending only on change.
    fn set_interest(&mut self, interested: bool) {
        if interested != self.state.interested_in_remote {
            self.send(if interested {
                PeerMessage::Interested
            } else {
                PeerMessage::NotInterested
            });
            self.state.interested_in_remote = interested;
        }
    }
}

/// State shared by every session and scheduler task
pub struct SwarmState {
    pub local: Bitfield,
    pub picker: PiecePicker,
    pub peers: HashMap<PeerId, PeerRelationship>,
    /// Currently optimistically unchoked peer
    pub optimistic: Option<PeerId>,
    /// Last preferred neighbor set, sorted
    pub preferred: Vec<PeerId>,
    /// Peers ever seen holding the complete file
    completed: HashSet<PeerId>,
}

impl SwarmState {
    pub fn new(num_pieces: usize, has_file: bool) -> Self {
        Self {
            local: Bitfield::new(num_pieces, has_file),
            picker: PiecePicker::new(),
            peers: HashMap::new(),
            optimistic: None,
            preferred: Vec::new(),
            completed: HashSet::new(),
        }
    }

    /// Ask `remote` for a random missing piece if it is not choking us and
    /// nothing is already in flight to it.
    pub fn request_from(&mut self, remote: PeerId) -> Option<u32> {
        let relationship = self.peers.get(&remote)?;
        if relationship.state.choked_by_remote || self.picker.has_outstanding(remote) {
            return None;
        }

        let index = self.picker.pick(
            &self.local,
            &relationship.bitfield,
            remote,
            &mut rand::thread_rng(),
        )?;
        relationship.send(PeerMessage::Request { piece_index: index });
        Some(index)
    }

    /// Record the remote as complete and close the link if we are too.
    fn settle_if_both_complete(&mut self, remote: PeerId) {
        let local_complete = self.local.is_complete();
        let Some(relationship) = self.peers.get_mut(&remote) else {
            return;
        };
        if relationship.bitfield.is_complete() {
            self.completed.insert(remote);
            if local_complete {
                info!("Peer {} and we both hold the complete file, closing", remote);
                relationship.shutdown();
            }
        }
    }
}

struct Inner {
    local_id: PeerId,
    config: CommonConfig,
    /// Every other peer in the roster
    expected_peers: Vec<PeerId>,
    state: Mutex<SwarmState>,
    store: Arc<dyn PieceStore>,
    events: Arc<dyn EventSink>,
    stop: CancellationToken,
    /// Set when the swarm stops without the local file in place
    failure: OnceLock<String>,
}

/// Handle to the swarm coordinator, cheap to clone into tasks
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<Inner>,
}

impl Swarm {
    pub fn new(
        local_id: PeerId,
        config: CommonConfig,
        expected_peers: Vec<PeerId>,
        has_file: bool,
        store: Arc<dyn PieceStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let has_file = has_file || store.has_complete_file();
        let state = SwarmState::new(config.num_pieces(), has_file);
        info!(
            "Peer {} starting with {}/{} pieces",
            local_id,
            state.local.count(),
            state.local.len()
        );

        Self {
            inner: Arc::new(Inner {
                local_id,
                config,
                expected_peers,
                state: Mutex::new(state),
                store,
                events,
                stop: CancellationToken::new(),
                failure: OnceLock::new(),
            }),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    pub fn config(&self) -> &CommonConfig {
        &self.inner.config
    }

    pub fn num_pieces(&self) -> usize {
        self.inner.config.num_pieces()
    }

    pub async fn lock(&self) -> MutexGuard<'_, SwarmState> {
        self.inner.state.lock().await
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    /// Resolves once every peer holds the complete file and all links are closed,
    /// or with an error once the downloaded file could not be finalized.
    pub async fn finished(&self) -> Result<()> {
        self.inner.stop.cancelled().await;
        match self.inner.failure.get() {
            Some(reason) => Err(SwarmError::FinalizeFailed(reason.clone())),
            None => Ok(()),
        }
    }

    /// Stop the whole swarm because this peer cannot complete.
    fn abort(&self, reason: String) {
        if self.inner.failure.set(reason).is_err() {
            debug!("Swarm already aborted");
        }
        self.inner.stop.cancel();
    }

    fn store(&self) -> &dyn PieceStore {
        self.inner.store.as_ref()
    }

    fn record(&self, event: SwarmEvent) {
        self.inner.events.record(event);
    }

    /// Add a relationship for a freshly handshaken peer and queue our bitfield
    /// as its first message, atomically with respect to have-broadcasts.
    async fn register(&self, remote: PeerId, outbound: OutboundSender) -> Result<()> {
        if remote == self.local_id() {
            return Err(SwarmError::Protocol(format!(
                "Peer {} connected to itself",
                remote
            )));
        }

        let mut state = self.lock().await;
        if state.peers.contains_key(&remote) {
            return Err(SwarmError::Protocol(format!(
                "Peer {} is already connected",
                remote
            )));
        }

        let relationship = PeerRelationship::new(outbound, self.num_pieces());
        relationship.send(PeerMessage::Bitfield {
            bitfield: state.local.to_bytes(),
        });
        state.peers.insert(remote, relationship);
        debug!("Registered peer {} ({} connected)", remote, state.peers.len());
        Ok(())
    }

    /// Retire a relationship and release whatever was requested from it.
    async fn unregister(&self, remote: PeerId) {
        let mut state = self.lock().await;
        state.peers.remove(&remote);
        let released = state.picker.release_peer(remote);
        if state.optimistic == Some(remote) {
            state.optimistic = None;
        }
        state.preferred.retain(|&id| id != remote);

        info!(
            "Peer {} disconnected, released {} outstanding requests",
            remote, released
        );
        self.check_finished(&state);
    }

    /// Raise the global stop once the whole swarm is done.
    fn check_finished(&self, state: &SwarmState) {
        let everyone_complete = self
            .inner
            .expected_peers
            .iter()
            .all(|peer| state.completed.contains(peer));

        if state.local.is_complete() && everyone_complete && state.peers.is_empty() {
            if !self.inner.stop.is_cancelled() {
                info!("Every peer holds the complete file, stopping");
            }
            self.inner.stop.cancel();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// In-memory store that mirrors the file store's contract
    pub struct MemoryStore {
        piece_size: u32,
        file_size: u64,
        pieces: StdMutex<HashMap<u32, Vec<u8>>>,
        finalized: StdMutex<bool>,
        broken_finalize: StdMutex<bool>,
    }

    impl MemoryStore {
        pub fn new(piece_size: u32, file_size: u64) -> Self {
            Self {
                piece_size,
                file_size,
                pieces: StdMutex::new(HashMap::new()),
                finalized: StdMutex::new(false),
                broken_finalize: StdMutex::new(false),
            }
        }

        /// Make every later `finalize` fail.
        pub fn break_finalize(&self) {
            *self.broken_finalize.lock().unwrap() = true;
        }

        pub fn insert(&self, index: u32, data: Vec<u8>) {
            self.pieces.lock().unwrap().insert(index, data);
        }
    }

    #[async_trait]
    impl PieceStore for MemoryStore {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        fn piece_length(&self, index: u32) -> u32 {
            crate::piece::piece_length(index, self.piece_size, self.file_size)
        }

        async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()> {
            if *self.finalized.lock().unwrap() {
                return Err(SwarmError::AlreadyFinalized);
            }
            let expected = self.piece_length(index);
            if data.len() != expected as usize {
                return Err(SwarmError::LengthMismatch {
                    index,
                    expected,
                    actual: data.len(),
                });
            }
            self.insert(index, data.to_vec());
            Ok(())
        }

        async fn read_piece(&self, index: u32) -> Result<Vec<u8>> {
            self.pieces
                .lock()
                .unwrap()
                .get(&index)
                .cloned()
                .ok_or(SwarmError::OutOfRange(index))
        }

        async fn finalize(&self) -> Result<()> {
            if *self.broken_finalize.lock().unwrap() {
                return Err(SwarmError::FinalizeFailed("rename refused".to_string()));
            }
            *self.finalized.lock().unwrap() = true;
            Ok(())
        }

        fn has_complete_file(&self) -> bool {
            *self.finalized.lock().unwrap()
        }
    }

    pub fn common_config(num_pieces: u32, piece_size: u32) -> CommonConfig {
        CommonConfig {
            preferred_neighbors: 2,
            unchoking_interval_secs: 1,
            optimistic_unchoking_interval_secs: 1,
            file_name: "shared.dat".to_string(),
            file_size: num_pieces as u64 * piece_size as u64,
            piece_size,
        }
    }
}
