use super::Swarm;
use crate::config::PeerId;
use crate::error::{Result, SwarmError};
use crate::events::SwarmEvent;
use crate::peer::{read_message, run_writer, PeerConnection, PeerMessage};
use crate::piece::Bitfield;
use crate::storage::PieceStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialled `expected` and send our handshake first
    Outbound { expected: PeerId },
    /// The remote dialled us; we answer its handshake
    Inbound,
}

impl Swarm {
    /// Run one peer connection from handshake to close.
    ///
    /// Errors end only this connection; the relationship is always retired.
    pub async fn run_session<S>(&self, stream: S, direction: Direction) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut connection = PeerConnection::new(stream);

        let remote = match direction {
            Direction::Outbound { expected } => {
                connection.send_handshake(self.local_id()).await?;
                let handshake = connection.receive_handshake().await?;
                if handshake.peer_id != expected {
                    return Err(SwarmError::InvalidHandshake(format!(
                        "dialled peer {} but peer {} answered",
                        expected, handshake.peer_id
                    )));
                }
                self.record(SwarmEvent::ConnectionMade {
                    remote: handshake.peer_id,
                });
                handshake.peer_id
            }
            Direction::Inbound => {
                let handshake = connection.receive_handshake().await?;
                connection.send_handshake(self.local_id()).await?;
                self.record(SwarmEvent::ConnectionReceived {
                    remote: handshake.peer_id,
                });
                handshake.peer_id
            }
        };

        let (mut reader, writer) = connection.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.register(remote, outbound).await?;
        let writer_task = tokio::spawn(run_writer(writer, outbound_rx, remote));

        let result = self.receive_loop(&mut reader, remote).await;

        self.unregister(remote).await;
        if let Err(e) = writer_task.await {
            warn!("Writer task for peer {} failed: {}", remote, e);
        }

        match result {
            Err(SwarmError::ConnectionClosed) => {
                info!("Connection to peer {} closed", remote);
                Ok(())
            }
            other => other,
        }
    }

    async fn receive_loop<R>(&self, reader: &mut R, remote: PeerId) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let message = match read_message(reader).await {
                Ok(message) => message,
                Err(e) if !e.is_connection_fatal() => {
                    warn!("Ignoring message from peer {}: {}", remote, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            debug!("Received {} from peer {}", message.kind(), remote);
            self.handle_message(remote, message).await?;
        }
    }

    pub(crate) async fn handle_message(&self, remote: PeerId, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::KeepAlive => Ok(()),
            PeerMessage::Choke => {
                self.on_choke(remote).await;
                Ok(())
            }
            PeerMessage::Unchoke => {
                self.on_unchoke(remote).await;
                Ok(())
            }
            PeerMessage::Interested => {
                self.on_interest(remote, true).await;
                Ok(())
            }
            PeerMessage::NotInterested => {
                self.on_interest(remote, false).await;
                Ok(())
            }
            PeerMessage::Have { piece_index } => self.on_have(remote, piece_index).await,
            PeerMessage::Bitfield { bitfield } => {
                self.on_bitfield(remote, &bitfield).await;
                Ok(())
            }
            PeerMessage::Request { piece_index } => {
                self.on_request(remote, piece_index).await;
                Ok(())
            }
            PeerMessage::Piece { piece_index, data } => {
                self.on_piece(remote, piece_index, data).await
            }
        }
    }

    async fn on_choke(&self, remote: PeerId) {
        let mut guard = self.lock().await;
        let state = &mut *guard;
        let Some(relationship) = state.peers.get_mut(&remote) else {
            return;
        };
        relationship.state.choked_by_remote = true;

        // A choking peer discards our pending requests
        let released = state.picker.release_peer(remote);
        if released > 0 {
            debug!("Released {} requests to peer {} after choke", released, remote);
        }
        self.record(SwarmEvent::ChokedBy { remote });
    }

    async fn on_unchoke(&self, remote: PeerId) {
        let mut state = self.lock().await;
        let Some(relationship) = state.peers.get_mut(&remote) else {
            return;
        };
        relationship.state.choked_by_remote = false;
        self.record(SwarmEvent::UnchokedBy { remote });

        state.request_from(remote);
    }

    async fn on_interest(&self, remote: PeerId, interested: bool) {
        let mut state = self.lock().await;
        let Some(relationship) = state.peers.get_mut(&remote) else {
            return;
        };
        relationship.state.remote_interested = interested;

        self.record(if interested {
            SwarmEvent::InterestedReceived { remote }
        } else {
            SwarmEvent::NotInterestedReceived { remote }
        });
    }

    async fn on_have(&self, remote: PeerId, index: u32) -> Result<()> {
        self.check_index(index)?;

        let mut guard = self.lock().await;
        let state = &mut *guard;
        let Some(relationship) = state.peers.get_mut(&remote) else {
            return Ok(());
        };
        relationship.bitfield.set(index as usize);
        self.record(SwarmEvent::HaveReceived {
            remote,
            piece_index: index,
        });

        if state.local.is_complete() && relationship.bitfield.is_complete() {
            state.settle_if_both_complete(remote);
            return Ok(());
        }

        let wants = state
            .local
            .has_any_piece_missing_locally(&relationship.bitfield);
        relationship.set_interest(wants);

        state.settle_if_both_complete(remote);
        state.request_from(remote);
        Ok(())
    }

    async fn on_bitfield(&self, remote: PeerId, bytes: &[u8]) {
        let bitfield = Bitfield::from_bytes(bytes, self.num_pieces());

        let mut guard = self.lock().await;
        let state = &mut *guard;
        let wants = state.local.has_any_piece_missing_locally(&bitfield);
        let Some(relationship) = state.peers.get_mut(&remote) else {
            return;
        };

        if wants && !relationship.state.interested_in_remote {
            relationship.send(PeerMessage::Interested);
        }
        // Tracks the computed interest even when nothing was sent
        relationship.state.interested_in_remote = wants;
        relationship.bitfield = bitfield;

        state.settle_if_both_complete(remote);
        state.request_from(remote);
    }

    async fn on_request(&self, remote: PeerId, index: u32) {
        let owned = {
            let state = self.lock().await;
            let Some(relationship) = state.peers.get(&remote) else {
                return;
            };
            if relationship.state.choking_remote {
                debug!("Ignoring request for {} from choked peer {}", index, remote);
                return;
            }
            (index as usize) < state.local.len() && state.local.get(index as usize)
        };

        let data = if owned {
            self.store().read_piece(index).await.unwrap_or_else(|e| {
                warn!("Could not read piece {} for peer {}: {}", index, remote, e);
                Vec::new()
            })
        } else {
            warn!("Peer {} requested piece {} which we lack", remote, index);
            Vec::new()
        };

        let state = self.lock().await;
        if let Some(relationship) = state.peers.get(&remote) {
            relationship.send(PeerMessage::Piece {
                piece_index: index,
                data,
            });
        }
    }

    async fn on_piece(&self, remote: PeerId, index: u32, data: Vec<u8>) -> Result<()> {
        self.check_index(index)?;

        {
            let mut state = self.lock().await;
            if state.local.get(index as usize) {
                debug!("Already have piece {}, ignoring copy from {}", index, remote);
                if state.picker.requested_from(index) == Some(remote) {
                    state.picker.release(index);
                }
                return Ok(());
            }
        }

        // The write completes before the bit is set or anyone is told
        if let Err(e) = self.store().write_piece(index, &data).await {
            warn!("Failed to store piece {} from peer {}: {}", index, remote, e);
            let mut state = self.lock().await;
            state.picker.release(index);
            state.request_from(remote);
            return Ok(());
        }

        let completed_now = {
            let mut guard = self.lock().await;
            let state = &mut *guard;
            if state.local.get(index as usize) {
                return Ok(());
            }
            state.local.set(index as usize);
            state.picker.release(index);

            if let Some(relationship) = state.peers.get_mut(&remote) {
                relationship.downloaded += data.len() as u64;
            }
            self.record(SwarmEvent::PieceDownloaded {
                remote,
                piece_index: index,
                pieces_owned: state.local.count(),
            });

            let local = state.local.clone();
            for relationship in state.peers.values_mut() {
                relationship.send(PeerMessage::Have { piece_index: index });
                if relationship.state.interested_in_remote
                    && !local.has_any_piece_missing_locally(&relationship.bitfield)
                {
                    relationship.set_interest(false);
                }
            }

            if local.is_complete() {
                true
            } else {
                state.request_from(remote);
                false
            }
        };

        if completed_now {
            self.complete_download().await;
        }
        Ok(())
    }

    /// Promote the file and close links to peers that are also done.
    ///
    /// A file that cannot be finalized stops the swarm with an error.
    async fn complete_download(&self) {
        if let Err(e) = self.store().finalize().await {
            error!("Could not finalize the downloaded file: {}", e);
            self.abort(match e {
                SwarmError::FinalizeFailed(reason) => reason,
                other => other.to_string(),
            });
            return;
        }
        self.record(SwarmEvent::DownloadComplete);
        info!("Download complete");

        let mut state = self.lock().await;
        let remotes: Vec<PeerId> = state.peers.keys().copied().collect();
        for remote in remotes {
            state.settle_if_both_complete(remote);
        }
        self.check_finished(&state);
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if (index as usize) < self.num_pieces() {
            Ok(())
        } else {
            Err(SwarmError::Protocol(format!(
                "Piece index {} out of range",
                index
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use crate::peer::{Outbound, OutboundReceiver};
    use crate::storage::FileStore;
    use crate::swarm::testing::{common_config, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn swarm_with(store: Arc<MemoryStore>, has_file: bool) -> (Swarm, Arc<RecordingSink>) {
        let events = Arc::new(RecordingSink::default());
        let swarm = Swarm::new(1, common_config(4, 8), vec![2], has_file, store, events.clone());
        (swarm, events)
    }

    async fn connect(swarm: &Swarm, remote: PeerId) -> OutboundReceiver {
        let (tx, mut rx) = mpsc::unbounded_channel();
        swarm.register(remote, tx).await.unwrap();
        // Drop the initial bitfield
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Message(PeerMessage::Bitfield { .. }))
        ));
        rx
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<PeerMessage> {
        let mut messages = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let Outbound::Message(message) = command {
                messages.push(message);
            }
        }
        messages
    }

    fn full_bitfield() -> Vec<u8> {
        Bitfield::new(4, true).to_bytes()
    }

    #[tokio::test]
    async fn test_bitfield_then_unchoke_requests_a_piece() {
        let (swarm, events) = swarm_with(Arc::new(MemoryStore::new(8, 32)), false);
        let mut rx = connect(&swarm, 2).await;

        swarm
            .handle_message(2, PeerMessage::Bitfield { bitfield: full_bitfield() })
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), vec![PeerMessage::Interested]);

        swarm.handle_message(2, PeerMessage::Unchoke).await.unwrap();
        let sent = drain(&mut rx);
        assert!(matches!(sent[..], [PeerMessage::Request { piece_index }] if piece_index < 4));
        assert_eq!(swarm.lock().await.picker.outstanding_count(), 1);

        // A second unchoke does not stack a second request
        swarm.handle_message(2, PeerMessage::Unchoke).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(events.events().contains(&SwarmEvent::UnchokedBy { remote: 2 }));
    }

    #[tokio::test]
    async fn test_choke_releases_outstanding_requests() {
        let (swarm, events) = swarm_with(Arc::new(MemoryStore::new(8, 32)), false);
        let mut rx = connect(&swarm, 2).await;
        swarm
            .handle_message(2, PeerMessage::Bitfield { bitfield: full_bitfield() })
            .await
            .unwrap();
        swarm.handle_message(2, PeerMessage::Unchoke).await.unwrap();
        drain(&mut rx);

        swarm.handle_message(2, PeerMessage::Choke).await.unwrap();

        let state = swarm.lock().await;
        assert!(state.peers[&2].state.choked_by_remote);
        assert_eq!(state.picker.outstanding_count(), 0);
        assert!(events.events().contains(&SwarmEvent::ChokedBy { remote: 2 }));
    }

    #[tokio::test]
    async fn test_have_sends_interest_once() {
        let (swarm, events) = swarm_with(Arc::new(MemoryStore::new(8, 32)), false);
        let mut rx = connect(&swarm, 2).await;

        swarm
            .handle_message(2, PeerMessage::Have { piece_index: 1 })
            .await
            .unwrap();
        swarm
            .handle_message(2, PeerMessage::Have { piece_index: 2 })
            .await
            .unwrap();

        assert_eq!(drain(&mut rx), vec![PeerMessage::Interested]);
        assert!(swarm.lock().await.peers[&2].bitfield.get(2));
        assert!(events.events().contains(&SwarmEvent::HaveReceived {
            remote: 2,
            piece_index: 1
        }));
    }

    #[tokio::test]
    async fn test_have_out_of_range_is_protocol_error() {
        let (swarm, _) = swarm_with(Arc::new(MemoryStore::new(8, 32)), false);
        let _rx = connect(&swarm, 2).await;

        assert!(matches!(
            swarm.handle_message(2, PeerMessage::Have { piece_index: 4 }).await,
            Err(SwarmError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_request_served_only_when_unchoked() {
        let store = Arc::new(MemoryStore::new(8, 32));
        store.insert(3, vec![3u8; 8]);
        let (swarm, _) = swarm_with(store, true);
        let mut rx = connect(&swarm, 2).await;

        swarm
            .handle_message(2, PeerMessage::Request { piece_index: 3 })
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        swarm.lock().await.peers.get_mut(&2).unwrap().state.choking_remote = false;
        swarm
            .handle_message(2, PeerMessage::Request { piece_index: 3 })
            .await
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![PeerMessage::Piece {
                piece_index: 3,
                data: vec![3u8; 8]
            }]
        );
    }

    #[tokio::test]
    async fn test_request_with_failed_read_sends_empty_piece() {
        let (swarm, _) = swarm_with(Arc::new(MemoryStore::new(8, 32)), true);
        let mut rx = connect(&swarm, 2).await;
        swarm.lock().await.peers.get_mut(&2).unwrap().state.choking_remote = false;

        swarm
            .handle_message(2, PeerMessage::Request { piece_index: 1 })
            .await
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![PeerMessage::Piece {
                piece_index: 1,
                data: Vec::new()
            }]
        );
    }

    #[tokio::test]
    async fn test_piece_stores_broadcasts_and_requests_next() {
        let store = Arc::new(MemoryStore::new(8, 32));
        let (swarm, events) = swarm_with(store.clone(), false);
        let mut from = connect(&swarm, 2).await;
        let mut other = connect(&swarm, 3).await;

        swarm
            .handle_message(2, PeerMessage::Bitfield { bitfield: full_bitfield() })
            .await
            .unwrap();
        swarm.handle_message(2, PeerMessage::Unchoke).await.unwrap();
        let sent = drain(&mut from);
        let requested = match sent[..] {
            [PeerMessage::Interested, PeerMessage::Request { piece_index }] => piece_index,
            _ => panic!("unexpected messages {:?}", sent),
        };

        swarm
            .handle_message(
                2,
                PeerMessage::Piece {
                    piece_index: requested,
                    data: vec![9u8; 8],
                },
            )
            .await
            .unwrap();

        assert_eq!(store.read_piece(requested).await.unwrap(), vec![9u8; 8]);
        let sent = drain(&mut from);
        assert_eq!(sent[0], PeerMessage::Have { piece_index: requested });
        assert!(matches!(sent[1], PeerMessage::Request { piece_index } if piece_index != requested));
        assert_eq!(drain(&mut other), vec![PeerMessage::Have { piece_index: requested }]);

        let state = swarm.lock().await;
        assert!(state.local.get(requested as usize));
        assert_eq!(state.peers[&2].downloaded, 8);
        assert_eq!(state.picker.requested_from(requested), None);
        assert!(events.events().contains(&SwarmEvent::PieceDownloaded {
            remote: 2,
            piece_index: requested,
            pieces_owned: 1
        }));
    }

    #[tokio::test]
    async fn test_bad_piece_length_releases_request() {
        let (swarm, _) = swarm_with(Arc::new(MemoryStore::new(8, 32)), false);
        let mut rx = connect(&swarm, 2).await;
        swarm
            .handle_message(2, PeerMessage::Bitfield { bitfield: full_bitfield() })
            .await
            .unwrap();
        drain(&mut rx);

        swarm
            .handle_message(
                2,
                PeerMessage::Piece {
                    piece_index: 0,
                    data: Vec::new(),
                },
            )
            .await
            .unwrap();

        let state = swarm.lock().await;
        assert!(!state.local.get(0));
        assert_eq!(state.picker.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_finishes_when_everyone_is_complete() {
        let (swarm, _) = swarm_with(Arc::new(MemoryStore::new(8, 32)), true);
        let mut rx = connect(&swarm, 2).await;

        swarm
            .handle_message(2, PeerMessage::Bitfield { bitfield: full_bitfield() })
            .await
            .unwrap();
        let closing = std::iter::from_fn(|| rx.try_recv().ok()).any(|c| matches!(c, Outbound::Shutdown));
        assert!(closing);
        assert!(!swarm.stop_token().is_cancelled());

        swarm.unregister(2).await;
        assert!(swarm.stop_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_finalize_stops_swarm_with_error() {
        let store = Arc::new(MemoryStore::new(8, 8));
        store.break_finalize();
        let events = Arc::new(RecordingSink::default());
        let swarm = Swarm::new(1, common_config(1, 8), vec![2], false, store, events.clone());
        let mut rx = connect(&swarm, 2).await;

        swarm
            .handle_message(2, PeerMessage::Bitfield { bitfield: vec![0x80] })
            .await
            .unwrap();
        swarm.handle_message(2, PeerMessage::Unchoke).await.unwrap();
        drain(&mut rx);
        swarm
            .handle_message(
                2,
                PeerMessage::Piece {
                    piece_index: 0,
                    data: vec![5u8; 8],
                },
            )
            .await
            .unwrap();

        assert!(swarm.stop_token().is_cancelled());
        assert!(!events.events().contains(&SwarmEvent::DownloadComplete));
        assert!(matches!(
            swarm.finished().await,
            Err(SwarmError::FinalizeFailed(_))
        ));
    }

    async fn seeded_file_store(dir: &TempDir, contents: &[u8]) -> Arc<FileStore> {
        let config = common_config(4, 8);
        let peer_dir = dir.path().join("peer_1");
        std::fs::create_dir_all(&peer_dir).unwrap();
        std::fs::write(peer_dir.join(&config.file_name), contents).unwrap();

        let store = Arc::new(FileStore::new(dir.path(), 1, &config, true));
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_seeder_to_leecher_end_to_end() {
        let dir = TempDir::new().unwrap();
        let contents: Vec<u8> = (0..32u8).collect();
        let config = common_config(4, 8);

        let seeder_store = seeded_file_store(&dir, &contents).await;
        let leecher_store = Arc::new(FileStore::new(dir.path(), 2, &config, false));
        leecher_store.initialize().await.unwrap();

        let seeder = Swarm::new(
            1,
            config.clone(),
            vec![2],
            true,
            seeder_store,
            Arc::new(RecordingSink::default()),
        );
        let leecher_events = Arc::new(RecordingSink::default());
        let leecher = Swarm::new(
            2,
            config,
            vec![1],
            false,
            leecher_store.clone(),
            leecher_events.clone(),
        );

        let schedulers = seeder.spawn_schedulers();
        let (a, b) = tokio::io::duplex(1024);

        let outbound = {
            let leecher = leecher.clone();
            tokio::spawn(async move { leecher.run_session(a, Direction::Outbound { expected: 1 }).await })
        };
        let inbound = {
            let seeder = seeder.clone();
            tokio::spawn(async move { seeder.run_session(b, Direction::Inbound).await })
        };

        tokio::time::timeout(Duration::from_secs(20), async {
            outbound.await.unwrap().unwrap();
            inbound.await.unwrap().unwrap();
            seeder.finished().await.unwrap();
            leecher.finished().await.unwrap();
        })
        .await
        .expect("swarm did not finish");

        schedulers.0.await.unwrap();
        schedulers.1.await.unwrap();

        assert!(leecher.lock().await.local.is_complete());
        assert!(leecher_store.has_complete_file());
        leecher_store.finalize().await.unwrap();
        assert_eq!(std::fs::read(leecher_store.final_path()).unwrap(), contents);

        let events = leecher_events.events();
        assert!(events.contains(&SwarmEvent::ConnectionMade { remote: 1 }));
        assert!(events.contains(&SwarmEvent::DownloadComplete));
        let downloaded = events
            .iter()
            .filter(|e| matches!(e, SwarmEvent::PieceDownloaded { .. }))
            .count();
        assert_eq!(downloaded, 4);
    }

    #[tokio::test]
    async fn test_outbound_rejects_unexpected_peer() {
        let (swarm, _) = swarm_with(Arc::new(MemoryStore::new(8, 32)), false);
        let (a, b) = tokio::io::duplex(256);

        let impostor = tokio::spawn(async move {
            let mut connection = PeerConnection::new(b);
            connection.receive_handshake().await.unwrap();
            connection.send_handshake(9).await.unwrap();
        });

        let result = swarm.run_session(a, Direction::Outbound { expected: 2 }).await;
        assert!(matches!(result, Err(SwarmError::InvalidHandshake(_))));
        impostor.await.unwrap();
        assert!(swarm.lock().await.peers.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_rejects_bad_header() {
        let (swarm, _) = swarm_with(Arc::new(MemoryStore::new(8, 32)), false);
        let (a, mut b) = tokio::io::duplex(256);

        let mut bytes = crate::peer::Handshake::new(2).to_bytes();
        bytes[0] = b'X';
        tokio::io::AsyncWriteExt::write_all(&mut b, &bytes).await.unwrap();

        let result = swarm.run_session(a, Direction::Inbound).await;
        assert!(matches!(result, Err(SwarmError::InvalidHandshake(_))));
    }
}
