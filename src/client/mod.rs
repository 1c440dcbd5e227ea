use crate::config::{CommonConfig, PeerId, PeerInfo, PeerRoster};
use crate::error::{Result, SwarmError};
use crate::events::{EventSink, FileEventLog, TracingSink};
use crate::storage::{FileStore, PieceStore};
use crate::swarm::{Direction, Swarm};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Where a peer process finds its configuration and keeps its files
pub struct ClientConfig {
    pub peer_id: PeerId,
    pub common_path: PathBuf,
    pub peers_path: PathBuf,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
}

/// One peer process: listener, dialler and schedulers around a swarm
pub struct PeerClient {
    config: ClientConfig,
}

impl PeerClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Run until every peer in the roster holds the complete file.
    pub async fn run(&self) -> Result<()> {
        let peer_id = self.config.peer_id;

        // Configuration problems surface before any socket is opened
        let common = CommonConfig::load(&self.config.common_path).await?;
        let roster = PeerRoster::load(&self.config.peers_path).await?;
        let me = roster.find(peer_id).cloned().ok_or_else(|| {
            SwarmError::Config(format!("Peer {} is not in the roster", peer_id))
        })?;

        info!(
            "Peer {}: {} ({} bytes, {} pieces of {} bytes)",
            peer_id,
            common.file_name,
            common.file_size,
            common.num_pieces(),
            common.piece_size
        );

        let events: Arc<dyn EventSink> = match FileEventLog::create(&self.config.log_dir, peer_id) {
            Ok(log) => {
                info!("Logging events to {}", log.path().display());
                Arc::new(log)
            }
            Err(e) => {
                warn!("Event log unavailable ({}), logging to console only", e);
                Arc::new(TracingSink::new(peer_id))
            }
        };

        let store = Arc::new(FileStore::new(
            &self.config.work_dir,
            peer_id,
            &common,
            me.has_file,
        ));
        store.initialize().await?;

        let expected = roster.others(peer_id).map(|p| p.peer_id).collect();
        let swarm = Swarm::new(peer_id, common, expected, me.has_file, store, events);

        let listener = TcpListener::bind(("0.0.0.0", me.port)).await?;
        info!("Peer {} listening on port {}", peer_id, me.port);
        let acceptor = tokio::spawn(accept_loop(swarm.clone(), listener));

        for peer in roster.earlier_than(peer_id).cloned() {
            tokio::spawn(dial(swarm.clone(), peer));
        }

        let (preferred, optimistic) = swarm.spawn_schedulers();

        let outcome = swarm.finished().await;

        acceptor.abort();
        for task in [preferred, optimistic] {
            if let Err(e) = task.await {
                error!("Scheduler task failed: {}", e);
            }
        }
        outcome?;

        info!("Peer {} done, every peer holds the complete file", peer_id);
        Ok(())
    }
}

async fn accept_loop(swarm: Swarm, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Accepted connection from {}", addr);
                let swarm = swarm.clone();
                tokio::spawn(async move {
                    if let Err(e) = swarm.run_session(stream, Direction::Inbound).await {
                        warn!("Session with {} ended: {}", addr, e);
                    }
                });
            }
            Err(e) => warn!("Failed to accept connection: {}", e),
        }
    }
}

/// Connect to an earlier peer, retrying while it may still be starting up.
async fn dial(swarm: Swarm, peer: PeerInfo) {
    let stop = swarm.stop_token();

    for attempt in 1..=CONNECT_ATTEMPTS {
        info!(
            "Connecting to peer {} at {}:{} (attempt {})",
            peer.peer_id, peer.host, peer.port, attempt
        );

        let connected = tokio::select! {
            _ = stop.cancelled() => return,
            result = TcpStream::connect((peer.host.as_str(), peer.port)) => result,
        };

        match connected {
            Ok(stream) => {
                let direction = Direction::Outbound {
                    expected: peer.peer_id,
                };
                if let Err(e) = swarm.run_session(stream, direction).await {
                    warn!("Session with peer {} ended: {}", peer.peer_id, e);
                }
                return;
            }
            Err(e) => {
                warn!("Failed to connect to peer {}: {}", peer.peer_id, e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }

    error!(
        "Giving up on peer {} after {} attempts",
        peer.peer_id, CONNECT_ATTEMPTS
    );
}
