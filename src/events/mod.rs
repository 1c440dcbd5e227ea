use crate::config::PeerId;
use crate::error::Result;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

/// Protocol transitions worth recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    ConnectionMade { remote: PeerId },
    ConnectionReceived { remote: PeerId },
    PreferredNeighborsChanged { neighbors: Vec<PeerId> },
    OptimisticUnchokeChanged { neighbor: PeerId },
    UnchokedBy { remote: PeerId },
    ChokedBy { remote: PeerId },
    HaveReceived { remote: PeerId, piece_index: u32 },
    InterestedReceived { remote: PeerId },
    NotInterestedReceived { remote: PeerId },
    PieceDownloaded {
        remote: PeerId,
        piece_index: u32,
        pieces_owned: usize,
    },
    DownloadComplete,
}

/// Renders the event as it reads in a peer's log, e.g. `Peer 1001 is choked by 1002.`
pub struct Described<'a> {
    local: PeerId,
    event: &'a SwarmEvent,
}

impl SwarmEvent {
    pub fn describe(&self, local: PeerId) -> Described<'_> {
        Described { local, event: self }
    }
}

impl fmt::Display for Described<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let me = self.local;
        match self.event {
            SwarmEvent::ConnectionMade { remote } => {
                write!(f, "Peer {} makes a connection to Peer {}.", me, remote)
            }
            SwarmEvent::ConnectionReceived { remote } => {
                write!(f, "Peer {} is connected from Peer {}.", me, remote)
            }
            SwarmEvent::PreferredNeighborsChanged { neighbors } => {
                let list: Vec<String> = neighbors.iter().map(|id| id.to_string()).collect();
                write!(f, "Peer {} has the preferred neighbors {}.", me, list.join(","))
            }
            SwarmEvent::OptimisticUnchokeChanged { neighbor } => write!(
                f,
                "Peer {} has the optimistically unchoked neighbor {}.",
                me, neighbor
            ),
            SwarmEvent::UnchokedBy { remote } => {
                write!(f, "Peer {} is unchoked by {}.", me, remote)
            }
            SwarmEvent::ChokedBy { remote } => write!(f, "Peer {} is choked by {}.", me, remote),
            SwarmEvent::HaveReceived {
                remote,
                piece_index,
            } => write!(
                f,
                "Peer {} received the 'have' message from {} for the piece {}.",
                me, remote, piece_index
            ),
            SwarmEvent::InterestedReceived { remote } => write!(
                f,
                "Peer {} received the 'interested' message from {}.",
                me, remote
            ),
            SwarmEvent::NotInterestedReceived { remote } => write!(
                f,
                "Peer {} received the 'not interested' message from {}.",
                me, remote
            ),
            SwarmEvent::PieceDownloaded {
                remote,
                piece_index,
                pieces_owned,
            } => write!(
                f,
                "Peer {} has downloaded the piece {} from {}. Now the number of pieces it has is {}.",
                me, piece_index, remote, pieces_owned
            ),
            SwarmEvent::DownloadComplete => {
                write!(f, "Peer {} has downloaded the complete file.", me)
            }
        }
    }
}

/// Fire-and-forget destination for swarm events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: SwarmEvent);
}

/// Sends events to the `tracing` subscriber only.
pub struct TracingSink {
    local: PeerId,
}

impl TracingSink {
    pub fn new(local: PeerId) -> Self {
        Self { local }
    }
}

impl EventSink for TracingSink {
    fn record(&self, event: SwarmEvent) {
        info!(target: "swarm::event", "{}", event.describe(self.local));
    }
}

/// Per-peer event log file, `log_peer_<id>.log`, truncated on open.
pub struct FileEventLog {
    local: PeerId,
    path: PathBuf,
    file: Mutex<File>,
}

impl FileEventLog {
    pub fn create<P: AsRef<Path>>(log_dir: P, local: PeerId) -> Result<Self> {
        fs::create_dir_all(log_dir.as_ref())?;
        let path = log_dir.as_ref().join(format!("log_peer_{}.log", local));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            local,
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for FileEventLog {
    fn record(&self, event: SwarmEvent) {
        let line = format!(
            "{}: {}",
            chrono::Local::now().format("%a %b %e %H:%M:%S %Y"),
            event.describe(self.local)
        );
        info!(target: "swarm::event", "{}", event.describe(self.local));

        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
            error!("Could not write to {}: {}", self.path.display(), e);
        }
    }
}
