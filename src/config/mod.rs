use crate::error::{Result, SwarmError};
use crate::peer::MAX_FRAME_LEN;
use crate::piece;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Peer identity assigned in the roster, unique across the swarm.
pub type PeerId = u32;

/// Settings shared by every peer in the swarm (`Common.cfg`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonConfig {
    pub preferred_neighbors: usize,
    pub unchoking_interval_secs: u64,
    pub optimistic_unchoking_interval_secs: u64,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u32,
}

impl CommonConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            SwarmError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        text.parse()
    }

    pub fn num_pieces(&self) -> usize {
        piece::num_pieces(self.file_size, self.piece_size)
    }

    pub fn unchoking_interval(&self) -> Duration {
        Duration::from_secs(self.unchoking_interval_secs)
    }

    pub fn optimistic_unchoking_interval(&self) -> Duration {
        Duration::from_secs(self.optimistic_unchoking_interval_secs)
    }
}

impl FromStr for CommonConfig {
    type Err = SwarmError;

    fn from_str(text: &str) -> Result<Self> {
        let mut preferred_neighbors = None;
        let mut unchoking = None;
        let mut optimistic = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for line in text.lines() {
            let mut tokens = line.split_whitespace();
            let (Some(key), Some(value)) = (tokens.next(), tokens.next()) else {
                continue;
            };

            match key {
                "NumberOfPreferredNeighbors" => preferred_neighbors = Some(number(key, value)?),
                "UnchokingInterval" => unchoking = Some(number(key, value)?),
                "OptimisticUnchokingInterval" => optimistic = Some(number(key, value)?),
                "FileName" => file_name = Some(value.to_string()),
                "FileSize" => file_size = Some(number(key, value)?),
                "PieceSize" => piece_size = Some(number(key, value)?),
                other => debug!("Ignoring unknown config key {}", other),
            }
        }

        let config = CommonConfig {
            preferred_neighbors: required("NumberOfPreferredNeighbors", preferred_neighbors)?,
            unchoking_interval_secs: required("UnchokingInterval", unchoking)?,
            optimistic_unchoking_interval_secs: required("OptimisticUnchokingInterval", optimistic)?,
            file_name: required("FileName", file_name)?,
            file_size: required("FileSize", file_size)?,
            piece_size: required("PieceSize", piece_size)?,
        };

        if config.file_size == 0 || config.piece_size == 0 {
            return Err(SwarmError::Config(
                "FileSize and PieceSize must be positive".to_string(),
            ));
        }
        if config.unchoking_interval_secs == 0 || config.optimistic_unchoking_interval_secs == 0 {
            return Err(SwarmError::Config(
                "Unchoking intervals must be positive".to_string(),
            ));
        }

        // Type byte and piece index share the frame with the piece data
        if u64::from(config.piece_size) + 5 > MAX_FRAME_LEN as u64 {
            return Err(SwarmError::Config(format!(
                "PieceSize {} does not fit in a {} byte frame",
                config.piece_size, MAX_FRAME_LEN
            )));
        }
        if config.num_pieces().div_ceil(8) + 1 > MAX_FRAME_LEN {
            return Err(SwarmError::Config(format!(
                "{} pieces make a bitfield larger than a {} byte frame",
                config.num_pieces(),
                MAX_FRAME_LEN
            )));
        }

        Ok(config)
    }
}

/// One row of `PeerInfo.cfg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

/// Statically configured peer list, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRoster {
    peers: Vec<PeerInfo>,
}

impl PeerRoster {
    pub fn new(peers: Vec<PeerInfo>) -> Result<Self> {
        if peers.is_empty() {
            return Err(SwarmError::Config("Peer roster is empty".to_string()));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = peers.iter().find(|p| !seen.insert(p.peer_id)) {
            return Err(SwarmError::Config(format!(
                "Duplicate peer id {} in roster",
                dup.peer_id
            )));
        }

        Ok(Self { peers })
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            SwarmError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        text.parse()
    }

    pub fn find(&self, peer_id: PeerId) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    /// Peers listed before `peer_id`; these are already running and get dialled.
    pub fn earlier_than(&self, peer_id: PeerId) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter().take_while(move |p| p.peer_id != peer_id)
    }

    pub fn others(&self, peer_id: PeerId) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter().filter(move |p| p.peer_id != peer_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

impl FromStr for PeerRoster {
    type Err = SwarmError;

    fn from_str(text: &str) -> Result<Self> {
        let mut peers = Vec::new();

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            let &[id, host, port, has_file] = tokens.as_slice() else {
                return Err(SwarmError::Config(format!("Malformed peer row: {}", line)));
            };

            peers.push(PeerInfo {
                peer_id: number("peer id", id)?,
                host: host.to_string(),
                port: number("port", port)?,
                has_file: number::<u8>("has file", has_file)? != 0,
            });
        }

        PeerRoster::new(peers)
    }
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| SwarmError::Config(format!("{} is not a valid number: {}", key, value)))
}

fn required<T>(key: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| SwarmError::Config(format!("Missing required setting {}", key)))
}
