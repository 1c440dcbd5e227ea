use crate::client::{ClientConfig, PeerClient};
use crate::config::PeerId;
use crate::error::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "p2p-swarm")]
#[command(about = "A peer-to-peer file sharing peer process", long_about = None)]
pub struct Cli {
    /// This peer's id, as listed in the peer roster
    peer_id: PeerId,

    /// Common settings file
    #[arg(short, long, default_value = "Common.cfg")]
    common: PathBuf,

    /// Peer roster file
    #[arg(short, long, default_value = "PeerInfo.cfg")]
    peers: PathBuf,

    /// Directory holding the peer_<id> file directories
    #[arg(short, long, default_value = ".")]
    work_dir: PathBuf,

    /// Directory for the log_peer_<id>.log event log [default: <work-dir>/project]
    #[arg(short, long)]
    log_dir: Option<PathBuf>,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        let config = ClientConfig {
            peer_id: self.peer_id,
            common_path: self.common.clone(),
            peers_path: self.peers.clone(),
            work_dir: self.work_dir.clone(),
            log_dir: self
                .log_dir
                .clone()
                .unwrap_or_else(|| self.work_dir.join("project")),
        };

        PeerClient::new(config).run().await
    }
}
