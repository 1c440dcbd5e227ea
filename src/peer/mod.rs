mod connection;
mod message;
mod protocol;

pub use connection::{
    read_message, run_writer, Outbound, OutboundReceiver, OutboundSender, PeerConnection,
    MAX_FRAME_LEN,
};
pub use message::PeerMessage;
pub use protocol::{Handshake, HANDSHAKE_LEN};

// Choke and interest flags of one peer relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    /// Whether the remote is choking us
    pub choked_by_remote: bool,
    /// Whether we are choking the remote
    pub choking_remote: bool,
    /// Whether the remote is interested in our pieces
    pub remote_interested: bool,
    /// Whether we are interested in the remote's pieces
    pub interested_in_remote: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            choked_by_remote: true,
            choking_remote: true,
            remote_interested: false,
            interested_in_remote: false,
        }
    }
}
