//! Torrent-side state: peers, modes and per-torrent contexts.

pub mod context;
pub mod mode;
pub mod peer;

pub use context::{
    NullPicker, PeerExchange, PeerExchangeFactory, PiecePicker, TorrentContext, TorrentSettings,
    TorrentSnapshot,
};
pub use mode::{DownloadingMode, SeedingMode, StoppedMode, TorrentMode};
pub use peer::{Peer, PeerInfo};
