pub mod bitfield;
pub mod client;
pub mod message;
pub mod output;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod torrent;
pub mod tracker;
