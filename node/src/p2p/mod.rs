pub mod client;
pub mod manager;
pub mod messages;
pub mod sync;

pub use client::{HttpPeer, PeerClient};
pub use manager::PeerManager;
pub use messages::{HeadInfo, HeaderSummary};
