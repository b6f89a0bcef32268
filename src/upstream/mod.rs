pub mod adapter;
pub mod client;
pub mod headers;
pub mod keepalive;
pub mod peer;

pub use client::{proxy_pass, ProxyOutcome};
pub use keepalive::KeepalivePool;
pub use peer::{PeerFreeState, PeerSet};
