//! The built-in direct-peer transport.
//!
//! A concrete implementation of the transport contract on libp2p: noise
//! mutual authentication, yamux multiplexing, mDNS on the local subnet,
//! Kademlia for wide-area peer routing, and a single-shot request/response
//! protocol (`/firma-sign/transfer/1`) framing one transfer per stream. The
//! process-wide peer directory lives here too, fed by discovery and
//! incoming transfers.

pub mod directory;
pub mod identity;
pub mod protocol;
pub mod swarm;
pub mod transport;

pub use directory::PeerDirectory;
pub use transport::P2pTransport;
