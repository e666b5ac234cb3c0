//! Pairchat Harness
//!
//! In-process implementations of the collaborators the engine consumes but
//! does not build, for tests and the CLI demo:
//! - `relay`: an in-memory pairing relay with FIFO matching and partner routing
//! - `link`: a `SignalingLink` over that relay with bounded reconnection
//! - `mock_connection`: a scriptable `PeerConnection` and its factory
//! - `media`: a `MediaSource` backed by a fixed track set

pub mod link;
pub mod media;
pub mod mock_connection;
pub mod relay;

pub use link::{LinkController, RelayLink};
pub use media::StaticMediaSource;
pub use mock_connection::{MockBehavior, MockCall, MockConnectionFactory, MockPeerConnection};
pub use relay::{ConnectionId, PairingRelay, RelayStats};
