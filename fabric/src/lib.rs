//! Relay forwarding fabric for a Media-over-QUIC publish/subscribe mesh.
//!
//! Publishers announce tracks under hierarchical namespaces; subscribers
//! subscribe to exact tracks or to namespace prefixes. This crate is the
//! relay's core: the client-side state machine, the short-lived object
//! cache, the peering information base with its path selector, the framed
//! peer protocol and the forwarding plane tying them together.
//!
//! The QUIC transport and the client-facing MoQ session layer are external
//! collaborators, consumed through the [transport] and [session] seams.

pub mod cache;
pub mod coding;
pub mod forward;
pub mod peering;
pub mod session;
pub mod state;
pub mod track;
pub mod transport;

mod client;
mod relay;

pub use cache::{CacheConfig, ObjectCache};
pub use client::{ClientManager, ClientStats};
pub use relay::{Relay, RelayOptions};
pub use track::{FullTrackName, TrackAlias, TrackHash, TrackNamespace};
