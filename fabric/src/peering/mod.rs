//! Relay-to-relay peering: wire messages, information base, sessions and
//! the peer manager.

mod announce_info;
mod connect;
mod data;
mod info_base;
mod manager;
mod message;
mod node;
mod node_set;
mod session;
mod subscribe_info;

pub use announce_info::*;
pub use connect::*;
pub use data::*;
pub use info_base::*;
pub use manager::*;
pub use message::*;
pub use node::*;
pub use node_set::*;
pub use session::*;
pub use subscribe_info::*;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Transport connection id of the session, reused as its identity.
pub type PeerSessionId = u64;

/// Identifier of a SubscribeNodeSet within one peer session.
pub type SnsId = u32;

pub const PROTOCOL_VERSION: u8 = 1;

/// version + type + data_length.
pub const COMMON_HEADER_SIZE: usize = 7;

pub const MAX_SNS_ID: SnsId = 0xFFFF_FFFE;

/// What a peering session exchanges: control-plane info, data objects, or
/// both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PeerMode {
	Ibp = 0,
	Data = 1,
	Both = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MsgType {
	Connect = 1,
	ConnectResponse = 2,
	DataObject = 3,
	NodeInfoAdvertise = 4,
	NodeInfoWithdrawn = 5,
	SubscribeInfoAdvertised = 6,
	SubscribeInfoWithdrawn = 7,
	AnnounceInfoAdvertised = 8,
	AnnounceInfoWithdrawn = 9,
	SubscribeNodeSetAdvertised = 10,
	SubscribeNodeSetWithdrawn = 11,
}

/// Error carried in a ConnectResponse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ProtocolError {
	NoError = 0,
	ConnectError = 1,
	ConnectNotAuthorized = 2,
}
