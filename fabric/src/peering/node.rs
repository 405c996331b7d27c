use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::coding::{decode_remaining, CodecError, Decode, Encode, UintVar};

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u8)]
pub enum NodeType {
	/// Forwards only; never delivers to local clients.
	Via = 0,
	/// Has clients attached.
	Edge = 1,
	/// Stub edge.
	Stub = 2,
}

impl FromStr for NodeType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"via" => Ok(Self::Via),
			"edge" => Ok(Self::Edge),
			"stub" => Ok(Self::Stub),
			_ => Err(format!("unknown node type: {s}")),
		}
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid node id: {0}")]
pub struct InvalidNodeId(pub String);

/// Globally unique relay identity.
///
/// The string form is `<hi>:<lo>` where each half is a u32, optionally
/// written as dotted 16-bit halves (`<u16>.<u16>`). Examples: `12:34`,
/// `1.2:34`, `1234.5678:100.6109`. Formatting always uses dotted notation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

fn parse_half(value: &str) -> Result<u32, InvalidNodeId> {
	let err = || InvalidNodeId(value.to_string());

	match value.split_once('.') {
		None => value.parse::<u32>().map_err(|_| err()),
		Some((hi, lo)) => {
			if lo.contains('.') {
				return Err(err());
			}
			let hi: u16 = hi.parse().map_err(|_| err())?;
			let lo: u16 = lo.parse().map_err(|_| err())?;
			Ok(((hi as u32) << 16) | lo as u32)
		}
	}
}

impl FromStr for NodeId {
	type Err = InvalidNodeId;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (hi, lo) = s.split_once(':').ok_or_else(|| InvalidNodeId(s.to_string()))?;

		let hi = parse_half(hi)? as u64;
		let lo = parse_half(lo)? as u64;
		Ok(Self((hi << 32) | lo))
	}
}

impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}.{}:{}.{}",
			(self.0 >> 48) as u16,
			(self.0 >> 32) as u16,
			(self.0 >> 16) as u16,
			self.0 as u16
		)
	}
}

impl From<NodeId> for u64 {
	fn from(id: NodeId) -> Self {
		id.0
	}
}

impl From<u64> for NodeId {
	fn from(id: u64) -> Self {
		Self(id)
	}
}

/// One hop in the path a NodeInfo traversed. Fixed 16 bytes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodePathItem {
	/// Node that received (and re-advertised) the node info.
	pub id: u64,
	/// sRTT in microseconds of the peer session it arrived over.
	pub srtt_us: u64,
}

pub const NODE_PATH_ITEM_SIZE: usize = 16;

impl Encode for NodePathItem {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.id.encode(w);
		self.srtt_us.encode(w);
	}
}

impl Decode for NodePathItem {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		Ok(Self {
			id: u64::decode(r)?,
			srtt_us: u64::decode(r)?,
		})
	}
}

/// Self-description a relay advertises to its peers.
///
/// Every relay advertises itself and the nodes it knows about; the `path`
/// records which relays the advertisement already traversed, and is how
/// both loop prevention and best-path selection work.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
	pub id: u64,
	pub node_type: NodeType,
	/// Relay contact address, `host[:port]`.
	pub contact: String,
	pub longitude: f64,
	pub latitude: f64,
	pub path: Vec<NodePathItem>,
}

impl Default for NodeInfo {
	fn default() -> Self {
		Self {
			id: 0,
			node_type: NodeType::Edge,
			contact: String::new(),
			longitude: 0.0,
			latitude: 0.0,
			path: Vec::new(),
		}
	}
}

impl NodeInfo {
	pub fn size_bytes(&self) -> usize {
		8 + 1
			+ UintVar::new(self.contact.len() as u64).size()
			+ self.contact.len()
			+ 8 + 8
			+ self.path.len() * NODE_PATH_ITEM_SIZE
	}

	/// Total of the sRTT of every hop in the path.
	pub fn sum_srtt(&self) -> u64 {
		self.path.iter().map(|item| item.srtt_us).sum()
	}

	/// True when `node_id` already appears in the path.
	pub fn path_contains(&self, node_id: u64) -> bool {
		self.path.iter().any(|item| item.id == node_id)
	}

	/// Frame for the control stream, as advertise or withdraw.
	pub fn serialize(&self, withdraw: bool) -> bytes::Bytes {
		let msg_type = match withdraw {
			false => super::MsgType::NodeInfoAdvertise,
			true => super::MsgType::NodeInfoWithdrawn,
		};
		super::serialize(msg_type, self.size_bytes(), |w| self.encode(w))
	}
}

impl Encode for NodeInfo {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.id.encode(w);
		u8::from(self.node_type).encode(w);

		UintVar::new(self.contact.len() as u64).encode(w);
		w.put_slice(self.contact.as_bytes());

		self.longitude.encode(w);
		self.latitude.encode(w);

		for item in &self.path {
			item.encode(w);
		}
	}
}

impl Decode for NodeInfo {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		let id = u64::decode(r)?;
		let node_type = NodeType::try_from(u8::decode(r)?).map_err(|_| CodecError::InvalidValue)?;

		let contact_len = u64::from(UintVar::decode(r)?) as usize;
		decode_remaining(r, contact_len)?;
		let contact =
			String::from_utf8(r.copy_to_bytes(contact_len).to_vec()).map_err(|_| CodecError::InvalidValue)?;

		let longitude = f64::decode(r)?;
		let latitude = f64::decode(r)?;

		// The path runs to the end of the message.
		if r.remaining() % NODE_PATH_ITEM_SIZE != 0 {
			return Err(CodecError::ShortBuffer);
		}

		let mut path = Vec::with_capacity(r.remaining() / NODE_PATH_ITEM_SIZE);
		while r.has_remaining() {
			path.push(NodePathItem::decode(r)?);
		}

		Ok(Self {
			id,
			node_type,
			contact,
			longitude,
			latitude,
			path,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::BytesMut;

	fn node_id(s: &str) -> u64 {
		NodeId::from_str(s).unwrap().into()
	}

	#[test]
	fn node_id_parsing() {
		// No colon.
		assert!(NodeId::from_str("1234").is_err());
		// Dotted halves cannot exceed 16 bits.
		assert!(NodeId::from_str("1.70000:1.2").is_err());

		assert_eq!(node_id("12:34"), 51539607586);
		assert_eq!(node_id("1.2:34"), 281483566645282);

		assert_eq!(NodeId(347364508091815901).to_string(), "1234.5678:100.6109");
	}

	#[test]
	fn node_info_round_trip() {
		let info = NodeInfo {
			id: node_id("12:34"),
			node_type: NodeType::Edge,
			contact: "localhost:1234".into(),
			longitude: -122.5327124,
			latitude: 47.6482974,
			path: vec![
				NodePathItem {
					id: node_id("1:1"),
					srtt_us: 54321,
				},
				NodePathItem {
					id: node_id("2:2"),
					srtt_us: 12345,
				},
			],
		};

		let mut buf = BytesMut::new();
		info.encode(&mut buf);
		assert_eq!(buf.len(), 72);
		assert_eq!(buf.len(), info.size_bytes());

		let decoded = NodeInfo::decode(&mut buf.freeze()).unwrap();
		assert_eq!(decoded, info);

		assert_eq!(info.sum_srtt(), 66666);
		assert!(info.path_contains(node_id("2:2")));
		assert!(!info.path_contains(node_id("3:3")));
	}
}
