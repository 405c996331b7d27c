use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes};

use crate::coding::{CodecError, Decode, Encode};

use super::{serialize, MsgType, SnsId};

/// Remote source nodes interested in the same subset of tracks on one peer
/// session; one set maps to one data context on that session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeNodeSet {
	pub id: SnsId,
	/// Priority for the data context serving this set.
	pub priority: u8,
	pub nodes: BTreeSet<u64>,
}

impl SubscribeNodeSet {
	pub fn new(id: SnsId) -> Self {
		Self {
			id,
			priority: 2,
			nodes: BTreeSet::new(),
		}
	}

	pub fn size_bytes(&self) -> usize {
		4 + 1 + 2 + self.nodes.len() * 8
	}

	pub fn serialize(&self) -> Bytes {
		serialize(MsgType::SubscribeNodeSetAdvertised, self.size_bytes(), |w| self.encode(w))
	}
}

impl Encode for SubscribeNodeSet {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.id.encode(w);
		self.priority.encode(w);

		(self.nodes.len() as u16).encode(w);
		for node_id in &self.nodes {
			node_id.encode(w);
		}
	}
}

impl Decode for SubscribeNodeSet {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		let id = u32::decode(r)?;
		let priority = u8::decode(r)?;

		let count = u16::decode(r)?;
		let mut nodes = BTreeSet::new();
		for _ in 0..count {
			nodes.insert(u64::decode(r)?);
		}

		Ok(Self { id, priority, nodes })
	}
}

/// Withdraw frame for a node set; carries only the id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnsWithdraw {
	pub id: SnsId,
}

impl SnsWithdraw {
	pub fn serialize(&self) -> Bytes {
		serialize(MsgType::SubscribeNodeSetWithdrawn, 4, |w| self.encode(w))
	}
}

impl Encode for SnsWithdraw {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.id.encode(w);
	}
}

impl Decode for SnsWithdraw {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		Ok(Self {
			id: u32::decode(r)?,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peering::{ControlMessage, ControlReader, NodeId, COMMON_HEADER_SIZE};
	use std::str::FromStr;

	#[test]
	fn serialize_subscribe_node_set() {
		let mut sns = SubscribeNodeSet::new(0x1234);
		sns.nodes.insert(NodeId::from_str("1:1").unwrap().into());
		sns.nodes.insert(NodeId::from_str("200:300").unwrap().into());

		assert_eq!(sns.size_bytes(), 23);

		let frame = sns.serialize();
		assert_eq!(frame.len(), COMMON_HEADER_SIZE + 23);

		let mut reader = ControlReader::default();
		reader.push(&frame);
		assert_eq!(reader.next().unwrap(), Some(ControlMessage::SnsAdvertised(sns)));
	}

	#[test]
	fn serialize_withdraw() {
		let withdraw = SnsWithdraw { id: 0x1234 };
		let frame = withdraw.serialize();
		assert_eq!(frame.len(), COMMON_HEADER_SIZE + 4);

		let mut reader = ControlReader::default();
		reader.push(&frame);
		assert_eq!(reader.next().unwrap(), Some(ControlMessage::SnsWithdrawn(withdraw)));
	}
}
