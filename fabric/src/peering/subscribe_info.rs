use bytes::{Buf, BufMut, Bytes};

use crate::coding::{decode_remaining, CodecError, Decode, Encode};
use crate::track::TrackHash;

use super::{serialize, MsgType};

/// A subscriber of a specific track, exchanged between relays.
///
/// `subscribe_data` carries the original MoQ subscribe in wire form so the
/// relay that owns the publisher can replay it into its clients. `seq` gives
/// peers last-writer-wins semantics without requiring FIFO delivery across
/// reroutes: the origin bumps it on every re-advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeInfo {
	pub seq: u16,
	pub source_node_id: u64,
	pub track_hash: TrackHash,
	pub subscribe_data: Bytes,
}

impl SubscribeInfo {
	pub fn size_bytes(&self) -> usize {
		2 + 8 + 24 + 4 + self.subscribe_data.len()
	}

	/// Wrap at the u16 boundary; two equal seqs compare as a no-op.
	pub fn bump_seq(&mut self) {
		self.seq = self.seq.wrapping_add(1);
	}

	pub fn serialize(&self, withdraw: bool) -> Bytes {
		let msg_type = match withdraw {
			false => MsgType::SubscribeInfoAdvertised,
			true => MsgType::SubscribeInfoWithdrawn,
		};
		serialize(msg_type, self.size_bytes(), |w| self.encode(w))
	}
}

impl Encode for SubscribeInfo {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.seq.encode(w);
		self.source_node_id.encode(w);

		self.track_hash.namespace.encode(w);
		self.track_hash.name.encode(w);
		self.track_hash.fullname.encode(w);

		(self.subscribe_data.len() as u32).encode(w);
		w.put_slice(&self.subscribe_data);
	}
}

impl Decode for SubscribeInfo {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		let seq = u16::decode(r)?;
		let source_node_id = u64::decode(r)?;

		let track_hash = TrackHash {
			namespace: u64::decode(r)?,
			name: u64::decode(r)?,
			fullname: u64::decode(r)?,
		};

		let len = u32::decode(r)? as usize;
		decode_remaining(r, len)?;
		let subscribe_data = r.copy_to_bytes(len);

		Ok(Self {
			seq,
			source_node_id,
			track_hash,
			subscribe_data,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peering::{ControlMessage, ControlReader, COMMON_HEADER_SIZE};
	use crate::session::{FilterType, GroupOrder, SubscribeRecord};
	use crate::track::{FullTrackName, TrackNamespace};
	use bytes::BytesMut;

	#[test]
	fn serialize_subscribe_info() {
		// Four single-byte namespace tuples and a one-byte name encode to a
		// 19 byte subscribe record.
		let record = SubscribeRecord {
			ftn: FullTrackName::new(
				TrackNamespace::new([
					Bytes::from_static(b"a"),
					Bytes::from_static(b"b"),
					Bytes::from_static(b"c"),
					Bytes::from_static(b"d"),
				]),
				"v",
			),
			priority: 1,
			group_order: GroupOrder::Descending,
			filter_type: FilterType::LatestGroup,
		};
		let mut data = BytesMut::new();
		record.encode(&mut data);
		assert_eq!(data.len(), 19);

		let info = SubscribeInfo {
			seq: 0x1234,
			source_node_id: 0xff00aabbcc,
			track_hash: TrackHash {
				namespace: 0x1,
				name: 0x9000,
				fullname: 0xaa0bb0cc0dd0ee,
			},
			subscribe_data: data.freeze(),
		};

		assert_eq!(info.size_bytes(), 57);

		let frame = info.serialize(false);
		assert_eq!(frame.len(), COMMON_HEADER_SIZE + 57);

		let mut reader = ControlReader::default();
		reader.push(&frame);
		let decoded = reader.next().unwrap();
		assert_eq!(decoded, Some(ControlMessage::SubscribeInfoAdvertised(info.clone())));

		// The withdraw frame carries the same body under its own type.
		let frame = info.serialize(true);
		let mut reader = ControlReader::default();
		reader.push(&frame);
		assert_eq!(reader.next().unwrap(), Some(ControlMessage::SubscribeInfoWithdrawn(info)));
	}

	#[test]
	fn oversized_subscribe_data_rejected() {
		let info = SubscribeInfo {
			seq: 1,
			source_node_id: 2,
			track_hash: TrackHash {
				namespace: 3,
				name: 4,
				fullname: 5,
			},
			subscribe_data: Bytes::from_static(b"abcdef"),
		};

		let mut frame = BytesMut::new();
		info.encode(&mut frame);

		// Truncate into the subscribe data.
		let mut short = frame.freeze().slice(..info.size_bytes() - 3);
		assert_eq!(SubscribeInfo::decode(&mut short), Err(CodecError::ShortBuffer));
	}

	#[test]
	fn seq_wraps() {
		let mut info = SubscribeInfo {
			seq: 0xFFFF,
			source_node_id: 1,
			track_hash: TrackHash {
				namespace: 0,
				name: 0,
				fullname: 0,
			},
			subscribe_data: Bytes::new(),
		};

		info.bump_seq();
		assert_eq!(info.seq, 0);
	}
}
