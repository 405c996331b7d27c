use bytes::{Buf, BufMut, Bytes};

use crate::coding::{decode_remaining, CodecError, Decode, Encode};
use crate::track::{FullTrackName, TrackHash, TrackNamespace};

use super::{serialize, MsgType};

/// A track announced somewhere in the relay network.
///
/// Unlike [super::SubscribeInfo] this carries the namespace tuples in the
/// clear: receiving relays need them to maintain the prefix index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnounceInfo {
	pub source_node_id: u64,
	pub namespace: TrackNamespace,
	pub name: Bytes,
}

impl AnnounceInfo {
	pub fn new(source_node_id: u64, ftn: &FullTrackName) -> Self {
		Self {
			source_node_id,
			namespace: ftn.namespace.clone(),
			name: ftn.name.clone(),
		}
	}

	pub fn full_track_name(&self) -> FullTrackName {
		FullTrackName::new(self.namespace.clone(), self.name.clone())
	}

	pub fn track_hash(&self) -> TrackHash {
		TrackHash::new(&self.full_track_name())
	}

	pub fn size_bytes(&self) -> usize {
		let tuples: usize = self.namespace.tuples().iter().map(|t| 2 + t.len()).sum();
		8 + 1 + tuples + 2 + self.name.len()
	}

	pub fn serialize(&self, withdraw: bool) -> Bytes {
		let msg_type = match withdraw {
			false => MsgType::AnnounceInfoAdvertised,
			true => MsgType::AnnounceInfoWithdrawn,
		};
		serialize(msg_type, self.size_bytes(), |w| self.encode(w))
	}
}

impl Encode for AnnounceInfo {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.source_node_id.encode(w);

		let tuples = self.namespace.tuples();
		(tuples.len() as u8).encode(w);
		for tuple in tuples {
			(tuple.len() as u16).encode(w);
			w.put_slice(tuple);
		}

		(self.name.len() as u16).encode(w);
		w.put_slice(&self.name);
	}
}

impl Decode for AnnounceInfo {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		let source_node_id = u64::decode(r)?;

		let count = u8::decode(r)?;
		let mut tuples = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let len = u16::decode(r)? as usize;
			decode_remaining(r, len)?;
			tuples.push(r.copy_to_bytes(len));
		}

		let len = u16::decode(r)? as usize;
		decode_remaining(r, len)?;
		let name = r.copy_to_bytes(len);

		Ok(Self {
			source_node_id,
			namespace: TrackNamespace::new(tuples),
			name,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peering::{ControlMessage, ControlReader, COMMON_HEADER_SIZE};

	#[test]
	fn serialize_announce_info() {
		let info = AnnounceInfo {
			source_node_id: 0xff00aabbcc,
			namespace: TrackNamespace::new([
				Bytes::from_static(b"abc"),
				Bytes::from_static(b"12345"),
				Bytes::from_static(b"third tuple"),
				Bytes::from_static(b"now the final tuple"),
			]),
			name: Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7, 8]),
		};

		assert_eq!(info.size_bytes(), 66);

		let frame = info.serialize(false);
		assert_eq!(frame.len(), COMMON_HEADER_SIZE + 66);

		let mut reader = ControlReader::default();
		reader.push(&frame);
		assert_eq!(reader.next().unwrap(), Some(ControlMessage::AnnounceInfoAdvertised(info)));
	}

	#[test]
	fn truncated_tuple_rejected() {
		let info = AnnounceInfo {
			source_node_id: 1,
			namespace: TrackNamespace::new([Bytes::from_static(b"abcdef")]),
			name: Bytes::from_static(b"n"),
		};

		let mut buf = bytes::BytesMut::new();
		info.encode(&mut buf);

		let mut short = buf.freeze().slice(..12);
		assert_eq!(AnnounceInfo::decode(&mut short), Err(CodecError::ShortBuffer));
	}
}
