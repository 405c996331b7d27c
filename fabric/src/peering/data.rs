use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::coding::{decode_remaining, CodecError, Decode, Encode, UintVar};

use super::SnsId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DataType {
	Datagram = 0,
	ExistingStream = 1,
	NewStream = 2,
}

/// Inline header carried by every data object. Unlike control messages
/// there is no common header; the first byte is the header length up to but
/// excluding the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
	pub data_type: DataType,
	pub sns_id: SnsId,
	pub track_fullname_hash: u64,

	/// Stream only; priority for a new stream.
	pub priority: u8,
	/// Stream only; time to live in millis.
	pub ttl: u32,
}

impl DataHeader {
	pub fn new(data_type: DataType, sns_id: SnsId, track_fullname_hash: u64) -> Self {
		Self {
			data_type,
			sns_id,
			track_fullname_hash,
			priority: 1,
			ttl: 2_000,
		}
	}

	/// Header bytes excluding the payload-length varint.
	pub fn size_bytes(&self) -> usize {
		match self.data_type {
			DataType::ExistingStream => 2,
			DataType::Datagram => 2 + 4 + 8,
			DataType::NewStream => 2 + 4 + 8 + 1 + 4,
		}
	}

	/// Everything after the header_len byte.
	fn encode_fields<W: BufMut>(&self, w: &mut W) {
		u8::from(self.data_type).encode(w);

		match self.data_type {
			DataType::ExistingStream => {}
			DataType::Datagram => {
				self.sns_id.encode(w);
				self.track_fullname_hash.encode(w);
			}
			DataType::NewStream => {
				self.sns_id.encode(w);
				self.track_fullname_hash.encode(w);
				self.priority.encode(w);
				self.ttl.encode(w);
			}
		}
	}

	/// Reads `header_len`, the type and the per-type fields; returns the
	/// declared header length alongside the header.
	fn decode_fields<B: Buf>(r: &mut B) -> Result<(usize, Self), CodecError> {
		let header_len = u8::decode(r)?;
		if header_len < 2 {
			return Err(CodecError::HeaderLenInvalid(header_len));
		}

		let raw_type = u8::decode(r)?;
		let data_type = DataType::try_from(raw_type).map_err(|_| CodecError::InvalidValue)?;

		let mut header = Self::new(data_type, 0, 0);
		match data_type {
			DataType::ExistingStream => {}
			DataType::Datagram => {
				header.sns_id = u32::decode(r)?;
				header.track_fullname_hash = u64::decode(r)?;
			}
			DataType::NewStream => {
				header.sns_id = u32::decode(r)?;
				header.track_fullname_hash = u64::decode(r)?;
				header.priority = u8::decode(r)?;
				header.ttl = u32::decode(r)?;
			}
		}

		Ok((header_len as usize, header))
	}

	/// Standalone header frame (no payload-length varint).
	pub fn serialize(&self) -> Bytes {
		let mut buf = BytesMut::with_capacity(self.size_bytes());
		(self.size_bytes() as u8).encode(&mut buf);
		self.encode_fields(&mut buf);
		buf.freeze()
	}
}

/// A complete data object: inline header plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataObject {
	pub header: DataHeader,
	pub payload: Bytes,
}

impl DataObject {
	pub fn new(header: DataHeader, payload: Bytes) -> Self {
		Self { header, payload }
	}

	pub fn serialize(&self) -> Bytes {
		let length = UintVar::new(self.payload.len() as u64);
		let header_len = self.header.size_bytes() + length.size();

		let mut buf = BytesMut::with_capacity(header_len + self.payload.len());
		(header_len as u8).encode(&mut buf);
		self.header.encode_fields(&mut buf);
		length.encode(&mut buf);
		buf.put_slice(&self.payload);
		buf.freeze()
	}
}

impl Decode for DataObject {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		decode_remaining(r, 1)?;
		let declared = r.chunk()[0] as usize;
		if declared > r.remaining() {
			return Err(CodecError::HeaderLenInvalid(declared as u8));
		}

		let (header_len, header) = DataHeader::decode_fields(r)?;
		let data_length = u64::from(UintVar::decode(r)?) as usize;

		if header_len != header.size_bytes() + UintVar::new(data_length as u64).size() {
			return Err(CodecError::HeaderLenInvalid(header_len as u8));
		}

		decode_remaining(r, data_length)?;
		let payload = r.copy_to_bytes(data_length);

		Ok(Self { header, payload })
	}
}

struct Pending {
	header: DataHeader,
	remaining: usize,
	data: BytesMut,
}

/// One step of reassembly: the raw bytes consumed (pipelined onward to
/// other peers), the header of the object they belong to, whether the
/// chunk starts with that header, and the completed object if one finished.
#[derive(Debug)]
pub struct AssemblerStep {
	pub forwarded: Bytes,
	pub header: DataHeader,
	/// The chunk begins with the object's inline header.
	pub has_header: bool,
	pub new_stream: bool,
	pub completed: Option<DataObject>,
}

/// Per-stream reassembly of a repeating sequence of data objects.
///
/// A NewStream object is remembered as the anchor for the stream;
/// subsequent ExistingStream objects inherit its sns_id, priority, ttl and
/// track hash. An ExistingStream before any anchor is an error.
#[derive(Default)]
pub struct StreamAssembler {
	buffer: BytesMut,
	pending: Option<Pending>,
	anchor: Option<DataHeader>,
}

impl StreamAssembler {
	pub fn push(&mut self, data: &[u8]) {
		self.buffer.extend_from_slice(data);
	}

	/// Consume as much buffered data as possible; None when more bytes are
	/// needed. Call repeatedly until it returns None.
	pub fn step(&mut self) -> Result<Option<AssemblerStep>, CodecError> {
		if self.buffer.is_empty() {
			return Ok(None);
		}

		// Continue a partially received object.
		if let Some(mut pending) = self.pending.take() {
			let take = pending.remaining.min(self.buffer.len());
			let chunk = self.buffer.split_to(take).freeze();
			pending.data.extend_from_slice(&chunk);
			pending.remaining -= take;

			let header = pending.header;
			let completed = match pending.remaining {
				0 => Some(DataObject::new(pending.header, pending.data.freeze())),
				_ => {
					self.pending = Some(pending);
					None
				}
			};

			return Ok(Some(AssemblerStep {
				forwarded: chunk,
				header,
				has_header: false,
				new_stream: false,
				completed,
			}));
		}

		// Peek the declared header length; wait until it is buffered.
		let header_len = self.buffer[0] as usize;
		if header_len < 2 {
			return Err(CodecError::HeaderLenInvalid(header_len as u8));
		}
		if self.buffer.len() < header_len {
			return Ok(None);
		}

		let (declared, mut header, data_length) = {
			let mut cursor = &self.buffer[..header_len];
			let (declared, header) = DataHeader::decode_fields(&mut cursor)?;
			let data_length = u64::from(UintVar::decode(&mut cursor)?) as usize;
			if cursor.has_remaining() {
				return Err(CodecError::HeaderLenInvalid(declared as u8));
			}
			(declared, header, data_length)
		};
		debug_assert_eq!(declared, header_len);

		let new_stream = header.data_type == DataType::NewStream;
		match header.data_type {
			DataType::NewStream => self.anchor = Some(header),
			DataType::ExistingStream => {
				// Inherit the stream anchor.
				let anchor = self.anchor.as_ref().ok_or(CodecError::InvalidValue)?;
				header.sns_id = anchor.sns_id;
				header.track_fullname_hash = anchor.track_fullname_hash;
				header.priority = anchor.priority;
				header.ttl = anchor.ttl;
			}
			DataType::Datagram => {}
		}

		if data_length >= 2_000_000 {
			tracing::warn!(size = %data_length, "very large data object");
		}

		let take = data_length.min(self.buffer.len() - header_len);
		let consumed = self.buffer.split_to(header_len + take).freeze();
		let payload = consumed.slice(header_len..);

		let completed = match take == data_length {
			true => Some(DataObject::new(header, payload)),
			false => {
				self.pending = Some(Pending {
					header,
					remaining: data_length - take,
					data: BytesMut::from(&payload[..]),
				});
				None
			}
		};

		Ok(Some(AssemblerStep {
			forwarded: consumed,
			header,
			has_header: true,
			new_stream,
			completed,
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_sizes() {
		let datagram = DataHeader::new(DataType::Datagram, 0x1234, 0xabcdef);
		assert_eq!(datagram.serialize().len(), 14);

		let new_stream = DataHeader::new(DataType::NewStream, 0x1234, 0xabcdef);
		assert_eq!(new_stream.serialize().len(), 19);

		let existing = DataHeader::new(DataType::ExistingStream, 0, 0);
		assert_eq!(existing.serialize().len(), 2);
	}

	#[test]
	fn datagram_round_trip() {
		let object = DataObject::new(
			DataHeader::new(DataType::Datagram, 7, 0x55aa),
			Bytes::from_static(b"payload bytes"),
		);

		let frame = object.serialize();
		let decoded = DataObject::decode(&mut frame.clone()).unwrap();
		assert_eq!(decoded, object);
	}

	#[test]
	fn datagram_header_exceeding_buffer() {
		let object = DataObject::new(DataHeader::new(DataType::Datagram, 7, 8), Bytes::new());
		let frame = object.serialize();

		let mut truncated = frame.slice(..5);
		assert!(matches!(
			DataObject::decode(&mut truncated),
			Err(CodecError::HeaderLenInvalid(_))
		));
	}

	#[test]
	fn assembler_reassembles_split_objects() {
		let mut first = DataObject::new(
			DataHeader::new(DataType::NewStream, 9, 0x77),
			Bytes::from_static(b"first object payload"),
		);
		first.header.priority = 3;
		first.header.ttl = 1500;

		let second = DataObject::new(
			DataHeader::new(DataType::ExistingStream, 0, 0),
			Bytes::from_static(b"second"),
		);

		let mut wire = BytesMut::new();
		wire.extend_from_slice(&first.serialize());
		wire.extend_from_slice(&second.serialize());
		let wire = wire.freeze();

		let mut assembler = StreamAssembler::default();
		let mut completed = Vec::new();
		let mut forwarded = 0;

		// Feed in 3-byte chunks to exercise partial headers and payloads.
		for chunk in wire.chunks(3) {
			assembler.push(chunk);
			while let Some(step) = assembler.step().unwrap() {
				forwarded += step.forwarded.len();
				if let Some(object) = step.completed {
					completed.push(object);
				}
			}
		}

		// Every byte fed was pipelined onward.
		assert_eq!(forwarded, wire.len());

		assert_eq!(completed.len(), 2);
		assert_eq!(completed[0], first);

		// The second object inherited the anchor's identity.
		assert_eq!(completed[1].header.sns_id, 9);
		assert_eq!(completed[1].header.track_fullname_hash, 0x77);
		assert_eq!(completed[1].header.priority, 3);
		assert_eq!(completed[1].header.ttl, 1500);
		assert_eq!(completed[1].payload, Bytes::from_static(b"second"));
	}

	#[test]
	fn existing_stream_without_anchor_errors() {
		let object = DataObject::new(DataHeader::new(DataType::ExistingStream, 0, 0), Bytes::from_static(b"x"));

		let mut assembler = StreamAssembler::default();
		assembler.push(&object.serialize());
		assert_eq!(assembler.step().unwrap_err(), CodecError::InvalidValue);
	}

	#[test]
	fn zero_header_len_rejected() {
		let mut assembler = StreamAssembler::default();
		assembler.push(&[0, 1, 2]);
		assert!(matches!(assembler.step(), Err(CodecError::HeaderLenInvalid(0))));
	}
}
