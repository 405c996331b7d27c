use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::coding::{CodecError, Decode, Encode};

use super::{
	AnnounceInfo, Connect, ConnectResponse, MsgType, NodeInfo, SnsWithdraw, SubscribeInfo, SubscribeNodeSet,
	COMMON_HEADER_SIZE, PROTOCOL_VERSION,
};

/// Header prefixed to every control message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommonHeader {
	pub version: u8,
	pub msg_type: MsgType,
	/// Length of the body, not including this header.
	pub data_length: u32,
}

impl Encode for CommonHeader {
	fn encode<W: BufMut>(&self, w: &mut W) {
		self.version.encode(w);
		u16::from(self.msg_type).encode(w);
		self.data_length.encode(w);
	}
}

impl Decode for CommonHeader {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		let version = u8::decode(r)?;
		let raw_type = u16::decode(r)?;
		let msg_type = MsgType::try_from(raw_type).map_err(|_| CodecError::UnknownType(raw_type))?;
		let data_length = u32::decode(r)?;

		Ok(Self {
			version,
			msg_type,
			data_length,
		})
	}
}

/// Serialize a message body under a common header; `size` is the body's
/// encoded size in bytes.
pub fn serialize(msg_type: MsgType, size: usize, body: impl FnOnce(&mut BytesMut)) -> Bytes {
	let mut buf = BytesMut::with_capacity(COMMON_HEADER_SIZE + size);

	CommonHeader {
		version: PROTOCOL_VERSION,
		msg_type,
		data_length: size as u32,
	}
	.encode(&mut buf);
	body(&mut buf);

	buf.freeze()
}

/// A decoded control-plane message.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
	Connect(Connect),
	ConnectResponse(ConnectResponse),
	NodeInfoAdvertise(NodeInfo),
	NodeInfoWithdrawn(NodeInfo),
	SubscribeInfoAdvertised(SubscribeInfo),
	SubscribeInfoWithdrawn(SubscribeInfo),
	AnnounceInfoAdvertised(AnnounceInfo),
	AnnounceInfoWithdrawn(AnnounceInfo),
	SnsAdvertised(SubscribeNodeSet),
	SnsWithdrawn(SnsWithdraw),
}

impl ControlMessage {
	/// Decode a body whose exact length came from the common header.
	pub fn decode_body<B: Buf>(msg_type: MsgType, r: &mut B) -> Result<Self, CodecError> {
		Ok(match msg_type {
			MsgType::Connect => Self::Connect(Connect::decode(r)?),
			MsgType::ConnectResponse => Self::ConnectResponse(ConnectResponse::decode(r)?),
			MsgType::NodeInfoAdvertise => Self::NodeInfoAdvertise(NodeInfo::decode(r)?),
			MsgType::NodeInfoWithdrawn => Self::NodeInfoWithdrawn(NodeInfo::decode(r)?),
			MsgType::SubscribeInfoAdvertised => Self::SubscribeInfoAdvertised(SubscribeInfo::decode(r)?),
			MsgType::SubscribeInfoWithdrawn => Self::SubscribeInfoWithdrawn(SubscribeInfo::decode(r)?),
			MsgType::AnnounceInfoAdvertised => Self::AnnounceInfoAdvertised(AnnounceInfo::decode(r)?),
			MsgType::AnnounceInfoWithdrawn => Self::AnnounceInfoWithdrawn(AnnounceInfo::decode(r)?),
			MsgType::SubscribeNodeSetAdvertised => Self::SnsAdvertised(SubscribeNodeSet::decode(r)?),
			MsgType::SubscribeNodeSetWithdrawn => Self::SnsWithdrawn(SnsWithdraw::decode(r)?),
			// Data objects never ride the control stream.
			MsgType::DataObject => return Err(CodecError::InvalidValue),
		})
	}
}

/// Reassembles framed control messages from stream chunks.
#[derive(Default)]
pub struct ControlReader {
	buffer: BytesMut,
}

impl ControlReader {
	pub fn push(&mut self, data: &[u8]) {
		self.buffer.extend_from_slice(data);
	}

	/// Pop the next complete message, or None until more bytes arrive.
	pub fn next(&mut self) -> Result<Option<ControlMessage>, CodecError> {
		if self.buffer.len() < COMMON_HEADER_SIZE {
			return Ok(None);
		}

		let header = {
			let mut cursor = &self.buffer[..];
			CommonHeader::decode(&mut cursor)?
		};

		let total = COMMON_HEADER_SIZE + header.data_length as usize;
		if self.buffer.len() < total {
			return Ok(None);
		}

		self.buffer.advance(COMMON_HEADER_SIZE);
		let mut body = self.buffer.split_to(header.data_length as usize).freeze();

		let msg = ControlMessage::decode_body(header.msg_type, &mut body)?;
		if !body.is_empty() {
			return Err(CodecError::ShortBuffer);
		}

		Ok(Some(msg))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peering::{NodeType, PeerMode, ProtocolError};

	#[test]
	fn control_reader_reassembles() {
		let connect = Connect {
			mode: PeerMode::Both,
			node_info: NodeInfo {
				id: 9,
				node_type: NodeType::Stub,
				contact: "relay:1".into(),
				..Default::default()
			},
		};
		let frame = connect.serialize();

		let mut reader = ControlReader::default();

		// Deliver byte by byte; nothing pops until the frame completes.
		for (i, byte) in frame.iter().enumerate() {
			reader.push(&[*byte]);
			let msg = reader.next().unwrap();
			if i + 1 < frame.len() {
				assert!(msg.is_none());
			} else {
				assert_eq!(msg, Some(ControlMessage::Connect(connect.clone())));
			}
		}
	}

	#[test]
	fn declared_length_exceeding_buffer_waits() {
		let mut reader = ControlReader::default();

		// Connect header declaring a 100-byte body with only 3 present.
		reader.push(&[1, 0, 1, 0, 0, 0, 100, 0xaa, 0xbb, 0xcc]);
		assert!(reader.next().unwrap().is_none());
	}

	#[test]
	fn unknown_type_rejected() {
		let mut reader = ControlReader::default();
		reader.push(&[1, 0xff, 0xff, 0, 0, 0, 0]);
		assert_eq!(reader.next(), Err(CodecError::UnknownType(0xffff)));
	}

	#[test]
	fn connect_response_error_body() {
		let resp = ConnectResponse {
			error: ProtocolError::ConnectError,
			node_info: None,
		};
		let frame = resp.serialize();
		assert_eq!(frame.len(), 9);

		let mut reader = ControlReader::default();
		reader.push(&frame);
		assert_eq!(reader.next().unwrap(), Some(ControlMessage::ConnectResponse(resp)));
	}
}
