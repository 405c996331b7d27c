use bytes::{Buf, BufMut, Bytes};

use crate::coding::{CodecError, Decode, Encode};

use super::{serialize, MsgType, NodeInfo, PeerMode, ProtocolError};

/// Sent by the initiating side of a peering session once the transport is
/// ready.
#[derive(Clone, Debug, PartialEq)]
pub struct Connect {
	pub mode: PeerMode,
	pub node_info: NodeInfo,
}

impl Connect {
	pub fn size_bytes(&self) -> usize {
		1 + self.node_info.size_bytes()
	}

	pub fn serialize(&self) -> Bytes {
		serialize(MsgType::Connect, self.size_bytes(), |w| self.encode(w))
	}
}

impl Encode for Connect {
	fn encode<W: BufMut>(&self, w: &mut W) {
		u8::from(self.mode).encode(w);
		self.node_info.encode(w);
	}
}

impl Decode for Connect {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		let raw_mode = u8::decode(r)?;
		let mode = PeerMode::try_from(raw_mode).map_err(|_| CodecError::UnknownMode(raw_mode))?;
		let node_info = NodeInfo::decode(r)?;

		Ok(Self { mode, node_info })
	}
}

/// Answer to a [Connect]; carries the responder's node info unless it
/// refused the session.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectResponse {
	pub error: ProtocolError,
	/// Present iff `error` is [ProtocolError::NoError].
	pub node_info: Option<NodeInfo>,
}

impl ConnectResponse {
	pub fn ok(node_info: NodeInfo) -> Self {
		Self {
			error: ProtocolError::NoError,
			node_info: Some(node_info),
		}
	}

	pub fn size_bytes(&self) -> usize {
		match &self.node_info {
			Some(info) if self.error == ProtocolError::NoError => 2 + info.size_bytes(),
			_ => 2,
		}
	}

	pub fn serialize(&self) -> Bytes {
		serialize(MsgType::ConnectResponse, self.size_bytes(), |w| self.encode(w))
	}
}

impl Encode for ConnectResponse {
	fn encode<W: BufMut>(&self, w: &mut W) {
		u16::from(self.error).encode(w);

		if self.error == ProtocolError::NoError {
			if let Some(info) = &self.node_info {
				info.encode(w);
			}
		}
	}
}

impl Decode for ConnectResponse {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		let error = ProtocolError::try_from(u16::decode(r)?).map_err(|_| CodecError::InvalidValue)?;

		let node_info = match error {
			ProtocolError::NoError => Some(NodeInfo::decode(r)?),
			_ => None,
		};

		Ok(Self { error, node_info })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peering::{NodeId, NodePathItem, NodeType, ControlMessage, ControlReader};
	use std::str::FromStr;

	fn node_id(s: &str) -> u64 {
		NodeId::from_str(s).unwrap().into()
	}

	#[test]
	fn serialize_connect() {
		let connect = Connect {
			mode: PeerMode::Both,
			node_info: NodeInfo {
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
			},
		};

		let frame = connect.serialize();
		assert_eq!(frame.len(), 80);

		let mut reader = ControlReader::default();
		reader.push(&frame);
		assert_eq!(reader.next().unwrap(), Some(ControlMessage::Connect(connect)));
	}

	#[test]
	fn serialize_connect_response() {
		let resp = ConnectResponse::ok(NodeInfo {
			id: node_id("50:60"),
			node_type: NodeType::Edge,
			contact: "relay.m10x.org:33435".into(),
			longitude: -122.5327100,
			latitude: 47.6482900,
			path: vec![NodePathItem {
				id: node_id("1:99"),
				srtt_us: 54321,
			}],
		});

		let frame = resp.serialize();
		assert_eq!(frame.len(), 71);

		let mut reader = ControlReader::default();
		reader.push(&frame);
		assert_eq!(reader.next().unwrap(), Some(ControlMessage::ConnectResponse(resp)));
	}

	#[test]
	fn serialize_connect_response_error() {
		let resp = ConnectResponse {
			error: ProtocolError::ConnectError,
			node_info: None,
		};

		let frame = resp.serialize();
		assert_eq!(frame.len(), 9);

		let decoded = ConnectResponse::decode(&mut frame.slice(super::super::COMMON_HEADER_SIZE..)).unwrap();
		assert_eq!(decoded.error, ProtocolError::ConnectError);
		assert!(decoded.node_info.is_none());
	}

	#[test]
	fn unknown_mode_rejected() {
		let connect = Connect {
			mode: PeerMode::Ibp,
			node_info: NodeInfo::default(),
		};
		let frame = connect.serialize();

		// Corrupt the mode byte just past the common header.
		let mut bytes = frame.to_vec();
		bytes[super::super::COMMON_HEADER_SIZE] = 9;

		let mut body = Bytes::from(bytes).slice(super::super::COMMON_HEADER_SIZE..);
		assert_eq!(Connect::decode(&mut body), Err(CodecError::UnknownMode(9)));
	}
}
