//! The seam between the relay core and the client-facing MoQ session layer.
//!
//! The session layer owns the QUIC connections to publishers and
//! subscribers, parses SUBSCRIBE/ANNOUNCE/OBJECT frames, and surfaces them
//! through [MoqServer]. The core answers through [SessionApi] and the
//! track handler traits.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::coding::{CodecError, Decode, Encode, UintVar};
use crate::track::{FullTrackName, TrackNamespace};

/// Opaque identifier for a client connection, supplied by the transport.
///
/// May be reused after close; never treat it as unique over time.
pub type ConnectionHandle = u64;

/// Identifier of a subscribe within a connection.
pub type SubscribeId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TrackMode {
	Datagram = 0,
	#[default]
	Stream = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FilterType {
	LatestGroup = 0x1,
	LargestObject = 0x2,
	AbsoluteStart = 0x3,
	AbsoluteRange = 0x4,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum GroupOrder {
	#[default]
	Publisher = 0x0,
	Ascending = 0x1,
	Descending = 0x2,
}

/// Headers attached to every published object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectHeaders {
	pub group_id: u64,
	pub object_id: u64,
	pub priority: u8,
	pub ttl_ms: Option<u32>,
	pub track_mode: TrackMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
	Connecting,
	Connected,
	NotConnected,
	ClosedByRemote,
	IdleTimeout,
}

impl ConnectionStatus {
	pub fn is_connected(&self) -> bool {
		matches!(self, Self::Connecting | Self::Connected)
	}
}

#[derive(Clone, Debug, Default)]
pub struct ClientSetupAttributes {
	pub endpoint_id: String,
}

#[derive(Clone, Debug, Default)]
pub struct ClientSetupResponse {
	pub endpoint_id: String,
}

#[derive(Clone, Debug, Default)]
pub struct AnnounceAttributes {}

#[derive(Clone, Copy, Debug)]
pub struct SubscribeAttributes {
	pub priority: u8,
	pub group_order: GroupOrder,
}

#[derive(Clone, Copy, Debug)]
pub struct FetchAttributes {
	pub priority: u8,
	pub group_order: GroupOrder,
	pub start_group: u64,
	pub end_group: u64,
	pub start_object: u64,
	/// Zero means every object within the end group.
	pub end_object: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceReasonCode {
	Ok,
	NotAuthorized,
}

#[derive(Clone, Debug)]
pub struct AnnounceResponse {
	pub reason_code: AnnounceReasonCode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeReasonCode {
	Ok,
	RetryTrackAlias,
	TrackNotFound,
}

#[derive(Clone, Debug)]
pub struct SubscribeResponse {
	pub reason_code: SubscribeReasonCode,
	pub reason: Option<String>,
	pub track_alias: Option<u64>,
	/// Largest (group, object) available from the cache, if any.
	pub largest: Option<(u64, u64)>,
}

impl SubscribeResponse {
	pub fn ok(largest: Option<(u64, u64)>) -> Self {
		Self {
			reason_code: SubscribeReasonCode::Ok,
			reason: None,
			track_alias: None,
			largest,
		}
	}

	pub fn retry_track_alias(alias: u64) -> Self {
		Self {
			reason_code: SubscribeReasonCode::RetryTrackAlias,
			reason: Some(format!("use track alias: {alias}")),
			track_alias: Some(alias),
			largest: None,
		}
	}
}

/// Per-connection metrics sampled by the session layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionMetrics {
	pub rtt_us: u64,
	pub srtt_us: u64,
	pub tx_rate_bps: u64,
	pub tx_lost_pkts: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeStatus {
	Ok,
	NotConnected,
	Error,
	Ended,
}

/// Publish path toward one subscriber (or fetch) on a client connection.
///
/// Provided by the session layer when the core binds a track; shared by
/// reference between the core state and the session, the last holder drop
/// tears it down.
pub trait PublishTrack: Send + Sync {
	fn publish_object(&self, headers: &ObjectHeaders, payload: Bytes);
}

/// Pull path from one publisher; implemented by the core.
///
/// The session layer calls `object_received` for every object the publisher
/// produces on the subscribed track.
pub trait SubscribeTrack: Send + Sync {
	fn full_track_name(&self) -> FullTrackName;
	fn priority(&self) -> u8;
	fn group_order(&self) -> GroupOrder;
	fn object_received(&self, headers: &ObjectHeaders, payload: &Bytes);
	fn status_changed(&self, status: SubscribeStatus);
}

/// Operations the core invokes on the MoQ session layer.
pub trait SessionApi: Send + Sync {
	/// Resolve a pending announce, also naming the prefix-subscribed
	/// connections that must be notified of it.
	fn resolve_announce(
		&self,
		conn: ConnectionHandle,
		namespace: &TrackNamespace,
		notify: &[ConnectionHandle],
		response: AnnounceResponse,
	);

	fn resolve_subscribe(&self, conn: ConnectionHandle, subscribe_id: SubscribeId, response: SubscribeResponse);

	/// Issue a subscribe toward a publisher connection.
	fn subscribe_track(&self, conn: ConnectionHandle, handler: Arc<dyn SubscribeTrack>);

	fn unsubscribe_track(&self, conn: ConnectionHandle, handler: Arc<dyn SubscribeTrack>);

	fn update_track_subscription(&self, conn: ConnectionHandle, handler: Arc<dyn SubscribeTrack>);

	/// Bind the publish path toward a subscriber; returns the sink to feed.
	fn bind_publisher_track(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		ftn: &FullTrackName,
		headers: &ObjectHeaders,
	) -> Arc<dyn PublishTrack>;

	fn unbind_publisher_track(&self, conn: ConnectionHandle, track: Arc<dyn PublishTrack>);

	/// Bind the publish path serving a fetch; returns the sink to feed.
	fn bind_fetch_track(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		ftn: &FullTrackName,
		attrs: &FetchAttributes,
	) -> Arc<dyn PublishTrack>;

	fn unbind_fetch_track(&self, conn: ConnectionHandle, track: Arc<dyn PublishTrack>);
}

/// Callbacks the session layer delivers to the core.
///
/// All of them must be non-blocking and bounded; the session layer invokes
/// them from its own I/O threads.
pub trait MoqServer: Send + Sync {
	fn new_connection_accepted(&self, conn: ConnectionHandle, remote: &str);
	fn connection_status_changed(&self, conn: ConnectionHandle, status: ConnectionStatus);
	fn client_setup_received(&self, conn: ConnectionHandle, attrs: &ClientSetupAttributes) -> ClientSetupResponse;
	fn announce_received(&self, conn: ConnectionHandle, namespace: &TrackNamespace, attrs: &AnnounceAttributes);

	/// Returns the prefix-subscribed connections to notify of the removal.
	fn unannounce_received(&self, conn: ConnectionHandle, namespace: &TrackNamespace) -> Vec<ConnectionHandle>;

	/// Returns the currently announced namespaces under the prefix.
	fn subscribe_announces_received(&self, conn: ConnectionHandle, prefix: &TrackNamespace) -> Vec<TrackNamespace>;
	fn unsubscribe_announces_received(&self, conn: ConnectionHandle, prefix: &TrackNamespace);

	#[allow(clippy::too_many_arguments)]
	fn subscribe_received(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		proposed_track_alias: u64,
		filter_type: FilterType,
		ftn: &FullTrackName,
		attrs: &SubscribeAttributes,
	);
	fn unsubscribe_received(&self, conn: ConnectionHandle, subscribe_id: SubscribeId);

	/// Returns false when the fetch range cannot be served.
	fn fetch_ok(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		ftn: &FullTrackName,
		attrs: &FetchAttributes,
	) -> bool;
	fn fetch_cancel_received(&self, conn: ConnectionHandle, subscribe_id: SubscribeId);

	fn metrics_sampled(&self, conn: ConnectionHandle, metrics: &ConnectionMetrics);
}

/// A self-contained object as carried in a peer DataObject payload.
///
/// The receiving relay republishes it into its own clients, so the headers
/// ride along with the payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
	pub headers: ObjectHeaders,
	pub payload: Bytes,
}

impl Encode for ObjectRecord {
	fn encode<W: BufMut>(&self, w: &mut W) {
		u8::from(self.headers.track_mode).encode(w);
		self.headers.priority.encode(w);
		self.headers.ttl_ms.unwrap_or(0).encode(w);
		UintVar::new(self.headers.group_id).encode(w);
		UintVar::new(self.headers.object_id).encode(w);
		w.put_slice(&self.payload);
	}
}

impl Decode for ObjectRecord {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		let track_mode = TrackMode::try_from(u8::decode(r)?).map_err(|_| CodecError::InvalidValue)?;
		let priority = u8::decode(r)?;
		let ttl = u32::decode(r)?;
		let group_id = UintVar::decode(r)?.into();
		let object_id = UintVar::decode(r)?.into();
		let payload = r.copy_to_bytes(r.remaining());

		Ok(Self {
			headers: ObjectHeaders {
				group_id,
				object_id,
				priority,
				ttl_ms: (ttl > 0).then_some(ttl),
				track_mode,
			},
			payload,
		})
	}
}

/// The subscribe a relay replays toward publishers on behalf of a remote
/// subscriber, carried opaquely inside a peer SubscribeInfo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeRecord {
	pub ftn: FullTrackName,
	pub priority: u8,
	pub group_order: GroupOrder,
	pub filter_type: FilterType,
}

impl Encode for SubscribeRecord {
	fn encode<W: BufMut>(&self, w: &mut W) {
		let tuples = self.ftn.namespace.tuples();
		(tuples.len() as u8).encode(w);
		for tuple in tuples {
			(tuple.len() as u16).encode(w);
			w.put_slice(tuple);
		}

		(self.ftn.name.len() as u16).encode(w);
		w.put_slice(&self.ftn.name);

		self.priority.encode(w);
		u8::from(self.group_order).encode(w);
		u8::from(self.filter_type).encode(w);
	}
}

impl Decode for SubscribeRecord {
	fn decode<B: Buf>(r: &mut B) -> Result<Self, CodecError> {
		let count = u8::decode(r)?;
		let mut tuples = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let len = u16::decode(r)? as usize;
			crate::coding::decode_remaining(r, len)?;
			tuples.push(r.copy_to_bytes(len));
		}

		let len = u16::decode(r)? as usize;
		crate::coding::decode_remaining(r, len)?;
		let name = r.copy_to_bytes(len);

		let priority = u8::decode(r)?;
		let group_order = GroupOrder::try_from(u8::decode(r)?).map_err(|_| CodecError::InvalidValue)?;
		let filter_type = FilterType::try_from(u8::decode(r)?).map_err(|_| CodecError::InvalidValue)?;

		Ok(Self {
			ftn: FullTrackName::new(TrackNamespace::new(tuples), name),
			priority,
			group_order,
			filter_type,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::BytesMut;

	#[test]
	fn object_record_round_trip() {
		let record = ObjectRecord {
			headers: ObjectHeaders {
				group_id: 12,
				object_id: 70,
				priority: 3,
				ttl_ms: Some(2000),
				track_mode: TrackMode::Stream,
			},
			payload: Bytes::from_static(b"hello"),
		};

		let mut buf = BytesMut::new();
		record.encode(&mut buf);

		let decoded = ObjectRecord::decode(&mut buf.freeze()).unwrap();
		assert_eq!(decoded, record);
	}

	#[test]
	fn subscribe_record_round_trip() {
		let record = SubscribeRecord {
			ftn: FullTrackName::new(
				TrackNamespace::new([Bytes::from_static(b"a"), Bytes::from_static(b"b")]),
				"video",
			),
			priority: 1,
			group_order: GroupOrder::Descending,
			filter_type: FilterType::LatestGroup,
		};

		let mut buf = BytesMut::new();
		record.encode(&mut buf);

		let decoded = SubscribeRecord::decode(&mut buf.freeze()).unwrap();
		assert_eq!(decoded, record);
	}
}
