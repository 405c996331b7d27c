//! The seam between the relay core and the QUIC transport.
//!
//! The transport owns sockets, streams and the time-ordered send queue; the
//! core consumes [Transport] and implements [TransportEvents]. Connection
//! and stream callbacks arrive on the transport's I/O threads and are
//! serialized per connection.

mod mem;

pub use mem::*;

use bytes::Bytes;

/// Transport connection id; reused as the peer session id.
pub type ConnId = u64;

/// Identifier of one data context (stream pair) on a connection.
pub type DataCtxId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
	Connecting,
	Ready,
	Disconnected,
	RemoteRequestClose,
	Shutdown,
	IdleTimeout,
}

impl TransportStatus {
	pub fn is_disconnected(&self) -> bool {
		!matches!(self, Self::Connecting | Self::Ready)
	}
}

/// Flags honored by [Transport::enqueue].
///
/// `new_stream` opens a fresh stream for the bytes; combined with
/// `clear_tx_queue` and `use_reset` it supersedes anything still queued for
/// the data context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnqueueFlags {
	pub use_reliable: bool,
	pub new_stream: bool,
	pub clear_tx_queue: bool,
	pub use_reset: bool,
}

impl EnqueueFlags {
	pub const DATAGRAM: Self = Self {
		use_reliable: false,
		new_stream: false,
		clear_tx_queue: false,
		use_reset: false,
	};
}

/// Operations the core invokes on the transport. All are non-blocking;
/// `enqueue` accepts bytes into an internal time-ordered queue which may
/// drop items whose TTL elapses.
pub trait Transport: Send + Sync {
	/// Open an outbound connection; progress arrives via
	/// [TransportEvents::on_connection_status].
	fn connect(&self, host: &str, port: u16) -> ConnId;

	fn close(&self, conn: ConnId);

	/// Readiness of the listening side.
	fn status(&self) -> TransportStatus;

	fn create_data_context(&self, conn: ConnId, use_reliable: bool, priority: u8, use_reset: bool) -> DataCtxId;

	fn delete_data_context(&self, conn: ConnId, data_ctx: DataCtxId);

	fn enqueue(
		&self,
		conn: ConnId,
		data_ctx: DataCtxId,
		data: Bytes,
		priority: u8,
		ttl_ms: u32,
		flags: EnqueueFlags,
	);

	/// Pop the next pending datagram for the connection.
	fn dequeue(&self, conn: ConnId, data_ctx: Option<DataCtxId>) -> Option<Bytes>;
}

/// Callbacks the transport delivers to the core.
pub trait TransportEvents: Send + Sync {
	fn on_new_connection(&self, conn: ConnId, remote: &str);
	fn on_connection_status(&self, conn: ConnId, status: TransportStatus);

	/// Bytes arrived on a stream. `data_ctx` is set for streams the local
	/// side bound to a data context (the bidirectional control stream).
	fn on_recv_stream(&self, conn: ConnId, stream_id: u64, data_ctx: Option<DataCtxId>, is_bidir: bool, data: Bytes);

	/// One or more datagrams are pending; drain via [Transport::dequeue].
	fn on_recv_dgram(&self, conn: ConnId, data_ctx: Option<DataCtxId>);

	fn on_connection_metrics(&self, conn: ConnId, srtt_us: u64);
}
