//! In-memory transport fabric.
//!
//! Connects relay instances inside one process: the integration tests peer
//! relays through it, and the binary uses it when no QUIC binding is wired
//! in. Each endpoint delivers callbacks from a dedicated thread so the
//! per-connection serialization contract of [super::TransportEvents] holds
//! and no callback re-enters the caller's locks.

use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc, Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{ConnId, DataCtxId, EnqueueFlags, Transport, TransportEvents, TransportStatus};

/// Shared hub that endpoints register with, keyed by listening port.
pub struct MemFabric {
	endpoints: Mutex<HashMap<u16, Weak<Endpoint>>>,
	next_conn: Mutex<ConnId>,
}

impl MemFabric {
	#[allow(clippy::new_without_default)]
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			endpoints: Mutex::new(HashMap::new()),
			next_conn: Mutex::new(1),
		})
	}

	fn alloc_conn(&self) -> ConnId {
		let mut next = self.next_conn.lock();
		let id = *next;
		*next += 1;
		id
	}

	fn endpoint(&self, port: u16) -> Option<Arc<Endpoint>> {
		self.endpoints.lock().get(&port).and_then(Weak::upgrade)
	}
}

enum Delivery {
	NewConnection { conn: ConnId, remote: String },
	Status { conn: ConnId, status: TransportStatus },
	Metrics { conn: ConnId, srtt_us: u64 },
	Stream {
		conn: ConnId,
		stream_id: u64,
		data_ctx: Option<DataCtxId>,
		is_bidir: bool,
		data: Bytes,
	},
	Dgram { conn: ConnId },
}

struct ConnState {
	peer: Weak<Endpoint>,
	peer_conn: ConnId,
	/// Next stream id for locally-originated streams on this connection.
	next_stream: u64,
	/// Open stream per data context; replaced when `new_stream` is set.
	ctx_streams: HashMap<DataCtxId, u64>,
	next_ctx: DataCtxId,
	dgrams: VecDeque<Bytes>,
}

struct Endpoint {
	fabric: Arc<MemFabric>,
	port: u16,
	srtt_us: u64,
	events: OnceLock<Arc<dyn TransportEvents>>,
	conns: Mutex<HashMap<ConnId, ConnState>>,
	tx: mpsc::Sender<Delivery>,
}

/// The control stream is the first data context created on a connection;
/// both sides allocate ids from 1 so it matches without negotiation.
const CONTROL_CTX: DataCtxId = 1;

impl Endpoint {
	fn deliver(&self, delivery: Delivery) {
		// The receiver only disappears at shutdown; drops are fine then.
		let _ = self.tx.send(delivery);
	}

	fn run(self: Arc<Self>, rx: mpsc::Receiver<Delivery>) {
		while let Ok(delivery) = rx.recv() {
			// Bind happens right after construction; wait it out once.
			let events = loop {
				match self.events.get() {
					Some(events) => break events.clone(),
					None => std::thread::sleep(Duration::from_millis(1)),
				}
			};

			match delivery {
				Delivery::NewConnection { conn, remote } => events.on_new_connection(conn, &remote),
				Delivery::Status { conn, status } => events.on_connection_status(conn, status),
				Delivery::Metrics { conn, srtt_us } => events.on_connection_metrics(conn, srtt_us),
				Delivery::Stream {
					conn,
					stream_id,
					data_ctx,
					is_bidir,
					data,
				} => events.on_recv_stream(conn, stream_id, data_ctx, is_bidir, data),
				Delivery::Dgram { conn } => events.on_recv_dgram(conn, None),
			}
		}
	}
}

/// One relay's view of the in-memory fabric.
pub struct MemTransport {
	endpoint: Arc<Endpoint>,
}

impl MemTransport {
	pub fn new(fabric: Arc<MemFabric>, port: u16) -> Self {
		Self::with_srtt(fabric, port, 5_000)
	}

	/// `srtt_us` is reported for every connection this endpoint accepts or
	/// opens, letting tests shape path selection.
	pub fn with_srtt(fabric: Arc<MemFabric>, port: u16, srtt_us: u64) -> Self {
		let (tx, rx) = mpsc::channel();

		let endpoint = Arc::new(Endpoint {
			fabric: fabric.clone(),
			port,
			srtt_us,
			events: OnceLock::new(),
			conns: Mutex::new(HashMap::new()),
			tx,
		});

		fabric.endpoints.lock().insert(port, Arc::downgrade(&endpoint));

		let runner = endpoint.clone();
		std::thread::Builder::new()
			.name(format!("mem-transport-{port}"))
			.spawn(move || runner.run(rx))
			.ok();

		Self { endpoint }
	}

	/// Install the event sink; must happen before any traffic flows.
	pub fn bind(&self, events: Arc<dyn TransportEvents>) {
		let _ = self.endpoint.events.set(events);
	}

	fn peer_of(&self, conn: ConnId) -> Option<(Arc<Endpoint>, ConnId)> {
		let conns = self.endpoint.conns.lock();
		let state = conns.get(&conn)?;
		let peer = state.peer.upgrade()?;
		Some((peer, state.peer_conn))
	}
}

fn new_conn_state(peer: &Arc<Endpoint>, peer_conn: ConnId) -> ConnState {
	ConnState {
		peer: Arc::downgrade(peer),
		peer_conn,
		next_stream: 1,
		ctx_streams: HashMap::new(),
		next_ctx: 1,
		dgrams: VecDeque::new(),
	}
}

impl Transport for MemTransport {
	fn connect(&self, host: &str, port: u16) -> ConnId {
		let local_conn = self.endpoint.fabric.alloc_conn();

		let remote = match self.endpoint.fabric.endpoint(port) {
			Some(remote) => remote,
			None => {
				tracing::debug!(%host, %port, "no endpoint listening");
				self.endpoint.deliver(Delivery::Status {
					conn: local_conn,
					status: TransportStatus::Disconnected,
				});
				return local_conn;
			}
		};

		let remote_conn = self.endpoint.fabric.alloc_conn();

		self.endpoint
			.conns
			.lock()
			.insert(local_conn, new_conn_state(&remote, remote_conn));
		remote
			.conns
			.lock()
			.insert(remote_conn, new_conn_state(&self.endpoint, local_conn));

		remote.deliver(Delivery::NewConnection {
			conn: remote_conn,
			remote: format!("mem:{}", self.endpoint.port),
		});
		remote.deliver(Delivery::Metrics {
			conn: remote_conn,
			srtt_us: remote.srtt_us,
		});

		self.endpoint.deliver(Delivery::Status {
			conn: local_conn,
			status: TransportStatus::Ready,
		});
		self.endpoint.deliver(Delivery::Metrics {
			conn: local_conn,
			srtt_us: self.endpoint.srtt_us,
		});

		local_conn
	}

	fn close(&self, conn: ConnId) {
		let peer = self.peer_of(conn);
		self.endpoint.conns.lock().remove(&conn);
		self.endpoint.deliver(Delivery::Status {
			conn,
			status: TransportStatus::Disconnected,
		});

		if let Some((peer, peer_conn)) = peer {
			peer.conns.lock().remove(&peer_conn);
			peer.deliver(Delivery::Status {
				conn: peer_conn,
				status: TransportStatus::RemoteRequestClose,
			});
		}
	}

	fn status(&self) -> TransportStatus {
		TransportStatus::Ready
	}

	fn create_data_context(&self, conn: ConnId, _use_reliable: bool, _priority: u8, _use_reset: bool) -> DataCtxId {
		let mut conns = self.endpoint.conns.lock();
		match conns.get_mut(&conn) {
			Some(state) => {
				let id = state.next_ctx;
				state.next_ctx += 1;
				id
			}
			None => 0,
		}
	}

	fn delete_data_context(&self, conn: ConnId, data_ctx: DataCtxId) {
		if let Some(state) = self.endpoint.conns.lock().get_mut(&conn) {
			state.ctx_streams.remove(&data_ctx);
		}
	}

	fn enqueue(&self, conn: ConnId, data_ctx: DataCtxId, data: Bytes, _priority: u8, _ttl_ms: u32, flags: EnqueueFlags) {
		enum Path {
			Dgram(Arc<Endpoint>, ConnId),
			Stream(Arc<Endpoint>, ConnId, u64),
		}

		let path = {
			let mut conns = self.endpoint.conns.lock();
			let state = match conns.get_mut(&conn) {
				Some(state) => state,
				None => {
					tracing::trace!(%conn, "enqueue on closed connection");
					return;
				}
			};

			let peer = match state.peer.upgrade() {
				Some(peer) => peer,
				None => return,
			};

			if !flags.use_reliable && data_ctx != CONTROL_CTX {
				Path::Dgram(peer, state.peer_conn)
			} else {
				let stream_id = match state.ctx_streams.get(&data_ctx) {
					Some(id) if !flags.new_stream => *id,
					_ => {
						state.next_stream += 1;
						let id = state.next_stream;
						state.ctx_streams.insert(data_ctx, id);
						id
					}
				};

				Path::Stream(peer, state.peer_conn, stream_id)
			}
		};

		match path {
			Path::Dgram(peer, peer_conn) => {
				if let Some(remote_state) = peer.conns.lock().get_mut(&peer_conn) {
					remote_state.dgrams.push_back(data);
				}
				peer.deliver(Delivery::Dgram { conn: peer_conn });
			}
			Path::Stream(peer, peer_conn, stream_id) => {
				let is_bidir = data_ctx == CONTROL_CTX;
				peer.deliver(Delivery::Stream {
					conn: peer_conn,
					stream_id,
					// The remote's control context has the same well-known id.
					data_ctx: is_bidir.then_some(CONTROL_CTX),
					is_bidir,
					data,
				});
			}
		}
	}

	fn dequeue(&self, conn: ConnId, _data_ctx: Option<DataCtxId>) -> Option<Bytes> {
		self.endpoint.conns.lock().get_mut(&conn)?.dgrams.pop_front()
	}
}
