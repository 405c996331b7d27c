use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::coding::{CodecError, Decode};
use crate::session::{ObjectHeaders, TrackMode};
use crate::track::TrackAlias;
use crate::transport::{DataCtxId, EnqueueFlags, Transport, TransportStatus};

use super::{
	AnnounceInfo, Connect, ConnectResponse, ControlMessage, ControlReader, DataHeader, DataObject, DataType,
	NodeInfo, PeerManager, PeerMode, PeerSessionId, ProtocolError, SnsId, SnsWithdraw, StreamAssembler,
	SubscribeInfo, SubscribeNodeSet, MAX_SNS_ID,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
	Connecting,
	Connected,
	Disconnected,
}

/// Outbound peer target.
#[derive(Clone, Debug)]
pub struct PeerAddr {
	pub host: String,
	pub port: u16,
}

struct SnsEntry {
	sns: SubscribeNodeSet,
	data_ctx: DataCtxId,
}

struct SessionState {
	session_id: PeerSessionId,
	status: PeerStatus,
	remote_node_info: Option<NodeInfo>,
	control_ctx: DataCtxId,
	srtt_us: u64,

	next_sns_id: SnsId,

	/// Sets this session forwards into for data arriving from another peer,
	/// keyed by the incoming (session, sns) pair.
	peer_sns: BTreeMap<(PeerSessionId, SnsId), SnsEntry>,

	/// Sets this session forwards into for data originated locally.
	sub_sns: BTreeMap<TrackAlias, SnsEntry>,

	/// Sets the remote advertised to us.
	recv_sns: HashMap<SnsId, SubscribeNodeSet>,

	control: ControlReader,
	streams: HashMap<u64, StreamAssembler>,

	/// Last group forwarded per track, to pick NewStream vs ExistingStream.
	send_groups: HashMap<TrackAlias, u64>,
}

impl SessionState {
	fn reset(&mut self) {
		self.status = PeerStatus::Connecting;
		self.remote_node_info = None;
		// next_sns_id survives reconnects so ids are never reused.
		self.peer_sns.clear();
		self.sub_sns.clear();
		self.recv_sns.clear();
		self.control = ControlReader::default();
		self.streams.clear();
		self.send_groups.clear();
	}
}

/// One relay-to-relay session: Connecting → Connected → Disconnected.
///
/// Disconnected is terminal for the transport connection; the manager calls
/// [PeerSession::connect] again on outbound sessions, which produces a fresh
/// connection id (and therefore a fresh session id).
pub struct PeerSession {
	inbound: bool,
	peer_addr: Option<PeerAddr>,
	node_info: NodeInfo,
	transport: Arc<dyn Transport>,
	state: Mutex<SessionState>,
}

impl PeerSession {
	pub fn new_outbound(addr: PeerAddr, node_info: NodeInfo, transport: Arc<dyn Transport>) -> Arc<Self> {
		Arc::new(Self {
			inbound: false,
			peer_addr: Some(addr),
			node_info,
			transport,
			state: Mutex::new(Self::initial_state(0)),
		})
	}

	pub fn new_inbound(session_id: PeerSessionId, node_info: NodeInfo, transport: Arc<dyn Transport>) -> Arc<Self> {
		Arc::new(Self {
			inbound: true,
			peer_addr: None,
			node_info,
			transport,
			state: Mutex::new(Self::initial_state(session_id)),
		})
	}

	fn initial_state(session_id: PeerSessionId) -> SessionState {
		SessionState {
			session_id,
			status: PeerStatus::Connecting,
			remote_node_info: None,
			control_ctx: 0,
			srtt_us: 0,
			next_sns_id: 1,
			peer_sns: BTreeMap::new(),
			sub_sns: BTreeMap::new(),
			recv_sns: HashMap::new(),
			control: ControlReader::default(),
			streams: HashMap::new(),
			send_groups: HashMap::new(),
		}
	}

	pub fn session_id(&self) -> PeerSessionId {
		self.state.lock().session_id
	}

	pub fn status(&self) -> PeerStatus {
		self.state.lock().status
	}

	pub fn is_inbound(&self) -> bool {
		self.inbound
	}

	pub fn srtt_us(&self) -> u64 {
		self.state.lock().srtt_us
	}

	pub fn remote_node_id(&self) -> Option<u64> {
		self.state.lock().remote_node_info.as_ref().map(|info| info.id)
	}

	pub fn remote_contact(&self) -> String {
		let state = self.state.lock();
		match &state.remote_node_info {
			Some(info) => info.contact.clone(),
			None => match &self.peer_addr {
				Some(addr) => format!("{}:{}", addr.host, addr.port),
				None => String::new(),
			},
		}
	}

	/// (Re)establish the transport connection and the control stream.
	pub fn connect(&self) {
		let mut state = self.state.lock();
		state.reset();

		if self.inbound {
			// The transport connection already exists; the session turns
			// Connected when the remote's Connect message arrives.
			let conn = state.session_id;
			state.control_ctx = self.transport.create_data_context(conn, true, 0, true);
			return;
		}

		let addr = match &self.peer_addr {
			Some(addr) => addr,
			None => return,
		};

		tracing::debug!(host = %addr.host, port = %addr.port, "starting peer session");

		let conn = self.transport.connect(&addr.host, addr.port);
		state.session_id = conn;
		state.control_ctx = self.transport.create_data_context(conn, true, 0, true);
	}

	pub fn on_connection_metrics(&self, srtt_us: u64) {
		self.state.lock().srtt_us = srtt_us;
	}

	pub fn on_connection_status(self: &Arc<Self>, status: TransportStatus, manager: &PeerManager) {
		match status {
			TransportStatus::Ready => {
				tracing::debug!(session = %self.session_id(), "peer transport ready, sending connect");
				if !self.inbound {
					self.send_connect();
				}
			}
			TransportStatus::Connecting => {}
			_ => {
				tracing::debug!(session = %self.session_id(), ?status, "peer transport disconnected");
				self.state.lock().status = PeerStatus::Disconnected;
				manager.session_changed(self, PeerStatus::Disconnected);
			}
		}
	}

	/// Tear the session down after a protocol violation.
	fn fail(self: &Arc<Self>, err: &CodecError, manager: &PeerManager) {
		let session_id = {
			let mut state = self.state.lock();
			state.status = PeerStatus::Disconnected;
			state.session_id
		};

		tracing::warn!(session = %session_id, %err, "closing peer session");
		self.transport.close(session_id);
		manager.session_changed(self, PeerStatus::Disconnected);
	}

	pub fn on_recv_stream(
		self: &Arc<Self>,
		stream_id: u64,
		data_ctx: Option<DataCtxId>,
		is_bidir: bool,
		data: Bytes,
		manager: &PeerManager,
	) {
		match is_bidir {
			true => self.recv_control(data_ctx, data, manager),
			false => self.recv_data(stream_id, data, manager),
		}
	}

	fn recv_control(self: &Arc<Self>, data_ctx: Option<DataCtxId>, data: Bytes, manager: &PeerManager) {
		let mut messages = Vec::new();
		let result = {
			let mut state = self.state.lock();
			if let Some(ctx) = data_ctx {
				state.control_ctx = ctx;
			}

			state.control.push(&data);
			loop {
				match state.control.next() {
					Ok(Some(msg)) => messages.push(msg),
					Ok(None) => break Ok(()),
					Err(err) => break Err(err),
				}
			}
		};

		for msg in messages {
			self.handle_control(msg, manager);
		}

		if let Err(err) = result {
			self.fail(&err, manager);
		}
	}

	fn handle_control(self: &Arc<Self>, msg: ControlMessage, manager: &PeerManager) {
		match msg {
			ControlMessage::Connect(connect) => {
				tracing::debug!(
					id = %super::NodeId(connect.node_info.id),
					contact = %connect.node_info.contact,
					mode = ?connect.mode,
					"connect from peer"
				);

				{
					let mut state = self.state.lock();
					state.remote_node_info = Some(connect.node_info.clone());
					state.status = PeerStatus::Connected;
				}

				self.send_connect_ok();
				manager.node_received(self, connect.node_info, false);
				manager.session_changed(self, PeerStatus::Connected);
			}
			ControlMessage::ConnectResponse(resp) => {
				if resp.error != ProtocolError::NoError {
					tracing::warn!(session = %self.session_id(), error = ?resp.error, "connect refused");
					self.fail(&CodecError::InvalidValue, manager);
					return;
				}

				let node_info = match resp.node_info {
					Some(info) => info,
					None => return,
				};

				{
					let mut state = self.state.lock();
					state.remote_node_info = Some(node_info.clone());
					state.status = PeerStatus::Connected;
				}

				manager.node_received(self, node_info, false);
				manager.session_changed(self, PeerStatus::Connected);
			}
			ControlMessage::NodeInfoAdvertise(info) => manager.node_received(self, info, false),
			ControlMessage::NodeInfoWithdrawn(info) => manager.node_received(self, info, true),
			ControlMessage::SubscribeInfoAdvertised(info) => manager.subscribe_info_received(self, info, false),
			ControlMessage::SubscribeInfoWithdrawn(info) => manager.subscribe_info_received(self, info, true),
			ControlMessage::AnnounceInfoAdvertised(info) => manager.announce_info_received(self, info, false),
			ControlMessage::AnnounceInfoWithdrawn(info) => manager.announce_info_received(self, info, true),
			ControlMessage::SnsAdvertised(sns) => {
				tracing::debug!(session = %self.session_id(), id = %sns.id, nodes = %sns.nodes.len(), "sns received");
				self.state.lock().recv_sns.insert(sns.id, sns.clone());
				manager.sns_received(self, sns, false);
			}
			ControlMessage::SnsWithdrawn(withdraw) => {
				tracing::debug!(session = %self.session_id(), id = %withdraw.id, "sns withdrawn");
				self.state.lock().recv_sns.remove(&withdraw.id);
				manager.sns_received(self, SubscribeNodeSet::new(withdraw.id), true);
			}
		}
	}

	fn recv_data(self: &Arc<Self>, stream_id: u64, data: Bytes, manager: &PeerManager) {
		let session_id;
		let mut steps = Vec::new();

		let result = {
			let mut state = self.state.lock();
			session_id = state.session_id;

			let assembler = state.streams.entry(stream_id).or_default();
			assembler.push(&data);

			loop {
				match assembler.step() {
					Ok(Some(step)) => steps.push(step),
					Ok(None) => break Ok(()),
					Err(err) => break Err(err),
				}
			}
		};

		for step in steps {
			let mut flags = EnqueueFlags {
				use_reliable: true,
				..Default::default()
			};
			if step.new_stream {
				flags.new_stream = true;
				flags.clear_tx_queue = true;
				flags.use_reset = true;
			}

			// Pipeline the popped bytes onward even before the object is
			// complete; only a complete object is delivered locally.
			manager.forward_peer_data(session_id, &step.header, step.forwarded, step.has_header, flags);

			if let Some(object) = step.completed {
				manager.complete_data_object(self, object);
			}
		}

		if let Err(err) = result {
			self.fail(&err, manager);
		}
	}

	/// Datagrams carry whole objects; drain a bounded batch per callback.
	pub fn on_recv_dgram(self: &Arc<Self>, manager: &PeerManager) {
		let session_id = self.session_id();

		for _ in 0..80 {
			let data = match self.transport.dequeue(session_id, None) {
				Some(data) => data,
				None => return,
			};

			let object = match DataObject::decode(&mut data.clone()) {
				Ok(object) => object,
				Err(err) => {
					self.fail(&err, manager);
					return;
				}
			};

			manager.forward_peer_data(session_id, &object.header, data, true, EnqueueFlags::DATAGRAM);
			manager.complete_data_object(self, object);
		}
	}

	fn send_connect(&self) {
		let connect = Connect {
			mode: PeerMode::Both,
			node_info: self.node_info.clone(),
		};

		let frame = connect.serialize();
		tracing::debug!(length = %frame.len(), "sending connect");
		self.send_control_frame(frame);
	}

	fn send_connect_ok(&self) {
		let resp = ConnectResponse::ok(self.node_info.clone());
		self.send_control_frame(resp.serialize());
	}

	fn send_control_frame(&self, frame: Bytes) {
		let (conn, ctx) = {
			let state = self.state.lock();
			(state.session_id, state.control_ctx)
		};

		self.transport.enqueue(
			conn,
			ctx,
			frame,
			0,
			1_000,
			EnqueueFlags {
				use_reliable: true,
				..Default::default()
			},
		);
	}

	pub fn send_node_info(&self, info: &NodeInfo, withdraw: bool) {
		if self.status() != PeerStatus::Connected {
			return;
		}
		tracing::debug!(id = %super::NodeId(info.id), %withdraw, "sending node info");
		self.send_control_frame(info.serialize(withdraw));
	}

	pub fn send_subscribe_info(&self, info: &SubscribeInfo, withdraw: bool) {
		if self.status() != PeerStatus::Connected {
			return;
		}
		tracing::debug!(
			fullname = %info.track_hash.fullname,
			source = %super::NodeId(info.source_node_id),
			%withdraw,
			"sending subscribe info"
		);
		self.send_control_frame(info.serialize(withdraw));
	}

	pub fn send_announce_info(&self, info: &AnnounceInfo, withdraw: bool) {
		if self.status() != PeerStatus::Connected {
			return;
		}
		tracing::debug!(
			source = %super::NodeId(info.source_node_id),
			%withdraw,
			"sending announce info"
		);
		self.send_control_frame(info.serialize(withdraw));
	}

	fn send_sns_frame(&self, frame: Bytes) {
		if self.status() != PeerStatus::Connected {
			return;
		}
		self.send_control_frame(frame);
	}

	fn alloc_sns(state: &mut SessionState) -> SnsId {
		let id = state.next_sns_id;
		state.next_sns_id = match state.next_sns_id {
			MAX_SNS_ID.. => 1,
			next => next + 1,
		};
		id
	}

	/// Add a source node to the track's locally-fed set; advertises the set
	/// whenever it changes.
	pub fn add_subscribe_source_node(&self, alias: TrackAlias, node_id: u64) -> (SnsId, bool) {
		let (frame, id, is_new) = {
			let mut state = self.state.lock();
			let conn = state.session_id;

			if !state.sub_sns.contains_key(&alias) {
				let id = Self::alloc_sns(&mut state);
				let data_ctx = self.transport.create_data_context(conn, true, 2, false);
				state.sub_sns.insert(
					alias,
					SnsEntry {
						sns: SubscribeNodeSet::new(id),
						data_ctx,
					},
				);
			}

			match state.sub_sns.get_mut(&alias) {
				Some(entry) => {
					let is_new = entry.sns.nodes.insert(node_id);
					let frame = is_new.then(|| entry.sns.serialize());
					(frame, entry.sns.id, is_new)
				}
				None => return (0, false),
			}
		};

		if let Some(frame) = frame {
			self.send_sns_frame(frame);
		}
		(id, is_new)
	}

	/// Remove a source node; withdraws and deletes the set when it empties.
	/// Returns (node removed, set removed).
	pub fn remove_subscribe_source_node(&self, alias: TrackAlias, node_id: u64) -> (bool, bool) {
		let (frame, node_removed, sns_removed) = {
			let mut state = self.state.lock();
			let conn = state.session_id;

			let entry = match state.sub_sns.get_mut(&alias) {
				Some(entry) => entry,
				None => return (false, false),
			};

			let node_removed = entry.sns.nodes.remove(&node_id);
			if !entry.sns.nodes.is_empty() {
				(None, node_removed, false)
			} else {
				let id = entry.sns.id;
				let data_ctx = entry.data_ctx;
				state.sub_sns.remove(&alias);
				state.send_groups.remove(&alias);
				self.transport.delete_data_context(conn, data_ctx);
				(Some(SnsWithdraw { id }.serialize()), node_removed, true)
			}
		};

		if let Some(frame) = frame {
			self.send_sns_frame(frame);
		}
		(node_removed, sns_removed)
	}

	/// Add a source node to the set fed by another peer session's sns.
	pub fn add_peer_sns_source_node(&self, in_session: PeerSessionId, in_sns: SnsId, node_id: u64) -> (SnsId, bool) {
		let key = (in_session, in_sns);

		let (frame, id, is_new) = {
			let mut state = self.state.lock();
			let conn = state.session_id;

			if !state.peer_sns.contains_key(&key) {
				let id = Self::alloc_sns(&mut state);
				let data_ctx = self.transport.create_data_context(conn, true, 2, false);
				state.peer_sns.insert(
					key,
					SnsEntry {
						sns: SubscribeNodeSet::new(id),
						data_ctx,
					},
				);
			}

			match state.peer_sns.get_mut(&key) {
				Some(entry) => {
					let is_new = entry.sns.nodes.insert(node_id);
					let frame = is_new.then(|| entry.sns.serialize());
					(frame, entry.sns.id, is_new)
				}
				None => return (0, false),
			}
		};

		if let Some(frame) = frame {
			self.send_sns_frame(frame);
		}
		(id, is_new)
	}

	/// Remove one source node, or the whole set when `node_id` is None.
	pub fn remove_peer_sns_source_node(
		&self,
		in_session: PeerSessionId,
		in_sns: SnsId,
		node_id: Option<u64>,
	) -> (bool, bool) {
		let key = (in_session, in_sns);

		let (frame, node_removed, sns_removed) = {
			let mut state = self.state.lock();
			let conn = state.session_id;

			let entry = match state.peer_sns.get_mut(&key) {
				Some(entry) => entry,
				None => return (false, false),
			};

			let node_removed = match node_id {
				Some(node_id) => entry.sns.nodes.remove(&node_id),
				None => true,
			};

			if node_id.is_some() && !entry.sns.nodes.is_empty() {
				(None, node_removed, false)
			} else {
				let id = entry.sns.id;
				let data_ctx = entry.data_ctx;
				state.peer_sns.remove(&key);
				self.transport.delete_data_context(conn, data_ctx);
				(Some(SnsWithdraw { id }.serialize()), node_removed, true)
			}
		};

		if let Some(frame) = frame {
			self.send_sns_frame(frame);
		}
		(node_removed, sns_removed)
	}

	/// Drop every set bound to a dead peer session.
	pub fn purge_peer_sns_for(&self, in_session: PeerSessionId) {
		let keys: Vec<(PeerSessionId, SnsId)> = {
			let state = self.state.lock();
			state
				.peer_sns
				.range((in_session, 0)..=(in_session, SnsId::MAX))
				.map(|(key, _)| *key)
				.collect()
		};

		for (session, sns) in keys {
			self.remove_peer_sns_source_node(session, sns, None);
		}
	}

	/// Current set of source nodes the session was advertised for a sns id.
	pub fn recv_sns_nodes(&self, sns_id: SnsId) -> Option<Vec<u64>> {
		let state = self.state.lock();
		state.recv_sns.get(&sns_id).map(|sns| sns.nodes.iter().copied().collect())
	}

	/// Nodes currently in the forwarding set fed by another session's sns.
	pub fn peer_sns_nodes(&self, in_session: PeerSessionId, in_sns: SnsId) -> Vec<u64> {
		let state = self.state.lock();
		match state.peer_sns.get(&(in_session, in_sns)) {
			Some(entry) => entry.sns.nodes.iter().copied().collect(),
			None => Vec::new(),
		}
	}

	/// Sns ids the remote advertised that include `node_id` as a source.
	pub fn recv_sns_containing(&self, node_id: u64) -> Vec<SnsId> {
		let state = self.state.lock();
		state
			.recv_sns
			.values()
			.filter(|sns| sns.nodes.contains(&node_id))
			.map(|sns| sns.id)
			.collect()
	}

	/// Whether this session carries local data for the track.
	pub fn has_sub_sns(&self, alias: TrackAlias) -> bool {
		self.state.lock().sub_sns.contains_key(&alias)
	}

	/// Aliases with a locally-fed set containing `node_id`.
	pub fn sub_sns_for_node(&self, node_id: u64) -> Vec<TrackAlias> {
		let state = self.state.lock();
		state
			.sub_sns
			.iter()
			.filter(|(_, entry)| entry.sns.nodes.contains(&node_id))
			.map(|(alias, _)| *alias)
			.collect()
	}

	/// Send a locally-originated object to the peer on the track's data
	/// context. Stream tracks open a fresh stream per group so a new group
	/// supersedes stale queued bytes.
	pub fn send_local_object(&self, alias: TrackAlias, headers: &ObjectHeaders, record: &Bytes) {
		let state = &mut *self.state.lock();
		if state.status != PeerStatus::Connected {
			return;
		}

		let (sns_id, data_ctx) = match state.sub_sns.get(&alias) {
			Some(entry) => (entry.sns.id, entry.data_ctx),
			None => return,
		};

		let conn = state.session_id;
		let ttl = headers.ttl_ms.unwrap_or(2_000);

		match headers.track_mode {
			TrackMode::Datagram => {
				let object = DataObject::new(DataHeader::new(DataType::Datagram, sns_id, alias), record.clone());
				self.transport
					.enqueue(conn, data_ctx, object.serialize(), headers.priority, ttl, EnqueueFlags::DATAGRAM);
			}
			TrackMode::Stream => {
				let new_group = state.send_groups.get(&alias) != Some(&headers.group_id);
				state.send_groups.insert(alias, headers.group_id);

				let data_type = match new_group {
					true => DataType::NewStream,
					false => DataType::ExistingStream,
				};

				let mut header = DataHeader::new(data_type, sns_id, alias);
				header.priority = headers.priority;
				header.ttl = ttl;

				let flags = EnqueueFlags {
					use_reliable: true,
					new_stream: new_group,
					clear_tx_queue: new_group,
					use_reset: new_group,
				};

				let object = DataObject::new(header, record.clone());
				self.transport
					.enqueue(conn, data_ctx, object.serialize(), headers.priority, ttl, flags);
			}
		}
	}

	/// Pipeline raw bytes from another peer session into this one, if a
	/// matching forwarding set exists. A chunk that starts with the inline
	/// header gets its sns id rewritten to the id this session advertised,
	/// so the next hop matches it against the right set.
	pub fn forward_bytes(
		&self,
		in_session: PeerSessionId,
		header: &DataHeader,
		data: Bytes,
		has_header: bool,
		flags: EnqueueFlags,
	) {
		let state = self.state.lock();
		if state.status != PeerStatus::Connected {
			return;
		}

		let entry = match state.peer_sns.get(&(in_session, header.sns_id)) {
			Some(entry) => entry,
			None => return,
		};

		// The sns id sits right after header_len and type; ExistingStream
		// headers carry none (the downstream anchor supplies it).
		let data = match has_header && header.data_type != DataType::ExistingStream && data.len() >= 6 {
			true => {
				let mut owned = BytesMut::from(&data[..]);
				owned[2..6].copy_from_slice(&entry.sns.id.to_be_bytes());
				owned.freeze()
			}
			false => data,
		};

		self.transport
			.enqueue(state.session_id, entry.data_ctx, data, header.priority, header.ttl, flags);
	}
}
