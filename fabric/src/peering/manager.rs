//! Peer manager: session lifecycle, info propagation and the forwarding
//! plane between peer sessions and local clients.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::coding::{Decode, Encode};
use crate::forward::{LocalFanout, PeerFabric};
use crate::session::{AnnounceAttributes, ObjectRecord, SubscribeRecord};
use crate::track::{FullTrackName, TrackAlias, TrackHash, TrackNamespace};
use crate::transport::{ConnId, DataCtxId, EnqueueFlags, Transport, TransportEvents, TransportStatus};

use super::{
	AnnounceInfo, DataHeader, DataObject, InfoBase, NodeId, NodeInfo, NodePathItem, NodeType, PeerAddr, PeerSession,
	PeerSessionId, PeerStatus, SubscribeInfo, SubscribeNodeSet,
};

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PeeringConfig {
	pub listening_port: u16,

	/// Outbound peers, `host:port`.
	pub peers: Vec<String>,

	pub init_queue_size: u32,
	pub max_ttl_expiry_ms: u32,
	pub check_interval_ms: u64,
}

impl Default for PeeringConfig {
	fn default() -> Self {
		Self {
			listening_port: 33435,
			peers: Vec::new(),
			init_queue_size: 500,
			max_ttl_expiry_ms: 5_000,
			check_interval_ms: 2_000,
		}
	}
}

#[derive(Default)]
struct SessionMaps {
	/// Accepted by the listener.
	server: HashMap<PeerSessionId, Arc<PeerSession>>,
	/// Initiated by this relay; these reconnect and change ids.
	client: HashMap<PeerSessionId, Arc<PeerSession>>,
}

pub struct PeerManager {
	config: PeeringConfig,
	node_info: NodeInfo,
	transport: Arc<dyn Transport>,
	info_base: Arc<InfoBase>,

	local: OnceLock<Arc<dyn LocalFanout>>,
	sessions: Mutex<SessionMaps>,

	/// Origin sequence per track for subscribes this relay advertises.
	origin_seqs: Mutex<HashMap<TrackAlias, u16>>,
}

impl PeerManager {
	pub fn new(
		config: PeeringConfig,
		node_info: NodeInfo,
		transport: Arc<dyn Transport>,
		info_base: Arc<InfoBase>,
	) -> Arc<Self> {
		tracing::info!(
			id = %NodeId(node_info.id),
			port = %config.listening_port,
			"peer manager starting"
		);

		Arc::new(Self {
			config,
			node_info,
			transport,
			info_base,
			local: OnceLock::new(),
			sessions: Mutex::new(SessionMaps::default()),
			origin_seqs: Mutex::new(HashMap::new()),
		})
	}

	pub fn bind_local(&self, local: Arc<dyn LocalFanout>) {
		let _ = self.local.set(local);
	}

	pub fn node_id(&self) -> u64 {
		self.node_info.id
	}

	fn local(&self) -> Option<Arc<dyn LocalFanout>> {
		self.local.get().cloned()
	}

	/// Open outbound sessions and start the reconnect check task.
	pub fn start(self: &Arc<Self>) {
		for peer in &self.config.peers {
			let addr = match peer.rsplit_once(':') {
				Some((host, port)) => match port.parse::<u16>() {
					Ok(port) => PeerAddr {
						host: host.to_string(),
						port,
					},
					Err(_) => {
						tracing::warn!(%peer, "bad peer address");
						continue;
					}
				},
				None => {
					tracing::warn!(%peer, "bad peer address");
					continue;
				}
			};

			let session = PeerSession::new_outbound(addr, self.node_info.clone(), self.transport.clone());

			let mut maps = self.sessions.lock();
			session.connect();
			maps.client.insert(session.session_id(), session);
		}

		let manager: Weak<Self> = Arc::downgrade(self);
		let interval = Duration::from_millis(self.config.check_interval_ms.max(2_000));

		tokio::spawn(async move {
			loop {
				// Sleep in half-interval steps so shutdown is prompt.
				tokio::time::sleep(interval / 2).await;
				tokio::time::sleep(interval / 2).await;

				match manager.upgrade() {
					Some(manager) => manager.check_sessions(),
					None => return,
				}
			}
		});
	}

	/// Reconnect every outbound session that went Disconnected. Their
	/// session id changes across reconnects.
	fn check_sessions(&self) {
		let mut maps = self.sessions.lock();

		let stale: Vec<PeerSessionId> = maps
			.client
			.iter()
			.filter(|(_, session)| session.status() == PeerStatus::Disconnected)
			.map(|(id, _)| *id)
			.collect();

		for old_id in stale {
			if let Some(session) = maps.client.remove(&old_id) {
				tracing::info!(session = %old_id, "peer session disconnected, reconnecting");
				session.connect();
				maps.client.insert(session.session_id(), session);
			}
		}
	}

	fn get_session(&self, session_id: PeerSessionId) -> Option<Arc<PeerSession>> {
		let maps = self.sessions.lock();
		maps.server
			.get(&session_id)
			.or_else(|| maps.client.get(&session_id))
			.cloned()
	}

	fn all_sessions(&self) -> Vec<Arc<PeerSession>> {
		let maps = self.sessions.lock();
		maps.server.values().chain(maps.client.values()).cloned().collect()
	}

	/// Session ids and remote node ids of the current peer sessions.
	pub fn peer_sessions(&self) -> Vec<(PeerSessionId, PeerStatus, Option<u64>)> {
		self.all_sessions()
			.into_iter()
			.map(|session| (session.session_id(), session.status(), session.remote_node_id()))
			.collect()
	}

	fn connected_sessions(&self) -> Vec<Arc<PeerSession>> {
		self.all_sessions()
			.into_iter()
			.filter(|session| session.status() == PeerStatus::Connected)
			.collect()
	}

	// ------------------------------------------------------------------
	// Feedback from peer sessions
	// ------------------------------------------------------------------

	pub(super) fn node_received(&self, session: &Arc<PeerSession>, info: NodeInfo, remove: bool) {
		tracing::info!(
			id = %NodeId(info.id),
			contact = %info.contact,
			%remove,
			"node received"
		);

		if remove {
			let changed = self.info_base.remove_node(session.session_id(), info.id);
			self.propagate_node_info(&info, true, Some(session.session_id()));
			if changed {
				self.reroute_node(info.id);
			}
			return;
		}

		// Our own info echoed back, or a path already through us.
		if info.id == self.node_info.id || info.path_contains(self.node_info.id) {
			return;
		}

		if self.info_base.add_node(session, info.clone()) {
			self.reroute_node(info.id);

			let mut adv = info;
			adv.path.push(NodePathItem {
				id: self.node_info.id,
				srtt_us: session.srtt_us(),
			});
			self.propagate_node_info(&adv, false, Some(session.session_id()));
		}
	}

	fn propagate_node_info(&self, info: &NodeInfo, withdraw: bool, exclude: Option<PeerSessionId>) {
		for session in self.connected_sessions() {
			if Some(session.session_id()) == exclude {
				continue;
			}

			// Loop prevention: never advertise a node back toward itself or
			// along a session whose remote already appears in the path.
			if let Some(remote) = session.remote_node_id() {
				if remote == info.id || info.path_contains(remote) {
					continue;
				}
			}

			session.send_node_info(info, withdraw);
		}
	}

	pub(super) fn session_changed(&self, session: &Arc<PeerSession>, status: PeerStatus) {
		let session_id = session.session_id();

		match status {
			PeerStatus::Connected => {
				tracing::info!(session = %session_id, contact = %session.remote_contact(), "peer session connected");
				self.sync_peer(session);
			}
			PeerStatus::Disconnected => {
				tracing::info!(session = %session_id, "peer session disconnected");

				let changed = self.info_base.purge_peer_session(session_id);

				for other in self.all_sessions() {
					if other.session_id() != session_id {
						other.purge_peer_sns_for(session_id);
					}
				}

				for node_id in changed {
					self.reroute_node(node_id);
				}

				if session.is_inbound() {
					self.sessions.lock().server.remove(&session_id);
				}
			}
			PeerStatus::Connecting => {}
		}
	}

	/// Replay the information base into a freshly connected peer.
	fn sync_peer(&self, session: &Arc<PeerSession>) {
		let session_id = session.session_id();
		let remote = session.remote_node_id();

		for (info, via) in self.info_base.best_nodes() {
			if via.session_id() == session_id {
				continue;
			}
			if remote == Some(info.id) || info.path_contains(remote.unwrap_or(0)) {
				continue;
			}

			let mut adv = info;
			adv.path.push(NodePathItem {
				id: self.node_info.id,
				srtt_us: via.srtt_us(),
			});
			session.send_node_info(&adv, false);
		}

		for info in self.info_base.subscribes_snapshot() {
			if remote == Some(info.source_node_id) {
				continue;
			}
			session.send_subscribe_info(&info, false);
		}

		for info in self.info_base.announces_snapshot() {
			if remote == Some(info.source_node_id) {
				continue;
			}
			session.send_announce_info(&info, false);
		}
	}

	pub(super) fn subscribe_info_received(&self, session: &Arc<PeerSession>, info: SubscribeInfo, withdraw: bool) {
		let fullname = info.track_hash.fullname;
		let source = info.source_node_id;

		if withdraw {
			if self.info_base.remove_subscribe(fullname, source).is_none() {
				return;
			}

			for other in self.connected_sessions() {
				if other.session_id() != session.session_id() {
					other.send_subscribe_info(&info, true);
				}
				other.remove_subscribe_source_node(fullname, source);
			}

			if !self.info_base.has_subscribers(fullname, self.node_info.id) {
				if let Some(local) = self.local() {
					local.peer_unsubscribe(fullname);
				}
			}
			return;
		}

		if source == self.node_info.id {
			return;
		}

		if !self.info_base.add_subscribe(info.clone()) {
			return;
		}

		tracing::debug!(
			%fullname,
			source = %NodeId(source),
			"subscribe info received"
		);

		// Data path: feed the subscriber along the best session toward it.
		if let Some(best) = self.info_base.best_session(source) {
			best.add_subscribe_source_node(fullname, source);
		}

		// Pull matching local publishers.
		match SubscribeRecord::decode(&mut info.subscribe_data.clone()) {
			Ok(record) => {
				if let Some(local) = self.local() {
					local.peer_subscribe(record);
				}
			}
			Err(err) => tracing::warn!(%err, "undecodable subscribe data"),
		}

		for other in self.connected_sessions() {
			if other.session_id() != session.session_id() {
				other.send_subscribe_info(&info, false);
			}
		}
	}

	pub(super) fn announce_info_received(&self, session: &Arc<PeerSession>, info: AnnounceInfo, withdraw: bool) {
		if withdraw {
			if !self.info_base.remove_announce(&info) {
				return;
			}

			for other in self.connected_sessions() {
				if other.session_id() != session.session_id() {
					other.send_announce_info(&info, true);
				}
			}

			if let Some(local) = self.local() {
				local.peer_unannounce(&info.namespace);
			}
			return;
		}

		if info.source_node_id == self.node_info.id {
			return;
		}

		if !self.info_base.add_announce(info.clone()) {
			return;
		}

		tracing::debug!(source = %NodeId(info.source_node_id), "announce info received");

		for other in self.connected_sessions() {
			if other.session_id() != session.session_id() {
				other.send_announce_info(&info, false);
			}
		}

		if let Some(local) = self.local() {
			local.peer_announce(&info.namespace);
		}
	}

	pub(super) fn sns_received(&self, session: &Arc<PeerSession>, sns: SubscribeNodeSet, withdraw: bool) {
		let from_id = session.session_id();

		if withdraw {
			for other in self.all_sessions() {
				if other.session_id() != from_id {
					other.remove_peer_sns_source_node(from_id, sns.id, None);
				}
			}
			return;
		}

		for other in self.all_sessions() {
			if other.session_id() == from_id {
				continue;
			}

			// Drop nodes no longer in the advertised set.
			for node_id in other.peer_sns_nodes(from_id, sns.id) {
				if !sns.nodes.contains(&node_id) {
					other.remove_peer_sns_source_node(from_id, sns.id, Some(node_id));
				}
			}
		}

		for node_id in &sns.nodes {
			if *node_id == self.node_info.id {
				// Data tagged with this set is for local delivery.
				continue;
			}

			let best = match self.info_base.best_session(*node_id) {
				Some(best) => best,
				None => {
					tracing::warn!(node = %NodeId(*node_id), "no route for sns node");
					continue;
				}
			};

			if best.session_id() == from_id {
				// Split horizon: never forward back on the arriving link.
				continue;
			}

			best.add_peer_sns_source_node(from_id, sns.id, *node_id);
		}
	}

	/// A complete object arrived from a peer; deliver locally unless this
	/// relay is a pure via.
	pub(super) fn complete_data_object(&self, _session: &Arc<PeerSession>, object: DataObject) {
		if self.node_info.node_type == NodeType::Via {
			return;
		}

		let record = match ObjectRecord::decode(&mut object.payload.clone()) {
			Ok(record) => record,
			Err(err) => {
				tracing::warn!(%err, "undecodable object record");
				return;
			}
		};

		if let Some(local) = self.local() {
			local.deliver_object(object.header.track_fullname_hash, record);
		}
	}

	/// Pipeline raw object bytes from one session into every other session
	/// with a matching forwarding set.
	pub(super) fn forward_peer_data(
		&self,
		from_session: PeerSessionId,
		header: &DataHeader,
		data: Bytes,
		has_header: bool,
		flags: EnqueueFlags,
	) {
		for session in self.all_sessions() {
			if session.session_id() == from_session {
				continue;
			}
			session.forward_bytes(from_session, header, data.clone(), has_header, flags);
		}
	}

	/// Re-attach forwarding state after the best session for a node
	/// changed, so data flowing through the old path moves to the new one.
	fn reroute_node(&self, node_id: u64) {
		let new_best = match self.info_base.best_session(node_id) {
			Some(best) => best,
			None => return,
		};
		let new_id = new_best.session_id();

		let sessions = self.all_sessions();

		for session in &sessions {
			if session.session_id() == new_id {
				continue;
			}

			for alias in session.sub_sns_for_node(node_id) {
				session.remove_subscribe_source_node(alias, node_id);
			}
		}

		// Re-install the locally-fed sets from the information base; this
		// also restores the data path after a peer session reconnects.
		for sub in self.info_base.subscribes_snapshot() {
			if sub.source_node_id == node_id {
				new_best.add_subscribe_source_node(sub.track_hash.fullname, node_id);
			}
		}

		for src in &sessions {
			let src_id = src.session_id();
			if src_id == new_id {
				continue;
			}

			for sns_id in src.recv_sns_containing(node_id) {
				new_best.add_peer_sns_source_node(src_id, sns_id, node_id);

				for session in &sessions {
					let id = session.session_id();
					if id != new_id && id != src_id {
						session.remove_peer_sns_source_node(src_id, sns_id, Some(node_id));
					}
				}
			}
		}
	}
}

// ----------------------------------------------------------------------
// Transport callbacks
// ----------------------------------------------------------------------

impl TransportEvents for PeerManager {
	fn on_new_connection(&self, conn: ConnId, remote: &str) {
		tracing::info!(%conn, %remote, "peer connection accepted");

		let session = PeerSession::new_inbound(conn, self.node_info.clone(), self.transport.clone());

		let mut maps = self.sessions.lock();
		session.connect();
		maps.server.insert(conn, session);
	}

	fn on_connection_status(&self, conn: ConnId, status: TransportStatus) {
		let session = match self.get_session(conn) {
			Some(session) => session,
			None => return,
		};

		session.on_connection_status(status, self);
	}

	fn on_recv_stream(&self, conn: ConnId, stream_id: u64, data_ctx: Option<DataCtxId>, is_bidir: bool, data: Bytes) {
		if let Some(session) = self.get_session(conn) {
			session.on_recv_stream(stream_id, data_ctx, is_bidir, data, self);
		}
	}

	fn on_recv_dgram(&self, conn: ConnId, _data_ctx: Option<DataCtxId>) {
		if let Some(session) = self.get_session(conn) {
			session.on_recv_dgram(self);
		}
	}

	fn on_connection_metrics(&self, conn: ConnId, srtt_us: u64) {
		if let Some(session) = self.get_session(conn) {
			session.on_connection_metrics(srtt_us);
		}
	}
}

// ----------------------------------------------------------------------
// Requests from the client side
// ----------------------------------------------------------------------

impl PeerFabric for PeerManager {
	fn client_announce(&self, namespace: &TrackNamespace, _attrs: &AnnounceAttributes) {
		let info = AnnounceInfo {
			source_node_id: self.node_info.id,
			namespace: namespace.clone(),
			name: Bytes::new(),
		};

		self.info_base.add_announce(info.clone());

		for session in self.connected_sessions() {
			session.send_announce_info(&info, false);
		}

		// Remote subscribers waiting for this namespace: pull from the new
		// announcer and open the data path toward each of them.
		let local = self.local();
		for sub in self.info_base.subscribes_snapshot() {
			if sub.source_node_id == self.node_info.id {
				continue;
			}

			let record = match SubscribeRecord::decode(&mut sub.subscribe_data.clone()) {
				Ok(record) => record,
				Err(_) => continue,
			};

			if !record.ftn.namespace.has_prefix(namespace) {
				continue;
			}

			if let Some(best) = self.info_base.best_session(sub.source_node_id) {
				best.add_subscribe_source_node(sub.track_hash.fullname, sub.source_node_id);
			}

			if let Some(local) = &local {
				local.peer_subscribe(record);
			}
		}
	}

	fn client_unannounce(&self, namespace: &TrackNamespace) {
		let info = AnnounceInfo {
			source_node_id: self.node_info.id,
			namespace: namespace.clone(),
			name: Bytes::new(),
		};

		if !self.info_base.remove_announce(&info) {
			return;
		}

		for session in self.connected_sessions() {
			session.send_announce_info(&info, true);
		}
	}

	fn client_subscribe(&self, record: &SubscribeRecord) {
		let th = TrackHash::new(&record.ftn);

		let mut data = BytesMut::new();
		record.encode(&mut data);

		let seq = {
			let mut seqs = self.origin_seqs.lock();
			let seq = seqs.entry(th.fullname).or_insert(0);
			*seq = seq.wrapping_add(1);
			*seq
		};

		let info = SubscribeInfo {
			seq,
			source_node_id: self.node_info.id,
			track_hash: th,
			subscribe_data: data.freeze(),
		};

		self.info_base.add_subscribe(info.clone());

		// Route toward announcing nodes when known, otherwise flood.
		let targets = self.info_base.get_announce_ids(&record.ftn.namespace, &record.ftn.name, false);

		let mut sent = HashSet::new();
		for node_id in &targets {
			if *node_id == self.node_info.id {
				continue;
			}
			if let Some(best) = self.info_base.best_session(*node_id) {
				if sent.insert(best.session_id()) {
					best.send_subscribe_info(&info, false);
				}
			}
		}

		if sent.is_empty() {
			for session in self.connected_sessions() {
				session.send_subscribe_info(&info, false);
			}
		}
	}

	fn client_unsubscribe(&self, ftn: &FullTrackName) {
		let th = TrackHash::new(ftn);

		let info = match self.info_base.remove_subscribe(th.fullname, self.node_info.id) {
			Some(info) => info,
			None => return,
		};

		for session in self.connected_sessions() {
			session.send_subscribe_info(&info, true);
		}
	}

	fn forward_object(&self, alias: TrackAlias, record: &ObjectRecord) {
		let mut data = BytesMut::new();
		record.encode(&mut data);
		let data = data.freeze();

		for session in self.connected_sessions() {
			if session.has_sub_sns(alias) {
				session.send_local_object(alias, &record.headers, &data);
			}
		}
	}
}
