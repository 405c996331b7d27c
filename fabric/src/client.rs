//! Client-facing state machine: announces, subscribes, prefix subscribes,
//! publisher fanout and fetches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::ObjectCache;
use crate::forward::{DedupLru, LocalFanout, PeerFabric};
use crate::peering::NodeType;
use crate::session::{
	AnnounceAttributes, AnnounceReasonCode, AnnounceResponse, ClientSetupAttributes, ClientSetupResponse,
	ConnectionHandle, ConnectionMetrics, ConnectionStatus, FetchAttributes, FilterType, GroupOrder, MoqServer,
	ObjectHeaders, ObjectRecord, PublishTrack, SessionApi, SubscribeAttributes, SubscribeId, SubscribeRecord,
	SubscribeResponse, SubscribeStatus, SubscribeTrack,
};
use crate::state::{State, StopFetch, SubscribeEntry, SubscribeWho};
use crate::track::{FullTrackName, TrackAlias, TrackHash, TrackNamespace};

/// Pull-side handler toward one publishing connection; objects it receives
/// fan out to every matching subscriber and into the cache.
struct RelaySubscribeHandler {
	ftn: FullTrackName,
	alias: TrackAlias,
	publisher_conn: ConnectionHandle,
	priority: u8,
	group_order: GroupOrder,
	manager: Weak<ClientManager>,
}

impl SubscribeTrack for RelaySubscribeHandler {
	fn full_track_name(&self) -> FullTrackName {
		self.ftn.clone()
	}

	fn priority(&self) -> u8 {
		self.priority
	}

	fn group_order(&self) -> GroupOrder {
		self.group_order
	}

	fn object_received(&self, headers: &ObjectHeaders, payload: &Bytes) {
		if let Some(manager) = self.manager.upgrade() {
			manager.publish_object(self.alias, self.publisher_conn, headers, payload.clone());
		}
	}

	fn status_changed(&self, status: SubscribeStatus) {
		match status {
			SubscribeStatus::Ok => tracing::info!(alias = %self.alias, "track subscribed"),
			_ => tracing::debug!(alias = %self.alias, ?status, "subscribe status changed"),
		}
	}
}

/// Current table sizes of the client state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
	pub announces: usize,
	pub subscribes: usize,
	pub subscribe_ids: usize,
	pub active_tracks: usize,
	pub prefix_subscribes: usize,
	pub publisher_pulls: usize,
}

pub struct ClientManager {
	node_type: NodeType,
	endpoint_id: String,
	refresh_interval: Duration,

	state: Mutex<State>,
	stop_fetch: Arc<Mutex<StopFetch>>,
	cache: Arc<ObjectCache>,
	dedup: DedupLru,

	session: OnceLock<Arc<dyn SessionApi>>,
	peers: OnceLock<Arc<dyn PeerFabric>>,
	self_weak: OnceLock<Weak<ClientManager>>,
}

impl ClientManager {
	pub fn new(
		node_type: NodeType,
		endpoint_id: String,
		refresh_interval: Duration,
		cache: Arc<ObjectCache>,
	) -> Arc<Self> {
		let manager = Arc::new(Self {
			node_type,
			endpoint_id,
			refresh_interval,
			state: Mutex::new(State::default()),
			stop_fetch: Arc::new(Mutex::new(StopFetch::new())),
			cache,
			dedup: DedupLru::default(),
			session: OnceLock::new(),
			peers: OnceLock::new(),
			self_weak: OnceLock::new(),
		});

		let _ = manager.self_weak.set(Arc::downgrade(&manager));
		manager
	}

	/// Wire the external seams; must happen before any callback arrives.
	pub fn bind(&self, session: Arc<dyn SessionApi>, peers: Arc<dyn PeerFabric>) {
		let _ = self.session.set(session);
		let _ = self.peers.set(peers);
	}

	fn session(&self) -> Option<Arc<dyn SessionApi>> {
		self.session.get().cloned()
	}

	/// Table sizes, for introspection and tests.
	pub fn stats(&self) -> ClientStats {
		let state = self.state.lock();
		ClientStats {
			announces: state.announce_active.len(),
			subscribes: state.subscribes.len(),
			subscribe_ids: state.subscribe_alias_sub_id.len(),
			active_tracks: state.subscribe_active.len(),
			prefix_subscribes: state.subscribes_announces.len(),
			publisher_pulls: state.pub_subscribes.len(),
		}
	}

	fn peers(&self) -> Option<Arc<dyn PeerFabric>> {
		self.peers.get().cloned()
	}

	fn pull_handler(
		&self,
		ftn: &FullTrackName,
		alias: TrackAlias,
		publisher_conn: ConnectionHandle,
		group_order: GroupOrder,
	) -> Arc<dyn SubscribeTrack> {
		Arc::new(RelaySubscribeHandler {
			ftn: ftn.clone(),
			alias,
			publisher_conn,
			// Zero defers to the publisher's own priority.
			priority: 0,
			group_order,
			manager: self.self_weak.get().cloned().unwrap_or_default(),
		})
	}

	/// An object was produced by a publisher (local connection or peer);
	/// cache it and fan it out.
	fn publish_object(&self, alias: TrackAlias, publisher_conn: ConnectionHandle, headers: &ObjectHeaders, payload: Bytes) {
		if !self.dedup.insert(alias, headers.group_id, headers.object_id) {
			tracing::trace!(%alias, group = %headers.group_id, object = %headers.object_id, "duplicate object");
			return;
		}

		self.cache.put(alias, headers, payload.clone());
		self.fanout_local(alias, publisher_conn, headers, &payload);

		if let Some(peers) = self.peers() {
			peers.forward_object(
				alias,
				&ObjectRecord {
					headers: *headers,
					payload,
				},
			);
		}
	}

	/// Deliver one object to every local subscriber of the track, creating
	/// and binding the publish path on first use.
	fn fanout_local(&self, alias: TrackAlias, publisher_conn: ConnectionHandle, headers: &ObjectHeaders, payload: &Bytes) {
		let session = match self.session() {
			Some(session) => session,
			None => return,
		};

		let handlers: Vec<Arc<dyn PublishTrack>> = {
			let mut state = self.state.lock();
			state
				.subscribes
				.range_mut((alias, 0)..=(alias, ConnectionHandle::MAX))
				.map(|((_, subscriber_conn), entry)| {
					entry
						.publish_handlers
						.entry(publisher_conn)
						.or_insert_with(|| {
							session.bind_publisher_track(*subscriber_conn, entry.subscribe_id, &entry.ftn, headers)
						})
						.clone()
				})
				.collect()
		};

		for handler in handlers {
			handler.publish_object(headers, payload.clone());
		}
	}

	/// Drop all publish state owned by a connection handle. Handles may be
	/// reused by the transport, so this also runs when a duplicate announce
	/// arrives on a handle we already track.
	fn purge_publish_locked(&self, state: &mut State, conn: ConnectionHandle) {
		let pub_keys: Vec<(TrackAlias, ConnectionHandle)> = state
			.pub_subscribes
			.keys()
			.filter(|(_, publisher)| *publisher == conn)
			.copied()
			.collect();
		for key in pub_keys {
			tracing::debug!(alias = %key.0, %conn, "purging publisher subscribe");
			state.pub_subscribes.remove(&key);
		}

		let anno_keys: Vec<(TrackNamespace, ConnectionHandle)> = state
			.announce_active
			.keys()
			.filter(|(_, handle)| *handle == conn)
			.cloned()
			.collect();
		for key in anno_keys {
			state.announce_active.remove(&key);
		}

		for entry in state.subscribes.values_mut() {
			entry.publish_handlers.remove(&conn);
		}

		state.subscription_refresh.retain(|(publisher, _), _| *publisher != conn);
	}

	fn process_subscribe(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		filter_type: FilterType,
		ftn: &FullTrackName,
		attrs: &SubscribeAttributes,
	) {
		let th = TrackHash::new(ftn);
		let from_peer = conn == 0 && subscribe_id == 0;

		let session = match self.session() {
			Some(session) => session,
			None => return,
		};

		if from_peer {
			tracing::debug!(alias = %th.fullname, priority = %attrs.priority, "processing peer subscribe");
		} else {
			tracing::info!(
				%conn,
				%subscribe_id,
				alias = %th.fullname,
				priority = %attrs.priority,
				"processing subscribe"
			);
		}

		let mut subscribe_actions: Vec<(ConnectionHandle, Arc<dyn SubscribeTrack>)> = Vec::new();
		let mut update_actions: Vec<(ConnectionHandle, Arc<dyn SubscribeTrack>)> = Vec::new();

		{
			let state = &mut *self.state.lock();

			if !from_peer {
				state.subscribe_alias_sub_id.insert((conn, subscribe_id), th.fullname);
				state
					.subscribe_active
					.entry((ftn.namespace.clone(), th.name))
					.or_default()
					.insert(SubscribeWho {
						connection_handle: conn,
						subscribe_id,
						track_alias: th.fullname,
					});
				state.subscribes.entry((th.fullname, conn)).or_insert_with(|| SubscribeEntry {
					ftn: ftn.clone(),
					track_alias: th.fullname,
					subscribe_id,
					priority: attrs.priority,
					group_order: attrs.group_order,
					publish_handlers: Default::default(),
				});
			}

			// Subscribe toward every announcer covering the namespace.
			let announcers: Vec<(TrackNamespace, ConnectionHandle)> = state
				.announce_active
				.keys()
				.filter(|(anno_ns, _)| ftn.namespace.has_prefix(anno_ns))
				.cloned()
				.collect();

			for (anno_ns, anno_conn) in announcers {
				if !state.pub_subscribes.contains_key(&(th.fullname, anno_conn)) {
					tracing::info!(%anno_conn, alias = %th.fullname, "sending subscribe to announcer");

					if let Some(tracks) = state.announce_active.get_mut(&(anno_ns, anno_conn)) {
						tracks.insert(th.fullname);
					}

					let handler = self.pull_handler(ftn, th.fullname, anno_conn, GroupOrder::Ascending);
					state.pub_subscribes.insert((th.fullname, anno_conn), handler.clone());
					subscribe_actions.push((anno_conn, handler));
				} else if filter_type != FilterType::LatestGroup {
					// Dampen refreshes per (publisher, track).
					let now = Instant::now();
					match state.subscription_refresh.get(&(anno_conn, th.fullname)) {
						None => {
							state.subscription_refresh.insert((anno_conn, th.fullname), now);
						}
						Some(last) if now.duration_since(*last) > self.refresh_interval => {
							state.subscription_refresh.insert((anno_conn, th.fullname), now);
							if let Some(handler) = state.pub_subscribes.get(&(th.fullname, anno_conn)) {
								tracing::info!(%anno_conn, alias = %th.fullname, "sending subscribe update to announcer");
								update_actions.push((anno_conn, handler.clone()));
							}
						}
						Some(_) => {}
					}
				}
			}
		}

		for (announcer, handler) in subscribe_actions {
			session.subscribe_track(announcer, handler);
		}
		for (announcer, handler) in update_actions {
			session.update_track_subscription(announcer, handler);
		}

		if !from_peer {
			if let Some(peers) = self.peers() {
				peers.client_subscribe(&SubscribeRecord {
					ftn: ftn.clone(),
					priority: attrs.priority,
					group_order: attrs.group_order,
					filter_type,
				});
			}
		}
	}

	/// Tear down every publisher-side pull for the alias.
	fn remove_publisher_subscribe(&self, alias: TrackAlias) {
		let session = match self.session() {
			Some(session) => session,
			None => return,
		};

		let removed: Vec<(ConnectionHandle, Arc<dyn SubscribeTrack>)> = {
			let mut state = self.state.lock();
			let keys: Vec<(TrackAlias, ConnectionHandle)> = state
				.pub_subscribes
				.range((alias, 0)..=(alias, ConnectionHandle::MAX))
				.map(|(key, _)| *key)
				.collect();

			keys.into_iter()
				.filter_map(|key| state.pub_subscribes.remove(&key).map(|handler| (key.1, handler)))
				.collect()
		};

		for (publisher, handler) in removed {
			tracing::info!(%publisher, %alias, "unsubscribing from announcer");
			session.unsubscribe_track(publisher, handler);
		}
	}
}

impl MoqServer for ClientManager {
	fn new_connection_accepted(&self, conn: ConnectionHandle, remote: &str) {
		tracing::info!(%conn, %remote, "new connection accepted");
	}

	fn connection_status_changed(&self, conn: ConnectionHandle, status: ConnectionStatus) {
		if status.is_connected() {
			return;
		}
		tracing::debug!(%conn, ?status, "connection closed");

		let unsubscribes: Vec<(ConnectionHandle, SubscribeId)> = {
			let mut state = self.state.lock();

			// Drop the connection's prefix subscriptions.
			state.subscribes_announces.retain(|_, conns| {
				conns.remove(&conn);
				!conns.is_empty()
			});

			state
				.subscribe_alias_sub_id
				.range((conn, 0)..=(conn, SubscribeId::MAX))
				.map(|(key, _)| *key)
				.collect()
		};

		for (conn, subscribe_id) in unsubscribes {
			self.unsubscribe_received(conn, subscribe_id);
		}

		// Cancel any fetches still draining toward the connection.
		{
			let mut stop_fetch = self.stop_fetch.lock();
			let keys: Vec<(ConnectionHandle, SubscribeId)> = stop_fetch
				.range((conn, 0)..=(conn, SubscribeId::MAX))
				.map(|(key, _)| *key)
				.collect();
			for key in keys {
				if let Some(flag) = stop_fetch.get(&key) {
					flag.store(true, Ordering::Relaxed);
				}
				stop_fetch.remove(&key);
			}
		}

		let mut state = self.state.lock();
		self.purge_publish_locked(&mut state, conn);
	}

	fn client_setup_received(&self, conn: ConnectionHandle, attrs: &ClientSetupAttributes) -> ClientSetupResponse {
		tracing::info!(%conn, endpoint = %attrs.endpoint_id, "client setup received");
		ClientSetupResponse {
			endpoint_id: self.endpoint_id.clone(),
		}
	}

	fn announce_received(&self, conn: ConnectionHandle, namespace: &TrackNamespace, attrs: &AnnounceAttributes) {
		let ns_hash = namespace.hash64();
		tracing::info!(%conn, namespace = %ns_hash, "announce received");

		let session = match self.session() {
			Some(session) => session,
			None => return,
		};

		let mut subscribe_actions: Vec<(ConnectionHandle, Arc<dyn SubscribeTrack>)> = Vec::new();
		let notify;

		{
			let state = &mut *self.state.lock();

			// The transport may reuse handles; a duplicate announce means
			// the previous life of this handle is stale.
			if state.announce_active.contains_key(&(namespace.clone(), conn)) {
				self.purge_publish_locked(state, conn);
			}

			notify = state.prefix_subscribers(namespace);

			state.announce_active.insert((namespace.clone(), conn), Default::default());

			// Pull every track that active subscribers already want under
			// this namespace.
			let wanted: Vec<SubscribeWho> = state
				.subscribe_active
				.iter()
				.filter(|((sub_ns, _), who)| sub_ns.has_prefix(namespace) && !who.is_empty())
				.filter_map(|(_, who)| who.iter().next().copied())
				.collect();

			for who in wanted {
				let entry = match state.subscribes.get(&(who.track_alias, who.connection_handle)) {
					Some(entry) => entry,
					None => continue,
				};
				let ftn = entry.ftn.clone();

				if state.pub_subscribes.contains_key(&(who.track_alias, conn)) {
					continue;
				}

				tracing::info!(%conn, alias = %who.track_alias, "sending subscribe to announcer");

				if let Some(tracks) = state.announce_active.get_mut(&(namespace.clone(), conn)) {
					tracks.insert(who.track_alias);
				}

				let handler = self.pull_handler(&ftn, who.track_alias, conn, GroupOrder::Publisher);
				state.pub_subscribes.insert((who.track_alias, conn), handler.clone());
				subscribe_actions.push((conn, handler));
			}
		}

		session.resolve_announce(
			conn,
			namespace,
			&notify,
			AnnounceResponse {
				reason_code: AnnounceReasonCode::Ok,
			},
		);

		for (announcer, handler) in subscribe_actions {
			session.subscribe_track(announcer, handler);
		}

		// Last, so the peering side sees fully settled local state.
		if let Some(peers) = self.peers() {
			peers.client_announce(namespace, attrs);
		}
	}

	fn unannounce_received(&self, conn: ConnectionHandle, namespace: &TrackNamespace) -> Vec<ConnectionHandle> {
		tracing::debug!(%conn, namespace = %namespace.hash64(), "unannounce received");

		let session = self.session();
		let mut unsubscribe_actions: Vec<(ConnectionHandle, Arc<dyn SubscribeTrack>)> = Vec::new();
		let mut unbind_actions: Vec<(ConnectionHandle, Arc<dyn PublishTrack>)> = Vec::new();
		let notify;

		{
			let state = &mut *self.state.lock();
			notify = state.prefix_subscribers(namespace);

			let aliases = state
				.announce_active
				.remove(&(namespace.clone(), conn))
				.unwrap_or_default();

			for alias in aliases {
				if let Some(handler) = state.pub_subscribes.remove(&(alias, conn)) {
					tracing::info!(%conn, %alias, "removing publisher pull on unannounce");
					unsubscribe_actions.push((conn, handler));
				}

				// Drop the publish paths this announcer was feeding.
				for ((_, subscriber_conn), entry) in
					state.subscribes.range_mut((alias, 0)..=(alias, ConnectionHandle::MAX))
				{
					if let Some(handler) = entry.publish_handlers.remove(&conn) {
						unbind_actions.push((*subscriber_conn, handler));
					}
				}
			}
		}

		if let Some(session) = session {
			for (publisher, handler) in unsubscribe_actions {
				session.unsubscribe_track(publisher, handler);
			}
			for (subscriber, handler) in unbind_actions {
				session.unbind_publisher_track(subscriber, handler);
			}
		}

		if let Some(peers) = self.peers() {
			peers.client_unannounce(namespace);
		}

		notify
	}

	fn subscribe_announces_received(&self, conn: ConnectionHandle, prefix: &TrackNamespace) -> Vec<TrackNamespace> {
		let mut state = self.state.lock();

		let entry = state.subscribes_announces.entry(prefix.clone()).or_default();
		if entry.insert(conn) {
			tracing::info!(%conn, prefix = %prefix.hash64(), "subscribe announces received");
		}

		let mut matched: Vec<TrackNamespace> = Vec::new();
		for (ns, _) in state.announce_active.keys() {
			if ns.has_prefix(prefix) && matched.last() != Some(ns) {
				matched.push(ns.clone());
			}
		}
		matched
	}

	fn unsubscribe_announces_received(&self, conn: ConnectionHandle, prefix: &TrackNamespace) {
		tracing::info!(%conn, prefix = %prefix.hash64(), "unsubscribe announces received");

		let mut state = self.state.lock();
		if let Some(conns) = state.subscribes_announces.get_mut(prefix) {
			conns.remove(&conn);
			if conns.is_empty() {
				state.subscribes_announces.remove(prefix);
			}
		}
	}

	fn subscribe_received(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		proposed_track_alias: u64,
		filter_type: FilterType,
		ftn: &FullTrackName,
		attrs: &SubscribeAttributes,
	) {
		let th = TrackHash::new(ftn);

		tracing::info!(%conn, %subscribe_id, alias = %th.fullname, priority = %attrs.priority, "new subscribe");

		let session = match self.session() {
			Some(session) => session,
			None => return,
		};

		if proposed_track_alias != 0 && proposed_track_alias != th.fullname {
			session.resolve_subscribe(conn, subscribe_id, SubscribeResponse::retry_track_alias(th.fullname));
			return;
		}

		session.resolve_subscribe(conn, subscribe_id, SubscribeResponse::ok(self.cache.last(th.fullname)));

		self.process_subscribe(conn, subscribe_id, filter_type, ftn, attrs);
	}

	fn unsubscribe_received(&self, conn: ConnectionHandle, subscribe_id: SubscribeId) {
		tracing::info!(%conn, %subscribe_id, "unsubscribe received");

		let session = match self.session() {
			Some(session) => session,
			None => return,
		};

		let mut unbind_actions: Vec<(ConnectionHandle, Arc<dyn PublishTrack>)> = Vec::new();
		let mut gone: Option<(TrackAlias, FullTrackName)> = None;

		{
			let state = &mut *self.state.lock();

			let alias = match state.subscribe_alias_sub_id.remove(&(conn, subscribe_id)) {
				Some(alias) => alias,
				None => {
					tracing::warn!(%conn, %subscribe_id, "no track alias for subscribe");
					return;
				}
			};

			let entry = match state.subscribes.remove(&(alias, conn)) {
				Some(entry) => entry,
				None => {
					tracing::debug!(%conn, %subscribe_id, "no track handler for subscribe");
					return;
				}
			};

			let th = TrackHash::new(&entry.ftn);
			for (_, handler) in entry.publish_handlers {
				unbind_actions.push((conn, handler));
			}

			let key = (entry.ftn.namespace.clone(), th.name);
			if let Some(who) = state.subscribe_active.get_mut(&key) {
				who.remove(&SubscribeWho {
					connection_handle: conn,
					subscribe_id,
					track_alias: alias,
				});
				if who.is_empty() {
					state.subscribe_active.remove(&key);
				}
			}

			if !state.has_subscribers(alias) {
				tracing::info!(%alias, "no subscribers left, unsubscribing publishers");
				for tracks in state.announce_active.values_mut() {
					tracks.remove(&alias);
				}
				self.dedup.forget(alias);
				gone = Some((alias, entry.ftn.clone()));
			}
		}

		for (subscriber, handler) in unbind_actions {
			session.unbind_publisher_track(subscriber, handler);
		}

		if let Some((alias, ftn)) = gone {
			self.remove_publisher_subscribe(alias);
			if let Some(peers) = self.peers() {
				peers.client_unsubscribe(&ftn);
			}
		}
	}

	fn fetch_ok(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		ftn: &FullTrackName,
		attrs: &FetchAttributes,
	) -> bool {
		let th = TrackHash::new(ftn);

		let session = match self.session() {
			Some(session) => session,
			None => return false,
		};

		let groups = self.cache.get(th.fullname, attrs.start_group, attrs.end_group.saturating_add(1));
		if groups.is_empty() {
			return false;
		}

		let handler = session.bind_fetch_track(conn, subscribe_id, ftn, attrs);

		let stop = self
			.stop_fetch
			.lock()
			.entry((conn, subscribe_id))
			.or_insert_with(|| Arc::new(AtomicBool::new(false)))
			.clone();

		let stop_fetch = self.stop_fetch.clone();
		let attrs = *attrs;

		// One short-lived worker per fetch drains the snapshot.
		std::thread::spawn(move || {
			'drain: for group in groups {
				for object in group.objects {
					if stop.load(Ordering::Relaxed) {
						break 'drain;
					}

					if group.group_id == attrs.start_group && object.headers.object_id < attrs.start_object {
						continue;
					}

					// End object zero means all objects in the end group.
					if attrs.end_object != 0
						&& group.group_id == attrs.end_group
						&& object.headers.object_id > attrs.end_object
					{
						break 'drain;
					}

					tracing::debug!(group = %group.group_id, object = %object.headers.object_id, "fetching");
					handler.publish_object(&object.headers, object.payload.clone());
				}
			}

			session.unbind_fetch_track(conn, handler);
			stop_fetch.lock().remove(&(conn, subscribe_id));
		});

		true
	}

	fn fetch_cancel_received(&self, conn: ConnectionHandle, subscribe_id: SubscribeId) {
		tracing::info!(%conn, %subscribe_id, "canceling fetch");

		// Pre-cancel if the fetch has not started yet.
		self.stop_fetch
			.lock()
			.entry((conn, subscribe_id))
			.or_insert_with(|| Arc::new(AtomicBool::new(false)))
			.store(true, Ordering::Relaxed);
	}

	fn metrics_sampled(&self, conn: ConnectionHandle, metrics: &ConnectionMetrics) {
		tracing::debug!(
			%conn,
			rtt_us = %metrics.rtt_us,
			srtt_us = %metrics.srtt_us,
			rate_bps = %metrics.tx_rate_bps,
			lost = %metrics.tx_lost_pkts,
			"connection metrics"
		);
	}
}

impl LocalFanout for ClientManager {
	fn deliver_object(&self, alias: TrackAlias, record: ObjectRecord) {
		if self.node_type == NodeType::Via {
			return;
		}

		if !self.dedup.insert(alias, record.headers.group_id, record.headers.object_id) {
			return;
		}

		self.cache.put(alias, &record.headers, record.payload.clone());
		self.fanout_local(alias, 0, &record.headers, &record.payload);
	}

	fn peer_subscribe(&self, record: SubscribeRecord) {
		self.process_subscribe(
			0,
			0,
			record.filter_type,
			&record.ftn,
			&SubscribeAttributes {
				priority: record.priority,
				group_order: record.group_order,
			},
		);
	}

	fn peer_unsubscribe(&self, alias: TrackAlias) {
		let has_local = self.state.lock().has_subscribers(alias);
		if !has_local {
			self.remove_publisher_subscribe(alias);
		}
	}

	fn peer_announce(&self, namespace: &TrackNamespace) {
		let notify = self.state.lock().prefix_subscribers(namespace);
		if notify.is_empty() {
			return;
		}

		if let Some(session) = self.session() {
			session.resolve_announce(
				0,
				namespace,
				&notify,
				AnnounceResponse {
					reason_code: AnnounceReasonCode::Ok,
				},
			);
		}
	}

	fn peer_unannounce(&self, namespace: &TrackNamespace) {
		let notify = self.state.lock().prefix_subscribers(namespace);
		tracing::debug!(namespace = %namespace.hash64(), notify = %notify.len(), "peer unannounce");
	}
}
