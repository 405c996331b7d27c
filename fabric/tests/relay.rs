//! End-to-end scenarios against the in-memory transport, with a recording
//! double standing in for the MoQ session layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use moq_fabric::cache::CacheConfig;
use moq_fabric::peering::{NodeId, PeerStatus, PeeringConfig};
use moq_fabric::session::{
	AnnounceAttributes, AnnounceResponse, ConnectionHandle, ConnectionStatus, FetchAttributes, FilterType,
	GroupOrder, MoqServer, ObjectHeaders, PublishTrack, SessionApi, SubscribeAttributes, SubscribeId,
	SubscribeReasonCode, SubscribeResponse, SubscribeStatus, SubscribeTrack, TrackMode,
};
use moq_fabric::transport::{ConnId, DataCtxId, MemFabric, MemTransport, Transport, TransportEvents, TransportStatus};
use moq_fabric::{FullTrackName, Relay, RelayOptions, TrackHash, TrackNamespace};

// ----------------------------------------------------------------------
// Recording session double
// ----------------------------------------------------------------------

struct TestPublish {
	conn: ConnectionHandle,
	subscribe_id: SubscribeId,
	ftn: FullTrackName,
	objects: Mutex<Vec<(ObjectHeaders, Bytes)>>,
	ended: AtomicBool,
}

impl PublishTrack for TestPublish {
	fn publish_object(&self, headers: &ObjectHeaders, payload: Bytes) {
		self.objects.lock().push((*headers, payload));
	}
}

impl TestPublish {
	fn object_ids(&self) -> Vec<(u64, u64)> {
		self.objects
			.lock()
			.iter()
			.map(|(headers, _)| (headers.group_id, headers.object_id))
			.collect()
	}
}

#[derive(Default)]
struct SessionLog {
	resolved_announces: Vec<(ConnectionHandle, TrackNamespace, Vec<ConnectionHandle>)>,
	resolved_subscribes: Vec<(ConnectionHandle, SubscribeId, SubscribeResponse)>,
	subscribed: Vec<(ConnectionHandle, Arc<dyn SubscribeTrack>)>,
	unsubscribed: Vec<(ConnectionHandle, Arc<dyn SubscribeTrack>)>,
	updated: Vec<(ConnectionHandle, Arc<dyn SubscribeTrack>)>,
	publishers: Vec<Arc<TestPublish>>,
	fetches: Vec<Arc<TestPublish>>,
	unbound_fetches: usize,
}

#[derive(Default)]
struct TestSession {
	log: Mutex<SessionLog>,
}

impl TestSession {
	fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Pull handlers the relay installed toward a publisher connection.
	fn pulls_for(&self, conn: ConnectionHandle) -> Vec<Arc<dyn SubscribeTrack>> {
		self.log
			.lock()
			.subscribed
			.iter()
			.filter(|(publisher, _)| *publisher == conn)
			.map(|(_, handler)| handler.clone())
			.collect()
	}

	fn publishers_for(&self, conn: ConnectionHandle) -> Vec<Arc<TestPublish>> {
		self.log
			.lock()
			.publishers
			.iter()
			.filter(|sink| sink.conn == conn)
			.cloned()
			.collect()
	}

	fn last_subscribe_response(&self, conn: ConnectionHandle, subscribe_id: SubscribeId) -> Option<SubscribeResponse> {
		self.log
			.lock()
			.resolved_subscribes
			.iter()
			.rev()
			.find(|(c, id, _)| *c == conn && *id == subscribe_id)
			.map(|(_, _, response)| response.clone())
	}
}

impl SessionApi for TestSession {
	fn resolve_announce(
		&self,
		conn: ConnectionHandle,
		namespace: &TrackNamespace,
		notify: &[ConnectionHandle],
		_response: AnnounceResponse,
	) {
		self.log
			.lock()
			.resolved_announces
			.push((conn, namespace.clone(), notify.to_vec()));
	}

	fn resolve_subscribe(&self, conn: ConnectionHandle, subscribe_id: SubscribeId, response: SubscribeResponse) {
		self.log.lock().resolved_subscribes.push((conn, subscribe_id, response));
	}

	fn subscribe_track(&self, conn: ConnectionHandle, handler: Arc<dyn SubscribeTrack>) {
		handler.status_changed(SubscribeStatus::Ok);
		self.log.lock().subscribed.push((conn, handler));
	}

	fn unsubscribe_track(&self, conn: ConnectionHandle, handler: Arc<dyn SubscribeTrack>) {
		self.log.lock().unsubscribed.push((conn, handler));
	}

	fn update_track_subscription(&self, conn: ConnectionHandle, handler: Arc<dyn SubscribeTrack>) {
		self.log.lock().updated.push((conn, handler));
	}

	fn bind_publisher_track(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		ftn: &FullTrackName,
		_headers: &ObjectHeaders,
	) -> Arc<dyn PublishTrack> {
		let sink = Arc::new(TestPublish {
			conn,
			subscribe_id,
			ftn: ftn.clone(),
			objects: Mutex::new(Vec::new()),
			ended: AtomicBool::new(false),
		});
		self.log.lock().publishers.push(sink.clone());
		sink
	}

	fn unbind_publisher_track(&self, _conn: ConnectionHandle, track: Arc<dyn PublishTrack>) {
		let log = self.log.lock();
		for sink in &log.publishers {
			let as_dyn: Arc<dyn PublishTrack> = sink.clone();
			if Arc::ptr_eq(&as_dyn, &track) {
				sink.ended.store(true, Ordering::Relaxed);
			}
		}
	}

	fn bind_fetch_track(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		ftn: &FullTrackName,
		_attrs: &FetchAttributes,
	) -> Arc<dyn PublishTrack> {
		let sink = Arc::new(TestPublish {
			conn,
			subscribe_id,
			ftn: ftn.clone(),
			objects: Mutex::new(Vec::new()),
			ended: AtomicBool::new(false),
		});
		self.log.lock().fetches.push(sink.clone());
		sink
	}

	fn unbind_fetch_track(&self, _conn: ConnectionHandle, _track: Arc<dyn PublishTrack>) {
		self.log.lock().unbound_fetches += 1;
	}
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct TestRelay {
	relay: Arc<Relay>,
	session: Arc<TestSession>,
	transport: Arc<MemTransport>,
}

fn spawn_relay(fabric: &Arc<MemFabric>, relay_id: &str, port: u16, peers: Vec<String>) -> TestRelay {
	let node_id: NodeId = relay_id.parse().unwrap();

	let options = RelayOptions {
		node_id: node_id.into(),
		contact: format!("localhost:{port}"),
		cache: CacheConfig {
			max_groups: 10,
			..Default::default()
		},
		peering: PeeringConfig {
			listening_port: port,
			peers,
			..Default::default()
		},
		..Default::default()
	};

	let session = TestSession::new();
	let transport = Arc::new(MemTransport::new(fabric.clone(), port));

	let relay = Relay::new(options, transport.clone(), session.clone());
	transport.bind(relay.peers.clone());
	assert_eq!(transport.status(), TransportStatus::Ready);
	relay.start();

	TestRelay {
		relay,
		session,
		transport,
	}
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
	for _ in 0..1000 {
		if check() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("timed out waiting for {what}");
}

fn ns(tuples: &[&str]) -> TrackNamespace {
	TrackNamespace::new(tuples.iter().map(|t| Bytes::copy_from_slice(t.as_bytes())))
}

fn headers(group_id: u64, object_id: u64) -> ObjectHeaders {
	ObjectHeaders {
		group_id,
		object_id,
		priority: 1,
		ttl_ms: Some(10_000),
		track_mode: TrackMode::Stream,
	}
}

fn subscribe_attrs() -> SubscribeAttributes {
	SubscribeAttributes {
		priority: 1,
		group_order: GroupOrder::Descending,
	}
}

const PUBLISHER: ConnectionHandle = 10;
const SUBSCRIBER: ConnectionHandle = 20;

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn publish_subscribe_in_order_until_unannounce() {
	let fabric = MemFabric::new();
	let relay = spawn_relay(&fabric, "1:1", 9101, vec![]);
	let client = &relay.relay.client;

	let namespace = ns(&["a", "b"]);
	let ftn = FullTrackName::new(namespace.clone(), "video");

	client.announce_received(PUBLISHER, &namespace, &AnnounceAttributes::default());
	client.subscribe_received(SUBSCRIBER, 1, 0, FilterType::LatestGroup, &ftn, &subscribe_attrs());

	// The relay pulled the track from the announcer.
	let pulls = relay.session.pulls_for(PUBLISHER);
	assert_eq!(pulls.len(), 1);
	assert_eq!(pulls[0].full_track_name(), ftn);

	// Publish a group; a duplicate object must forward only once.
	for object in 0..3 {
		pulls[0].object_received(&headers(1, object), &Bytes::from_static(b"payload"));
	}
	pulls[0].object_received(&headers(1, 1), &Bytes::from_static(b"dup"));

	let sinks = relay.session.publishers_for(SUBSCRIBER);
	assert_eq!(sinks.len(), 1);
	assert_eq!(sinks[0].subscribe_id, 1);
	assert_eq!(sinks[0].ftn, ftn);
	assert_eq!(sinks[0].object_ids(), vec![(1, 0), (1, 1), (1, 2)]);

	// Unannounce ends the subscriber's feed from this publisher.
	client.unannounce_received(PUBLISHER, &namespace);
	assert!(sinks[0].ended.load(Ordering::Relaxed));
	assert_eq!(relay.session.log.lock().unsubscribed.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn prefix_subscribe_notified_of_later_announce() {
	let fabric = MemFabric::new();
	let relay = spawn_relay(&fabric, "1:2", 9102, vec![]);
	let client = &relay.relay.client;

	// Prefix subscribe before anything is announced.
	let matched = client.subscribe_announces_received(SUBSCRIBER, &ns(&["a"]));
	assert!(matched.is_empty());

	let namespace = ns(&["a", "b"]);
	client.announce_received(PUBLISHER, &namespace, &AnnounceAttributes::default());

	let log = relay.session.log.lock();
	let (conn, announced, notify) = log.resolved_announces.last().unwrap();
	assert_eq!(*conn, PUBLISHER);
	assert_eq!(announced, &namespace);
	assert_eq!(notify, &vec![SUBSCRIBER]);
	drop(log);

	// A later prefix subscribe sees the active announcement.
	let matched = client.subscribe_announces_received(30, &ns(&["a"]));
	assert_eq!(matched, vec![namespace]);
}

#[tokio::test(flavor = "multi_thread")]
async fn track_alias_mismatch_asks_for_retry() {
	let fabric = MemFabric::new();
	let relay = spawn_relay(&fabric, "1:3", 9103, vec![]);
	let client = &relay.relay.client;

	let ftn = FullTrackName::new(ns(&["a"]), "video");
	let th = TrackHash::new(&ftn);

	client.subscribe_received(SUBSCRIBER, 1, th.fullname + 1, FilterType::LatestGroup, &ftn, &subscribe_attrs());

	let response = relay.session.last_subscribe_response(SUBSCRIBER, 1).unwrap();
	assert_eq!(response.reason_code, SubscribeReasonCode::RetryTrackAlias);
	assert_eq!(response.track_alias, Some(th.fullname));

	// Nothing entered the state tables.
	assert_eq!(relay.relay.client.stats().subscribes, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn late_subscriber_sees_largest_available() {
	let fabric = MemFabric::new();
	let relay = spawn_relay(&fabric, "1:4", 9104, vec![]);
	let client = &relay.relay.client;

	let namespace = ns(&["a", "b"]);
	let ftn = FullTrackName::new(namespace.clone(), "video");

	client.announce_received(PUBLISHER, &namespace, &AnnounceAttributes::default());
	client.subscribe_received(SUBSCRIBER, 1, 0, FilterType::LatestGroup, &ftn, &subscribe_attrs());

	let pulls = relay.session.pulls_for(PUBLISHER);
	for group in 10..=12 {
		for object in 0..2 {
			pulls[0].object_received(&headers(group, object), &Bytes::from_static(b"x"));
		}
	}

	// A subscriber arriving after group 12 learns the largest available.
	client.subscribe_received(30, 7, 0, FilterType::LargestObject, &ftn, &subscribe_attrs());
	let response = relay.session.last_subscribe_response(30, 7).unwrap();
	assert_eq!(response.reason_code, SubscribeReasonCode::Ok);
	assert_eq!(response.largest, Some((12, 1)));

	// Subsequent live objects reach it.
	pulls[0].object_received(&headers(13, 0), &Bytes::from_static(b"live"));
	let sinks = relay.session.publishers_for(30);
	assert_eq!(sinks.len(), 1);
	assert_eq!(sinks[0].object_ids(), vec![(13, 0)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_served_from_cache_and_cancelable() {
	let fabric = MemFabric::new();
	let relay = spawn_relay(&fabric, "1:5", 9105, vec![]);
	let client = &relay.relay.client;

	let namespace = ns(&["a", "b"]);
	let ftn = FullTrackName::new(namespace.clone(), "video");

	client.announce_received(PUBLISHER, &namespace, &AnnounceAttributes::default());
	client.subscribe_received(SUBSCRIBER, 1, 0, FilterType::LatestGroup, &ftn, &subscribe_attrs());

	let pulls = relay.session.pulls_for(PUBLISHER);
	for group in 10..=12 {
		for object in 0..3 {
			pulls[0].object_received(&headers(group, object), &Bytes::from_static(b"cached"));
		}
	}

	let fetch = FetchAttributes {
		priority: 1,
		group_order: GroupOrder::Ascending,
		start_group: 10,
		end_group: 12,
		start_object: 0,
		end_object: 0,
	};

	assert!(client.fetch_ok(SUBSCRIBER, 100, &ftn, &fetch));

	eventually("fetch to drain", || relay.session.log.lock().unbound_fetches == 1).await;
	{
		let log = relay.session.log.lock();
		let sink = log.fetches.last().unwrap();
		assert_eq!(
			sink.object_ids(),
			vec![
				(10, 0),
				(10, 1),
				(10, 2),
				(11, 0),
				(11, 1),
				(11, 2),
				(12, 0),
				(12, 1),
				(12, 2)
			]
		);
	}

	// A canceled fetch truncates; a pre-set cancel flag drains nothing.
	client.fetch_cancel_received(SUBSCRIBER, 101);
	assert!(client.fetch_ok(SUBSCRIBER, 101, &ftn, &fetch));
	eventually("canceled fetch to unbind", || relay.session.log.lock().unbound_fetches == 2).await;
	{
		let log = relay.session.log.lock();
		assert!(log.fetches.last().unwrap().objects.lock().is_empty());
	}

	// A subsequent narrower fetch still works.
	let fetch = FetchAttributes {
		start_group: 11,
		end_group: 12,
		..fetch
	};
	assert!(client.fetch_ok(SUBSCRIBER, 102, &ftn, &fetch));
	eventually("second fetch to drain", || relay.session.log.lock().unbound_fetches == 3).await;
	{
		let log = relay.session.log.lock();
		let sink = log.fetches.last().unwrap();
		assert_eq!(sink.object_ids().first(), Some(&(11, 0)));
		assert_eq!(sink.object_ids().last(), Some(&(12, 2)));
	}

	// An empty range is refused.
	let fetch = FetchAttributes {
		start_group: 50,
		end_group: 60,
		..fetch
	};
	assert!(!client.fetch_ok(SUBSCRIBER, 103, &ftn, &fetch));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_purges_connection_state() {
	let fabric = MemFabric::new();
	let relay = spawn_relay(&fabric, "1:6", 9106, vec![]);
	let client = &relay.relay.client;

	let namespace = ns(&["a", "b"]);
	let ftn = FullTrackName::new(namespace.clone(), "video");

	client.announce_received(PUBLISHER, &namespace, &AnnounceAttributes::default());
	client.subscribe_announces_received(SUBSCRIBER, &ns(&["a"]));
	client.subscribe_received(SUBSCRIBER, 1, 0, FilterType::LatestGroup, &ftn, &subscribe_attrs());

	let stats = client.stats();
	assert_eq!(stats.announces, 1);
	assert_eq!(stats.subscribes, 1);
	assert_eq!(stats.prefix_subscribes, 1);
	assert_eq!(stats.publisher_pulls, 1);

	client.connection_status_changed(SUBSCRIBER, ConnectionStatus::NotConnected);

	let stats = client.stats();
	assert_eq!(stats.subscribes, 0);
	assert_eq!(stats.subscribe_ids, 0);
	assert_eq!(stats.active_tracks, 0);
	assert_eq!(stats.prefix_subscribes, 0);
	// The publisher-side pull went with the last subscriber.
	assert_eq!(stats.publisher_pulls, 0);

	client.connection_status_changed(PUBLISHER, ConnectionStatus::NotConnected);
	assert_eq!(client.stats().announces, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn objects_flow_between_peered_relays_and_survive_reconnect() {
	let fabric = MemFabric::new();
	let relay1 = spawn_relay(&fabric, "1:1", 9201, vec![]);
	let relay2 = spawn_relay(&fabric, "2:2", 9202, vec!["localhost:9201".to_string()]);

	let node1: u64 = "1:1".parse::<NodeId>().unwrap().into();
	let node2: u64 = "2:2".parse::<NodeId>().unwrap().into();

	eventually("peers to learn each other", || {
		relay1.relay.info_base.best_session(node2).is_some() && relay2.relay.info_base.best_session(node1).is_some()
	})
	.await;

	let namespace = ns(&["a", "b"]);
	let ftn = FullTrackName::new(namespace.clone(), "video");

	// Publisher on relay 1, subscriber on relay 2.
	relay1
		.relay
		.client
		.announce_received(PUBLISHER, &namespace, &AnnounceAttributes::default());
	relay2
		.relay
		.client
		.subscribe_received(SUBSCRIBER, 1, 0, FilterType::LatestGroup, &ftn, &subscribe_attrs());

	// Subscribe propagation makes relay 1 pull from its announcer.
	eventually("subscribe to reach relay 1", || {
		!relay1.session.pulls_for(PUBLISHER).is_empty()
	})
	.await;
	let pulls = relay1.session.pulls_for(PUBLISHER);

	for object in 0..3 {
		pulls[0].object_received(&headers(1, object), &Bytes::from_static(b"cross-relay"));
	}

	eventually("objects to reach the remote subscriber", || {
		relay2
			.session
			.publishers_for(SUBSCRIBER)
			.first()
			.is_some_and(|sink| sink.object_ids().len() == 3)
	})
	.await;

	let sinks = relay2.session.publishers_for(SUBSCRIBER);
	assert_eq!(sinks[0].object_ids(), vec![(1, 0), (1, 1), (1, 2)]);

	// Kill the peer link; the outbound side reconnects on its own.
	let outbound = relay2
		.relay
		.peers
		.peer_sessions()
		.into_iter()
		.find(|(_, status, _)| *status == PeerStatus::Connected)
		.map(|(id, _, _)| id)
		.unwrap();
	relay2.transport.close(outbound);

	eventually("link to reconnect", || {
		relay2
			.relay
			.peers
			.peer_sessions()
			.iter()
			.any(|(id, status, _)| *status == PeerStatus::Connected && *id != outbound)
	})
	.await;

	// Flow re-establishes over the new session. Publish a fresh object id
	// on every probe; duplicates would be dropped by the dedup guard.
	let mut next_object = 0;
	eventually("flow to resume after reconnect", || {
		let pulls = relay1.session.pulls_for(PUBLISHER);
		if pulls.is_empty() {
			return false;
		}
		pulls[0].object_received(&headers(2, next_object), &Bytes::from_static(b"after-reconnect"));
		next_object += 1;

		relay2
			.session
			.publishers_for(SUBSCRIBER)
			.first()
			.is_some_and(|sink| sink.object_ids().iter().any(|(group, _)| *group == 2))
	})
	.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn prefix_notification_crosses_relays() {
	let fabric = MemFabric::new();
	let relay1 = spawn_relay(&fabric, "3:1", 9301, vec![]);
	let relay2 = spawn_relay(&fabric, "3:2", 9302, vec!["localhost:9301".to_string()]);

	let node1: u64 = "3:1".parse::<NodeId>().unwrap().into();
	eventually("peers to learn each other", || {
		relay2.relay.info_base.best_session(node1).is_some()
	})
	.await;

	// Prefix subscriber on relay 2, announcer on relay 1.
	relay2.relay.client.subscribe_announces_received(SUBSCRIBER, &ns(&["a"]));

	let namespace = ns(&["a", "b"]);
	relay1
		.relay
		.client
		.announce_received(PUBLISHER, &namespace, &AnnounceAttributes::default());

	eventually("announce to reach relay 2 prefix subscriber", || {
		let log = relay2.session.log.lock();
		log.resolved_announces
			.iter()
			.any(|(conn, announced, notify)| *conn == 0 && announced == &namespace && notify.contains(&SUBSCRIBER))
	})
	.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn objects_traverse_an_intermediate_relay() {
	let fabric = MemFabric::new();
	let relay1 = spawn_relay(&fabric, "5:1", 9501, vec![]);
	let relay2 = spawn_relay(&fabric, "5:2", 9502, vec!["localhost:9501".to_string()]);
	let relay3 = spawn_relay(&fabric, "5:3", 9503, vec!["localhost:9502".to_string()]);

	let node1: u64 = "5:1".parse::<NodeId>().unwrap().into();
	let node2: u64 = "5:2".parse::<NodeId>().unwrap().into();
	let node3: u64 = "5:3".parse::<NodeId>().unwrap().into();

	// The edges learn each other through the middle relay.
	eventually("topology to converge", || {
		relay3.relay.info_base.best_session(node1).is_some() && relay1.relay.info_base.best_session(node3).is_some()
	})
	.await;

	// The advertised path crossed exactly one hop and never loops.
	let via: Vec<_> = relay3
		.relay
		.info_base
		.best_nodes()
		.into_iter()
		.filter(|(info, _)| info.id == node1)
		.collect();
	assert_eq!(via.len(), 1);
	let path = &via[0].0.path;
	assert_eq!(path.len(), 1);
	assert_eq!(path[0].id, node2);
	assert!(!path.iter().any(|hop| hop.id == node3));

	let namespace = ns(&["a", "b"]);
	let ftn = FullTrackName::new(namespace.clone(), "video");

	relay1
		.relay
		.client
		.announce_received(PUBLISHER, &namespace, &AnnounceAttributes::default());
	relay3
		.relay
		.client
		.subscribe_received(SUBSCRIBER, 1, 0, FilterType::LatestGroup, &ftn, &subscribe_attrs());

	eventually("subscribe to reach the publisher edge", || {
		!relay1.session.pulls_for(PUBLISHER).is_empty()
	})
	.await;
	let pulls = relay1.session.pulls_for(PUBLISHER);

	// Stream objects cross both hops in order.
	for object in 0..3 {
		pulls[0].object_received(&headers(1, object), &Bytes::from_static(b"two hops"));
	}

	eventually("objects to cross both hops", || {
		relay3
			.session
			.publishers_for(SUBSCRIBER)
			.first()
			.is_some_and(|sink| sink.object_ids().len() == 3)
	})
	.await;

	let sinks = relay3.session.publishers_for(SUBSCRIBER);
	assert_eq!(sinks[0].object_ids(), vec![(1, 0), (1, 1), (1, 2)]);

	// So does a datagram-mode object.
	let mut dgram = headers(1, 3);
	dgram.track_mode = TrackMode::Datagram;
	pulls[0].object_received(&dgram, &Bytes::from_static(b"dgram"));

	eventually("datagram to cross both hops", || {
		relay3
			.session
			.publishers_for(SUBSCRIBER)
			.first()
			.is_some_and(|sink| sink.object_ids().contains(&(1, 3)))
	})
	.await;

	// The middle relay never grew client state.
	assert_eq!(relay2.relay.client.stats().subscribes, 0);
}

/// Dummy sink for a hand-rolled endpoint that speaks garbage.
struct NullEvents;

impl TransportEvents for NullEvents {
	fn on_new_connection(&self, _conn: ConnId, _remote: &str) {}
	fn on_connection_status(&self, _conn: ConnId, _status: TransportStatus) {}
	fn on_recv_stream(&self, _conn: ConnId, _stream_id: u64, _ctx: Option<DataCtxId>, _bidir: bool, _data: Bytes) {}
	fn on_recv_dgram(&self, _conn: ConnId, _ctx: Option<DataCtxId>) {}
	fn on_connection_metrics(&self, _conn: ConnId, _srtt_us: u64) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_connect_closes_only_that_session() {
	let fabric = MemFabric::new();
	let relay1 = spawn_relay(&fabric, "4:1", 9401, vec![]);
	let _relay2 = spawn_relay(&fabric, "4:2", 9402, vec!["localhost:9401".to_string()]);

	let node2: u64 = "4:2".parse::<NodeId>().unwrap().into();
	eventually("healthy peer to connect", || {
		relay1.relay.info_base.best_session(node2).is_some()
	})
	.await;

	// A third endpoint connects and speaks a valid Connect first...
	let rogue = Arc::new(MemTransport::new(fabric.clone(), 9499));
	rogue.bind(Arc::new(NullEvents));

	let conn = rogue.connect("localhost", 9401);
	let ctx = rogue.create_data_context(conn, true, 0, true);

	let rogue_id: u64 = "9:9".parse::<NodeId>().unwrap().into();
	let connect = moq_fabric::peering::Connect {
		mode: moq_fabric::peering::PeerMode::Both,
		node_info: moq_fabric::peering::NodeInfo {
			id: rogue_id,
			contact: "localhost:9499".into(),
			..Default::default()
		},
	};

	let flags = moq_fabric::transport::EnqueueFlags {
		use_reliable: true,
		..Default::default()
	};
	rogue.enqueue(conn, ctx, connect.serialize(), 0, 1_000, flags);

	eventually("rogue node to enter the info base", || {
		relay1.relay.info_base.best_session(rogue_id).is_some()
	})
	.await;

	// ...then a Connect body whose declared lengths exceed the buffer:
	// the contact length claims 200 bytes that never arrive.
	let malformed = Bytes::from_static(&[
		1, 0, 1, 0, 0, 0, 14, // common header, data_length = 14
		2, // mode = both
		0, 0, 0, 0, 0, 0, 0, 9, // node id
		1,    // node type = edge
		0x40, 200, // contact length varint claiming 200 bytes
		0xaa, 0xbb, // truncated
	]);
	rogue.enqueue(conn, ctx, malformed, 0, 1_000, flags);

	eventually("rogue session to be closed and purged", || {
		relay1.relay.info_base.best_session(rogue_id).is_none()
	})
	.await;

	// The healthy peer session is unaffected.
	assert!(relay1.relay.info_base.best_session(node2).is_some());
	assert!(relay1
		.relay
		.peers
		.peer_sessions()
		.iter()
		.any(|(_, status, _)| *status == PeerStatus::Connected));
}
