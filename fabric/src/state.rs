//! Connection-scoped state tables for the client side of the relay.
//!
//! All tables are guarded together by the single state mutex owned by the
//! client manager; the range-scan friendly keys mirror how lookups run:
//! by (alias, connection), by (connection, subscribe id), and by namespace.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use crate::session::{ConnectionHandle, GroupOrder, PublishTrack, SubscribeId, SubscribeTrack};
use crate::track::{FullTrackName, TrackAlias, TrackNamespace};

/// One active subscriber of a track, with the publish paths feeding it.
pub struct SubscribeEntry {
	pub ftn: FullTrackName,
	pub track_alias: TrackAlias,
	pub subscribe_id: SubscribeId,
	pub priority: u8,
	pub group_order: GroupOrder,

	/// Publish path per publishing source; keyed by the publisher's
	/// connection handle (0 for objects arriving from peers). Created
	/// lazily on the first object from that source.
	pub publish_handlers: BTreeMap<ConnectionHandle, Arc<dyn PublishTrack>>,
}

/// Identity of one subscriber within SubscribeActive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscribeWho {
	pub connection_handle: ConnectionHandle,
	pub subscribe_id: SubscribeId,
	pub track_alias: TrackAlias,
}

#[derive(Default)]
pub struct State {
	/// Track aliases being pulled from each announcing connection,
	/// per announced namespace.
	pub announce_active: BTreeMap<(TrackNamespace, ConnectionHandle), BTreeSet<TrackAlias>>,

	/// Active subscribers, keyed by (alias, subscriber connection). One
	/// subscribe per full track name per connection by construction.
	pub subscribes: BTreeMap<(TrackAlias, ConnectionHandle), SubscribeEntry>,

	/// Subscribe id → alias lookup per connection.
	pub subscribe_alias_sub_id: BTreeMap<(ConnectionHandle, SubscribeId), TrackAlias>,

	/// Who currently wants a track, keyed by (namespace, name hash).
	pub subscribe_active: BTreeMap<(TrackNamespace, u64), BTreeSet<SubscribeWho>>,

	/// Connections subscribed to announce events under a namespace prefix.
	pub subscribes_announces: BTreeMap<TrackNamespace, BTreeSet<ConnectionHandle>>,

	/// Pull-side subscriptions this relay installed toward publishers,
	/// keyed by (alias, publisher connection).
	pub pub_subscribes: BTreeMap<(TrackAlias, ConnectionHandle), Arc<dyn SubscribeTrack>>,

	/// Last subscribe-update issued per (publisher connection, alias);
	/// dampens refresh traffic.
	pub subscription_refresh: BTreeMap<(ConnectionHandle, TrackAlias), Instant>,
}

impl State {
	/// Connections prefix-subscribed to announces covering `namespace`.
	pub fn prefix_subscribers(&self, namespace: &TrackNamespace) -> Vec<ConnectionHandle> {
		let mut conns = BTreeSet::new();
		for (prefix, subscribers) in &self.subscribes_announces {
			if namespace.has_prefix(prefix) {
				conns.extend(subscribers.iter().copied());
			}
		}
		conns.into_iter().collect()
	}

	/// True when any connection still subscribes to the alias.
	pub fn has_subscribers(&self, alias: TrackAlias) -> bool {
		self.subscribes
			.range((alias, 0)..=(alias, ConnectionHandle::MAX))
			.next()
			.is_some()
	}
}

/// Cancellation flags for in-flight fetch workers, keyed by
/// (connection, subscribe id). Shared with the worker threads, so it lives
/// outside the state mutex.
pub type StopFetch = BTreeMap<(ConnectionHandle, SubscribeId), Arc<AtomicBool>>;
