//! Seams between the client side and the peering side of the forwarding
//! plane, plus the duplicate-object guard.
//!
//! The client manager and the peer manager reference each other; the cycle
//! is broken by these traits: the client manager implements [LocalFanout],
//! the peer manager implements [PeerFabric].

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::session::{AnnounceAttributes, ObjectRecord, SubscribeRecord};
use crate::track::{FullTrackName, TrackAlias, TrackNamespace};

/// What the peering side asks of the client side.
pub trait LocalFanout: Send + Sync {
	/// A complete object arrived from a peer; deliver to local subscribers.
	fn deliver_object(&self, alias: TrackAlias, record: ObjectRecord);

	/// A remote subscriber wants the track; replay the subscribe into the
	/// client state so matching local publishers are pulled.
	fn peer_subscribe(&self, record: SubscribeRecord);

	/// No remote subscriber wants the track anymore.
	fn peer_unsubscribe(&self, alias: TrackAlias);

	/// A namespace was announced somewhere in the mesh.
	fn peer_announce(&self, namespace: &TrackNamespace);

	fn peer_unannounce(&self, namespace: &TrackNamespace);
}

/// What the client side asks of the peering side.
pub trait PeerFabric: Send + Sync {
	fn client_announce(&self, namespace: &TrackNamespace, attrs: &AnnounceAttributes);

	fn client_unannounce(&self, namespace: &TrackNamespace);

	fn client_subscribe(&self, record: &SubscribeRecord);

	fn client_unsubscribe(&self, ftn: &FullTrackName);

	/// An object was published by a local client; fan out to matching peer
	/// sessions.
	fn forward_object(&self, alias: TrackAlias, record: &ObjectRecord);
}

struct TrackDedup {
	order: VecDeque<(u64, u64)>,
	seen: HashSet<(u64, u64)>,
}

/// Small per-track LRU of recently seen (group, object) pairs.
pub struct DedupLru {
	capacity: usize,
	tracks: Mutex<HashMap<TrackAlias, TrackDedup>>,
}

impl DedupLru {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			tracks: Mutex::new(HashMap::new()),
		}
	}

	/// Record the pair; returns false when it was seen recently.
	pub fn insert(&self, alias: TrackAlias, group_id: u64, object_id: u64) -> bool {
		let key = (group_id, object_id);
		let mut tracks = self.tracks.lock();

		let track = tracks.entry(alias).or_insert_with(|| TrackDedup {
			order: VecDeque::with_capacity(self.capacity),
			seen: HashSet::with_capacity(self.capacity),
		});

		if !track.seen.insert(key) {
			return false;
		}

		track.order.push_back(key);
		if track.order.len() > self.capacity {
			if let Some(oldest) = track.order.pop_front() {
				track.seen.remove(&oldest);
			}
		}

		true
	}

	/// Forget a track entirely, e.g. when its last subscriber goes away.
	pub fn forget(&self, alias: TrackAlias) {
		self.tracks.lock().remove(&alias);
	}
}

impl Default for DedupLru {
	fn default() -> Self {
		Self::new(256)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn duplicate_detected() {
		let dedup = DedupLru::new(4);

		assert!(dedup.insert(1, 10, 0));
		assert!(!dedup.insert(1, 10, 0));

		// Other tracks do not interfere.
		assert!(dedup.insert(2, 10, 0));
	}

	#[test]
	fn lru_evicts_oldest() {
		let dedup = DedupLru::new(2);

		assert!(dedup.insert(1, 0, 0));
		assert!(dedup.insert(1, 0, 1));
		assert!(dedup.insert(1, 0, 2));

		// (0, 0) fell out of the window and counts as new again.
		assert!(dedup.insert(1, 0, 0));
	}
}
