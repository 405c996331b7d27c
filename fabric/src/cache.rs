//! Short-lived per-track object cache.
//!
//! Each track keeps a ring of its most recent groups, used to answer
//! fetches and to prime late subscribers with the largest available object.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::session::ObjectHeaders;
use crate::track::TrackAlias;

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
	/// Number of group slots in each track's ring.
	pub max_groups: usize,

	/// Largest number of objects kept per group.
	pub max_objects_per_group: usize,

	/// Lifetime of a cached object when its headers carry no TTL.
	pub object_ttl_ms: u32,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			max_groups: 10,
			max_objects_per_group: 200_000,
			object_ttl_ms: 5_000,
		}
	}
}

#[derive(Clone, Debug)]
pub struct CachedObject {
	pub headers: ObjectHeaders,
	pub payload: Bytes,
	expires: Instant,
}

#[derive(Clone, Debug)]
pub struct CachedGroup {
	pub group_id: u64,
	pub objects: Vec<CachedObject>,
}

#[derive(Default)]
struct TrackCache {
	/// Oldest group first; group ids are non-decreasing across the ring.
	groups: Vec<CachedGroup>,
}

pub struct ObjectCache {
	config: CacheConfig,
	tracks: Mutex<HashMap<TrackAlias, TrackCache>>,
}

impl ObjectCache {
	pub fn new(config: CacheConfig) -> Arc<Self> {
		Arc::new(Self {
			config,
			tracks: Mutex::new(HashMap::new()),
		})
	}

	/// Append an object; returns false when it was dropped as a duplicate,
	/// too old for the ring, or past the group capacity.
	pub fn put(&self, alias: TrackAlias, headers: &ObjectHeaders, payload: Bytes) -> bool {
		let ttl = headers.ttl_ms.unwrap_or(self.config.object_ttl_ms);
		let object = CachedObject {
			headers: *headers,
			payload,
			expires: Instant::now() + Duration::from_millis(ttl as u64),
		};

		let mut tracks = self.tracks.lock();
		let track = tracks.entry(alias).or_default();

		let newest = track.groups.last().map(|g| g.group_id);
		if newest.is_none_or(|id| headers.group_id > id) {
			track.groups.push(CachedGroup {
				group_id: headers.group_id,
				objects: vec![object],
			});

			if track.groups.len() > self.config.max_groups {
				track.groups.remove(0);
			}
			return true;
		}

		let group = match track.groups.iter_mut().rev().find(|g| g.group_id == headers.group_id) {
			Some(group) => group,
			// Older than the ring tail.
			None => return false,
		};

		if group.objects.len() >= self.config.max_objects_per_group {
			tracing::debug!(%alias, group = %headers.group_id, "group at capacity, dropping object");
			return false;
		}

		match group.objects.binary_search_by_key(&headers.object_id, |o| o.headers.object_id) {
			// At most once per (alias, group, object).
			Ok(_) => false,
			Err(pos) => {
				group.objects.insert(pos, object);
				true
			}
		}
	}

	/// Largest (group_id, object_id) currently cached for the track.
	pub fn last(&self, alias: TrackAlias) -> Option<(u64, u64)> {
		let tracks = self.tracks.lock();
		let track = tracks.get(&alias)?;
		let group = track.groups.last()?;
		let object = group.objects.last()?;
		Some((group.group_id, object.headers.object_id))
	}

	/// Snapshot of the groups in `[start_group, end_group)`, oldest first.
	/// May be empty; callers must tolerate that.
	pub fn get(&self, alias: TrackAlias, start_group: u64, end_group: u64) -> Vec<CachedGroup> {
		let tracks = self.tracks.lock();
		match tracks.get(&alias) {
			Some(track) => track
				.groups
				.iter()
				.filter(|g| g.group_id >= start_group && g.group_id < end_group)
				.cloned()
				.collect(),
			None => Vec::new(),
		}
	}

	/// Drop objects whose TTL elapsed, then empty groups and tracks.
	pub fn sweep(&self) {
		let now = Instant::now();
		let mut tracks = self.tracks.lock();

		tracks.retain(|_, track| {
			track.groups.retain_mut(|group| {
				group.objects.retain(|object| object.expires > now);
				!group.objects.is_empty()
			});
			!track.groups.is_empty()
		});
	}

	/// Background sweep at `interval`; stops when the cache is dropped.
	pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
		let cache = Arc::downgrade(self);

		tokio::spawn(async move {
			loop {
				tokio::time::sleep(interval).await;
				match cache.upgrade() {
					Some(cache) => cache.sweep(),
					None => return,
				}
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::session::TrackMode;

	fn headers(group_id: u64, object_id: u64) -> ObjectHeaders {
		ObjectHeaders {
			group_id,
			object_id,
			priority: 1,
			ttl_ms: None,
			track_mode: TrackMode::Stream,
		}
	}

	fn cache(max_groups: usize) -> Arc<ObjectCache> {
		ObjectCache::new(CacheConfig {
			max_groups,
			..Default::default()
		})
	}

	#[test]
	fn last_and_range() {
		let cache = cache(10);

		for group in 10..=12 {
			for object in 0..3 {
				assert!(cache.put(7, &headers(group, object), Bytes::from_static(b"x")));
			}
		}

		assert_eq!(cache.last(7), Some((12, 2)));
		assert_eq!(cache.last(8), None);

		let groups = cache.get(7, 10, 12);
		assert_eq!(groups.len(), 2);
		assert_eq!(groups[0].group_id, 10);
		assert_eq!(groups[1].group_id, 11);
		assert_eq!(groups[0].objects.len(), 3);

		assert!(cache.get(7, 13, 20).is_empty());
	}

	#[test]
	fn ring_evicts_oldest() {
		let cache = cache(3);

		for group in 0..5 {
			cache.put(1, &headers(group, 0), Bytes::new());
		}

		assert!(cache.get(1, 0, 2).is_empty());
		assert_eq!(cache.get(1, 0, 10).len(), 3);
		assert_eq!(cache.last(1), Some((4, 0)));

		// A put for an evicted group is dropped.
		assert!(!cache.put(1, &headers(0, 1), Bytes::new()));
	}

	#[test]
	fn duplicates_dropped() {
		let cache = cache(10);

		assert!(cache.put(1, &headers(5, 1), Bytes::from_static(b"a")));
		assert!(!cache.put(1, &headers(5, 1), Bytes::from_static(b"b")));

		// Out-of-order objects are kept sorted within the group.
		assert!(cache.put(1, &headers(5, 0), Bytes::new()));
		let groups = cache.get(1, 5, 6);
		let ids: Vec<u64> = groups[0].objects.iter().map(|o| o.headers.object_id).collect();
		assert_eq!(ids, vec![0, 1]);
	}

	#[test]
	fn sweep_expires_objects() {
		let cache = cache(10);

		let mut expired = headers(1, 0);
		expired.ttl_ms = Some(0);
		cache.put(1, &expired, Bytes::new());
		cache.put(1, &headers(2, 0), Bytes::new());

		std::thread::sleep(Duration::from_millis(5));
		cache.sweep();

		assert!(cache.get(1, 1, 2).is_empty());
		assert_eq!(cache.last(1), Some((2, 0)));
	}
}
