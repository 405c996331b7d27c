//! Peering information base: every node heard about, the best session to
//! reach each one, and the subscribe/announce indexes exchanged between
//! relays.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::track::TrackNamespace;

use super::{AnnounceInfo, NodeId, PeerSession, PeerSessionId, PeerStatus, SubscribeInfo};

pub struct NodeItem {
	pub session: Weak<PeerSession>,
	pub info: super::NodeInfo,
}

#[derive(Default)]
struct Tables {
	/// Every node info received, keyed by (node id, peer session id).
	/// Duplicates per session are replaced by the most recent.
	nodes: BTreeMap<(u64, PeerSessionId), NodeItem>,

	/// Best session per node; the data plane toward that node.
	nodes_best: HashMap<u64, Weak<PeerSession>>,

	/// Reverse index for cleanup on session death.
	nodes_by_session: BTreeMap<PeerSessionId, BTreeSet<u64>>,

	/// Remote subscribers per track fullname hash, by source node.
	subscribes: HashMap<u64, BTreeMap<u64, SubscribeInfo>>,

	/// Remote announcements per track fullname hash, by source node.
	announces: HashMap<u64, BTreeMap<u64, AnnounceInfo>>,

	/// Namespace prefix hash → announced fullname hashes under it.
	prefix_lookup_announces: HashMap<u64, HashSet<u64>>,
}

pub struct InfoBase {
	tables: Mutex<Tables>,
}

fn session_alive(weak: &Weak<PeerSession>) -> Option<Arc<PeerSession>> {
	weak.upgrade().filter(|session| session.status() != PeerStatus::Disconnected)
}

impl InfoBase {
	#[allow(clippy::new_without_default)]
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			tables: Mutex::new(Tables::default()),
		})
	}

	/// Add or update a node; returns true iff the best session for it
	/// changed.
	pub fn add_node(&self, session: &Arc<PeerSession>, info: super::NodeInfo) -> bool {
		let session_id = session.session_id();
		let node_id = info.id;

		let mut tables = self.tables.lock();

		tables.nodes.insert(
			(node_id, session_id),
			NodeItem {
				session: Arc::downgrade(session),
				info,
			},
		);
		tables.nodes_by_session.entry(session_id).or_default().insert(node_id);

		Self::select_best(&mut tables, node_id)
	}

	/// Remove one node entry; re-selects when it was the best.
	pub fn remove_node(&self, session_id: PeerSessionId, node_id: u64) -> bool {
		let mut tables = self.tables.lock();

		if let Some(ids) = tables.nodes_by_session.get_mut(&session_id) {
			ids.remove(&node_id);
			if ids.is_empty() {
				tables.nodes_by_session.remove(&session_id);
			}
		}

		let removed = tables.nodes.remove(&(node_id, session_id));
		let was_best = tables
			.nodes_best
			.get(&node_id)
			.and_then(session_alive)
			.is_none_or(|best| best.session_id() == session_id);

		match removed.is_some() && was_best {
			true => Self::select_best(&mut tables, node_id),
			false => false,
		}
	}

	/// Remove every node learned through the session and every subscribe
	/// node set bound to it. Returns the node ids whose best changed.
	pub fn purge_peer_session(&self, session_id: PeerSessionId) -> Vec<u64> {
		let mut tables = self.tables.lock();
		let mut changed = Vec::new();

		let node_ids = match tables.nodes_by_session.remove(&session_id) {
			Some(ids) => ids,
			None => return changed,
		};

		for node_id in node_ids {
			tables.nodes.remove(&(node_id, session_id));
			if Self::select_best(&mut tables, node_id) {
				changed.push(node_id);
			}
		}

		changed
	}

	pub fn best_session(&self, node_id: u64) -> Option<Arc<PeerSession>> {
		let tables = self.tables.lock();
		tables.nodes_best.get(&node_id).and_then(session_alive)
	}

	/// All node ids with a live best session, with their node info as
	/// learned through it.
	pub fn best_nodes(&self) -> Vec<(super::NodeInfo, Arc<PeerSession>)> {
		let tables = self.tables.lock();

		tables
			.nodes_best
			.iter()
			.filter_map(|(node_id, weak)| {
				let session = session_alive(weak)?;
				let item = tables.nodes.get(&(*node_id, session.session_id()))?;
				Some((item.info.clone(), session))
			})
			.collect()
	}

	/// Pick the best session to reach `node_id`: fewer path hops first,
	/// then lower sRTT sum. Pure over the set of alive sessions; returns
	/// true iff the recorded best changed.
	fn select_best(tables: &mut Tables, node_id: u64) -> bool {
		let mut winner: Option<(usize, u64, Arc<PeerSession>)> = None;

		for (key, item) in tables.nodes.range((node_id, 0)..=(node_id, PeerSessionId::MAX)) {
			debug_assert_eq!(key.0, node_id);

			let session = match session_alive(&item.session) {
				Some(session) => session,
				None => continue,
			};

			let candidate = (item.info.path.len(), item.info.sum_srtt());
			let better = match &winner {
				None => true,
				Some((hops, srtt, _)) => candidate < (*hops, *srtt),
			};

			if better {
				winner = Some((candidate.0, candidate.1, session));
			}
		}

		let previous = tables.nodes_best.get(&node_id).and_then(session_alive);

		match winner {
			Some((hops, srtt, session)) => {
				let changed = previous.is_none_or(|prev| !Arc::ptr_eq(&prev, &session));
				if changed {
					tracing::debug!(
						node = %NodeId(node_id),
						session = %session.session_id(),
						%hops,
						sum_srtt = %srtt,
						"best peer session updated"
					);
					tables.nodes_best.insert(node_id, Arc::downgrade(&session));
				}
				changed
			}
			None => {
				let had = tables.nodes_best.remove(&node_id).is_some();
				if had {
					tracing::debug!(node = %NodeId(node_id), "no peer session left for node");
				}
				had && previous.is_some()
			}
		}
	}

	/// Last-writer-wins on seq: identical seq is a no-op, anything else
	/// overwrites. Returns true when the entry changed.
	pub fn add_subscribe(&self, info: SubscribeInfo) -> bool {
		let mut tables = self.tables.lock();
		let by_source = tables.subscribes.entry(info.track_hash.fullname).or_default();

		match by_source.get_mut(&info.source_node_id) {
			Some(existing) if existing.seq == info.seq => false,
			Some(existing) => {
				*existing = info;
				true
			}
			None => {
				by_source.insert(info.source_node_id, info);
				true
			}
		}
	}

	pub fn remove_subscribe(&self, fullname: u64, source_node_id: u64) -> Option<SubscribeInfo> {
		let mut tables = self.tables.lock();

		let by_source = tables.subscribes.get_mut(&fullname)?;
		let removed = by_source.remove(&source_node_id);
		if by_source.is_empty() {
			tables.subscribes.remove(&fullname);
		}
		removed
	}

	pub fn get_subscribe(&self, fullname: u64, source_node_id: u64) -> Option<SubscribeInfo> {
		let tables = self.tables.lock();
		tables.subscribes.get(&fullname)?.get(&source_node_id).cloned()
	}

	/// Remote subscribers for a track, excluding one node (usually self).
	pub fn subscribes_for_track(&self, fullname: u64, exclude_node: u64) -> Vec<SubscribeInfo> {
		let tables = self.tables.lock();
		match tables.subscribes.get(&fullname) {
			Some(by_source) => by_source
				.values()
				.filter(|info| info.source_node_id != exclude_node)
				.cloned()
				.collect(),
			None => Vec::new(),
		}
	}

	pub fn subscribes_snapshot(&self) -> Vec<SubscribeInfo> {
		let tables = self.tables.lock();
		tables.subscribes.values().flat_map(|m| m.values().cloned()).collect()
	}

	/// True when another node subscribes to the track.
	pub fn has_subscribers(&self, fullname: u64, exclude_node: u64) -> bool {
		let tables = self.tables.lock();
		match tables.subscribes.get(&fullname) {
			Some(by_source) => by_source.keys().any(|source| *source != exclude_node),
			None => false,
		}
	}

	/// Add an announcement and index every prefix of its namespace.
	pub fn add_announce(&self, info: AnnounceInfo) -> bool {
		let fullname = info.track_hash().fullname;
		let mut tables = self.tables.lock();

		let by_source = tables.announces.entry(fullname).or_default();
		if by_source.contains_key(&info.source_node_id) {
			return false;
		}

		let prefixes = info.namespace.prefix_hashes();
		by_source.insert(info.source_node_id, info);

		for prefix in prefixes {
			tables.prefix_lookup_announces.entry(prefix).or_default().insert(fullname);
		}

		true
	}

	pub fn remove_announce(&self, info: &AnnounceInfo) -> bool {
		let fullname = info.track_hash().fullname;
		let mut tables = self.tables.lock();

		let by_source = match tables.announces.get_mut(&fullname) {
			Some(by_source) => by_source,
			None => return false,
		};

		if by_source.remove(&info.source_node_id).is_none() {
			return false;
		}

		let last_for_track = by_source.is_empty();
		if last_for_track {
			tables.announces.remove(&fullname);

			// The prefix index tracks fullnames, so it only shrinks when
			// the last source for the track goes away.
			for prefix in info.namespace.prefix_hashes() {
				if let Some(set) = tables.prefix_lookup_announces.get_mut(&prefix) {
					set.remove(&fullname);
					if set.is_empty() {
						tables.prefix_lookup_announces.remove(&prefix);
					}
				}
			}
		}

		true
	}

	pub fn announces_snapshot(&self) -> Vec<AnnounceInfo> {
		let tables = self.tables.lock();
		tables.announces.values().flat_map(|m| m.values().cloned()).collect()
	}

	pub fn announces_matching<F: Fn(&AnnounceInfo) -> bool>(&self, filter: F) -> Vec<AnnounceInfo> {
		let tables = self.tables.lock();
		tables
			.announces
			.values()
			.flat_map(|m| m.values())
			.filter(|info| filter(info))
			.cloned()
			.collect()
	}

	/// Source nodes announcing the track. Tries the exact fullname first;
	/// unless `exact`, falls back to the longest matching namespace prefix.
	pub fn get_announce_ids(&self, namespace: &TrackNamespace, name: &Bytes, exact: bool) -> BTreeSet<u64> {
		let ftn = crate::track::FullTrackName::new(namespace.clone(), name.clone());
		let fullname = crate::track::TrackHash::new(&ftn).fullname;

		let tables = self.tables.lock();

		let mut ids: BTreeSet<u64> = match tables.announces.get(&fullname) {
			Some(by_source) => by_source.keys().copied().collect(),
			None => BTreeSet::new(),
		};

		if !ids.is_empty() || exact {
			return ids;
		}

		// Longest prefix first.
		for prefix in namespace.prefix_hashes().into_iter().rev() {
			let fullnames = match tables.prefix_lookup_announces.get(&prefix) {
				Some(fullnames) => fullnames,
				None => continue,
			};

			for fullname in fullnames {
				if let Some(by_source) = tables.announces.get(fullname) {
					ids.extend(by_source.keys().copied());
				}
			}

			if !ids.is_empty() {
				return ids;
			}
		}

		ids
	}
}
