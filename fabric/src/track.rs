use bytes::Bytes;

/// 64-bit hash that stands in for a full track name on the wire.
pub type TrackAlias = u64;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over a byte string.
fn hash_bytes(data: &[u8]) -> u64 {
	let mut hash = FNV_OFFSET;
	for b in data {
		hash ^= *b as u64;
		hash = hash.wrapping_mul(FNV_PRIME);
	}
	hash
}

/// Fold another hash into a running seed.
pub fn hash_combine(seed: u64, hash: u64) -> u64 {
	seed ^ hash
		.wrapping_add(0x9e37_79b9)
		.wrapping_add(seed << 6)
		.wrapping_add(seed >> 2)
}

/// An ordered sequence of byte-string tuples naming a publisher scope.
///
/// Namespaces compare exactly and by prefix; a namespace with fewer tuples
/// may be a prefix of a deeper one.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackNamespace(Vec<Bytes>);

impl TrackNamespace {
	pub fn new<T: Into<Bytes>, I: IntoIterator<Item = T>>(tuples: I) -> Self {
		Self(tuples.into_iter().map(Into::into).collect())
	}

	pub fn tuples(&self) -> &[Bytes] {
		&self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// True when `prefix` is a (non-strict) prefix of this namespace.
	pub fn has_prefix(&self, prefix: &TrackNamespace) -> bool {
		prefix.0.len() <= self.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
	}

	/// Running hash combine over all tuples.
	pub fn hash64(&self) -> u64 {
		self.0.iter().fold(0, |seed, tuple| hash_combine(seed, hash_bytes(tuple)))
	}

	/// Running hash for every prefix length, shortest first.
	///
	/// `prefix_hashes()[i]` covers the first `i + 1` tuples; the last entry
	/// equals [Self::hash64].
	pub fn prefix_hashes(&self) -> Vec<u64> {
		let mut seed = 0;
		self.0
			.iter()
			.map(|tuple| {
				seed = hash_combine(seed, hash_bytes(tuple));
				seed
			})
			.collect()
	}
}

/// (namespace, name) address of a single object track.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FullTrackName {
	pub namespace: TrackNamespace,
	pub name: Bytes,
}

impl FullTrackName {
	pub fn new<N: Into<Bytes>>(namespace: TrackNamespace, name: N) -> Self {
		Self {
			namespace,
			name: name.into(),
		}
	}
}

/// Derived hash triple for a full track name.
///
/// The fullname hash doubles as the track alias and is masked to 62 bits so
/// it always fits in a varint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackHash {
	pub namespace: u64,
	pub name: u64,
	pub fullname: u64,
}

impl TrackHash {
	pub fn new(ftn: &FullTrackName) -> Self {
		let namespace = ftn.namespace.hash64();
		let name = hash_bytes(&ftn.name);
		let fullname = (hash_combine(namespace, name) << 2) >> 2;

		Self {
			namespace,
			name,
			fullname,
		}
	}
}

impl From<&FullTrackName> for TrackHash {
	fn from(ftn: &FullTrackName) -> Self {
		Self::new(ftn)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ns(tuples: &[&str]) -> TrackNamespace {
		TrackNamespace::new(tuples.iter().map(|t| Bytes::copy_from_slice(t.as_bytes())))
	}

	#[test]
	fn prefix_matching() {
		let full = ns(&["a", "b", "c"]);

		assert!(full.has_prefix(&ns(&["a"])));
		assert!(full.has_prefix(&ns(&["a", "b"])));
		assert!(full.has_prefix(&full));
		assert!(!full.has_prefix(&ns(&["b"])));
		assert!(!full.has_prefix(&ns(&["a", "b", "c", "d"])));
	}

	#[test]
	fn prefix_hash_chain() {
		let full = ns(&["a", "b", "c"]);
		let hashes = full.prefix_hashes();

		assert_eq!(hashes.len(), 3);
		assert_eq!(hashes[0], ns(&["a"]).hash64());
		assert_eq!(hashes[1], ns(&["a", "b"]).hash64());
		assert_eq!(hashes[2], full.hash64());

		// Sibling namespaces diverge from the shared prefix.
		assert_ne!(hashes[2], ns(&["a", "b", "d"]).hash64());
	}

	#[test]
	fn alias_fits_in_varint() {
		let th = TrackHash::new(&FullTrackName::new(ns(&["a", "b"]), "video"));
		assert!(th.fullname < (1 << 62));

		// Deterministic for equal names.
		let th2 = TrackHash::new(&FullTrackName::new(ns(&["a", "b"]), "video"));
		assert_eq!(th, th2);

		// The name participates in the fullname hash.
		let th3 = TrackHash::new(&FullTrackName::new(ns(&["a", "b"]), "audio"));
		assert_eq!(th.namespace, th3.namespace);
		assert_ne!(th.fullname, th3.fullname);
	}
}
