//! Relay core: owns the shared state, wires the client side to the peering
//! side and starts the background services.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheConfig, ObjectCache};
use crate::client::ClientManager;
use crate::peering::{InfoBase, NodeInfo, NodeType, PeerManager, PeeringConfig};
use crate::session::SessionApi;
use crate::transport::Transport;

#[derive(Clone, Debug)]
pub struct RelayOptions {
	/// Parsed relay id (`<hi>:<lo>` string form).
	pub node_id: u64,
	pub node_type: NodeType,

	/// Opaque self string exchanged in MoQ setup.
	pub endpoint_id: String,

	/// Relay contact address advertised to peers, `host[:port]`.
	pub contact: String,
	pub longitude: f64,
	pub latitude: f64,

	pub cache: CacheConfig,
	pub peering: PeeringConfig,

	pub subscription_refresh_interval_ms: u64,
}

impl Default for RelayOptions {
	fn default() -> Self {
		Self {
			node_id: 0,
			node_type: NodeType::Edge,
			endpoint_id: "moq-fabric-relay".to_string(),
			contact: String::new(),
			longitude: 0.0,
			latitude: 0.0,
			cache: CacheConfig::default(),
			peering: PeeringConfig::default(),
			subscription_refresh_interval_ms: 1_000,
		}
	}
}

/// The assembled relay. The client manager is handed to the MoQ session
/// layer; the peer manager is handed to the transport as its event sink.
pub struct Relay {
	pub client: Arc<ClientManager>,
	pub peers: Arc<PeerManager>,
	pub cache: Arc<ObjectCache>,
	pub info_base: Arc<InfoBase>,
}

impl Relay {
	pub fn new(options: RelayOptions, transport: Arc<dyn Transport>, session: Arc<dyn SessionApi>) -> Arc<Self> {
		let cache = ObjectCache::new(options.cache.clone());
		let info_base = InfoBase::new();

		let client = ClientManager::new(
			options.node_type,
			options.endpoint_id.clone(),
			Duration::from_millis(options.subscription_refresh_interval_ms),
			cache.clone(),
		);

		let node_info = NodeInfo {
			id: options.node_id,
			node_type: options.node_type,
			contact: options.contact.clone(),
			longitude: options.longitude,
			latitude: options.latitude,
			path: Vec::new(),
		};

		let peers = PeerManager::new(options.peering.clone(), node_info, transport, info_base.clone());

		client.bind(session, peers.clone());
		peers.bind_local(client.clone());

		Arc::new(Self {
			client,
			peers,
			cache,
			info_base,
		})
	}

	/// Spawn the cache sweeper and the peer check task, and open outbound
	/// peer sessions. Must run inside a tokio runtime.
	pub fn start(&self) {
		let _sweeper = self.cache.spawn_sweeper(Duration::from_secs(1));
		self.peers.start();
	}
}
