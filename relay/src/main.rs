mod config;

use std::sync::Arc;

use anyhow::Context;
use moq_fabric::coding::Bytes;
use moq_fabric::peering::NodeId;
use moq_fabric::session::{
	AnnounceResponse, ConnectionHandle, FetchAttributes, ObjectHeaders, PublishTrack, SessionApi, SubscribeId,
	SubscribeResponse, SubscribeTrack,
};
use moq_fabric::transport::{MemFabric, MemTransport, Transport, TransportStatus};
use moq_fabric::{FullTrackName, Relay, RelayOptions, TrackNamespace};

use config::Config;

/// Stands in for the MoQ session layer until one is linked against the
/// relay; every client-facing operation is logged and dropped.
struct UnwiredSession;

struct UnwiredPublish;

impl PublishTrack for UnwiredPublish {
	fn publish_object(&self, headers: &ObjectHeaders, _payload: Bytes) {
		tracing::trace!(group = %headers.group_id, object = %headers.object_id, "dropping object, no session layer");
	}
}

impl SessionApi for UnwiredSession {
	fn resolve_announce(
		&self,
		conn: ConnectionHandle,
		namespace: &TrackNamespace,
		notify: &[ConnectionHandle],
		_response: AnnounceResponse,
	) {
		tracing::debug!(%conn, namespace = %namespace.hash64(), notify = %notify.len(), "resolve announce");
	}

	fn resolve_subscribe(&self, conn: ConnectionHandle, subscribe_id: SubscribeId, _response: SubscribeResponse) {
		tracing::debug!(%conn, %subscribe_id, "resolve subscribe");
	}

	fn subscribe_track(&self, conn: ConnectionHandle, _handler: Arc<dyn SubscribeTrack>) {
		tracing::debug!(%conn, "subscribe track");
	}

	fn unsubscribe_track(&self, conn: ConnectionHandle, _handler: Arc<dyn SubscribeTrack>) {
		tracing::debug!(%conn, "unsubscribe track");
	}

	fn update_track_subscription(&self, conn: ConnectionHandle, _handler: Arc<dyn SubscribeTrack>) {
		tracing::debug!(%conn, "update track subscription");
	}

	fn bind_publisher_track(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		_ftn: &FullTrackName,
		_headers: &ObjectHeaders,
	) -> Arc<dyn PublishTrack> {
		tracing::debug!(%conn, %subscribe_id, "bind publisher track");
		Arc::new(UnwiredPublish)
	}

	fn unbind_publisher_track(&self, conn: ConnectionHandle, _track: Arc<dyn PublishTrack>) {
		tracing::debug!(%conn, "unbind publisher track");
	}

	fn bind_fetch_track(
		&self,
		conn: ConnectionHandle,
		subscribe_id: SubscribeId,
		_ftn: &FullTrackName,
		_attrs: &FetchAttributes,
	) -> Arc<dyn PublishTrack> {
		tracing::debug!(%conn, %subscribe_id, "bind fetch track");
		Arc::new(UnwiredPublish)
	}

	fn unbind_fetch_track(&self, conn: ConnectionHandle, _track: Arc<dyn PublishTrack>) {
		tracing::debug!(%conn, "unbind fetch track");
	}
}

fn init_logging(debug: bool) {
	let default = match debug {
		true => "debug",
		false => "info",
	};

	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

	tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::load()?;
	init_logging(config.debug);

	tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting relay");

	// A malformed relay id is fatal at startup only.
	let node_id: NodeId = config.relay_id.parse().context("invalid relay_id")?;

	if let Some(qlog) = &config.qlog {
		tracing::info!(path = %qlog.display(), "qlog enabled");
	}

	let options = RelayOptions {
		node_id: node_id.into(),
		node_type: config.node_type,
		endpoint_id: config.endpoint_id.clone(),
		contact: format!("{}:{}", config.bind_ip, config.port),
		longitude: config.longitude,
		latitude: config.latitude,
		cache: config.cache.clone(),
		peering: config.peering.clone(),
		subscription_refresh_interval_ms: config.subscription_refresh_interval_ms,
	};

	let fabric = MemFabric::new();
	let transport = Arc::new(MemTransport::new(fabric, config.peering.listening_port));

	let relay = Relay::new(options, transport.clone(), Arc::new(UnwiredSession));
	transport.bind(relay.peers.clone());

	if transport.status() != TransportStatus::Ready {
		tracing::error!("transport failed to start");
		std::process::exit(2);
	}

	relay.start();

	tracing::info!(
		id = %NodeId(node_id.into()),
		port = %config.peering.listening_port,
		"relay running"
	);

	tokio::signal::ctrl_c().await?;
	tracing::info!("shutting down");

	Ok(())
}
