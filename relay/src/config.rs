use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use moq_fabric::cache::CacheConfig;
use moq_fabric::peering::{NodeType, PeeringConfig};

#[derive(Parser, Debug)]
#[command(name = "moq-fabric-relay", about = "Media over QUIC relay", version)]
pub struct Cli {
	/// TOML configuration file; CLI flags override its values.
	#[arg(long)]
	pub config: Option<PathBuf>,

	/// Client-facing bind IP.
	#[arg(long, short = 'b')]
	pub bind_ip: Option<String>,

	/// Client-facing listening port.
	#[arg(long, short = 'p')]
	pub port: Option<u16>,

	/// This relay endpoint ID, echoed in MoQ setup.
	#[arg(long, short = 'e')]
	pub endpoint_id: Option<String>,

	/// TLS certificate file.
	#[arg(long, short = 'c')]
	pub cert: Option<PathBuf>,

	/// TLS certificate key file.
	#[arg(long, short = 'k')]
	pub key: Option<PathBuf>,

	/// Enable qlog using the given path prefix.
	#[arg(long, short = 'q')]
	pub qlog: Option<PathBuf>,

	/// Relay node id, `<hi>:<lo>` with optional dotted halves.
	#[arg(long)]
	pub relay_id: Option<String>,

	/// Relay node type: edge, via or stub.
	#[arg(long)]
	pub node_type: Option<NodeType>,

	/// Enable debug logging.
	#[arg(long, short = 'd')]
	pub debug: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Config {
	pub bind_ip: String,
	pub port: u16,

	pub cert: PathBuf,
	pub key: PathBuf,
	pub qlog: Option<PathBuf>,

	pub endpoint_id: String,
	pub relay_id: String,
	pub node_type: NodeType,

	pub longitude: f64,
	pub latitude: f64,

	pub cache: CacheConfig,
	pub peering: PeeringConfig,

	pub subscription_refresh_interval_ms: u64,

	pub debug: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind_ip: "127.0.0.1".to_string(),
			port: 1234,
			cert: "./server-cert.pem".into(),
			key: "./server-key.pem".into(),
			qlog: None,
			endpoint_id: "moq-fabric-relay".to_string(),
			relay_id: "1:1".to_string(),
			node_type: NodeType::Edge,
			longitude: 0.0,
			latitude: 0.0,
			cache: CacheConfig::default(),
			peering: PeeringConfig::default(),
			subscription_refresh_interval_ms: 1_000,
			debug: false,
		}
	}
}

impl Config {
	/// Parse the command line, layer it over the optional TOML file.
	pub fn load() -> anyhow::Result<Self> {
		let cli = Cli::parse();
		Self::from_cli(cli)
	}

	pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
		let mut config = match &cli.config {
			Some(path) => {
				let raw = std::fs::read_to_string(path)
					.with_context(|| format!("reading config file {}", path.display()))?;
				toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?
			}
			None => Self::default(),
		};

		if let Some(bind_ip) = cli.bind_ip {
			config.bind_ip = bind_ip;
		}
		if let Some(port) = cli.port {
			config.port = port;
		}
		if let Some(endpoint_id) = cli.endpoint_id {
			config.endpoint_id = endpoint_id;
		}
		if let Some(cert) = cli.cert {
			config.cert = cert;
		}
		if let Some(key) = cli.key {
			config.key = key;
		}
		if let Some(qlog) = cli.qlog {
			config.qlog = Some(qlog);
		}
		if let Some(relay_id) = cli.relay_id {
			config.relay_id = relay_id;
		}
		if let Some(node_type) = cli.node_type {
			config.node_type = node_type;
		}
		config.debug |= cli.debug;

		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn toml_round_trip() {
		let raw = r#"
			bind_ip = "0.0.0.0"
			port = 4443
			relay_id = "1.2:34"
			node_type = "via"
			subscription_refresh_interval_ms = 500

			[cache]
			max_groups = 4
			object_ttl_ms = 750

			[peering]
			listening_port = 9000
			peers = ["relay-a:9001", "relay-b:9002"]
			check_interval_ms = 3000
		"#;

		let config: Config = toml::from_str(raw).unwrap();
		assert_eq!(config.bind_ip, "0.0.0.0");
		assert_eq!(config.port, 4443);
		assert_eq!(config.node_type, NodeType::Via);
		assert_eq!(config.cache.max_groups, 4);
		assert_eq!(config.cache.object_ttl_ms, 750);
		// Unset keys keep their defaults.
		assert_eq!(config.cache.max_objects_per_group, 200_000);
		assert_eq!(config.peering.peers.len(), 2);
		assert_eq!(config.peering.listening_port, 9000);
		assert_eq!(config.subscription_refresh_interval_ms, 500);
	}

	#[test]
	fn defaults() {
		let config = Config::default();
		assert_eq!(config.port, 1234);
		assert_eq!(config.cache.max_groups, 10);
		assert_eq!(config.peering.check_interval_ms, 2_000);
	}

	#[test]
	fn cli_overrides_file() {
		use std::io::Write;

		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "port = 5000").unwrap();
		writeln!(file, "relay_id = \"7:7\"").unwrap();

		let cli = Cli {
			config: Some(file.path().to_path_buf()),
			bind_ip: None,
			port: Some(6000),
			endpoint_id: None,
			cert: None,
			key: None,
			qlog: None,
			relay_id: None,
			node_type: Some(NodeType::Stub),
			debug: true,
		};

		let config = Config::from_cli(cli).unwrap();
		assert_eq!(config.port, 6000);
		assert_eq!(config.relay_id, "7:7");
		assert_eq!(config.node_type, NodeType::Stub);
		assert!(config.debug);
	}
}
