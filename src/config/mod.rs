use crate::client::{AssociationConfiguration, DimseClient, RetryPolicy};
use crate::error::ValidationError;
use crate::types::{AeTitle, Priority};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;
use tracing::Level;

/// Settings of the command line client.
///
/// Sources in increasing precedence: the embedded `defaults.toml`, an optional `config.toml`
/// in the working directory and `DICOM_SCU_*` environment variables, where `__` separates
/// nested keys (e.g. `DICOM_SCU_CLIENT__AET=MY_SCU`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub client: ClientConfig,
	#[serde(default)]
	pub peers: HashMap<String, PeerConfig>,
}

impl AppConfig {
	pub fn new() -> Result<Self, config::ConfigError> {
		Self::builder()
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(
				config::Environment::with_prefix("DICOM_SCU")
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?
			.try_deserialize()
	}

	fn builder() -> config::ConfigBuilder<config::builder::DefaultState> {
		config::Config::builder().add_source(config::File::from_str(
			include_str!("defaults.toml"),
			config::FileFormat::Toml,
		))
	}

	/// Looks up a peer from the `peers` table.
	pub fn peer(&self, name: &str) -> Result<&PeerConfig, ValidationError> {
		self.peers
			.get(name)
			.ok_or_else(|| ValidationError::Configuration(format!("no peer named '{name}' is configured")))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	#[serde(deserialize_with = "deserialize_level")]
	pub level: Level,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
	/// Calling AE title of this client.
	pub aet: AeTitle,
	/// Timeout in seconds.
	pub timeout: u64,
	pub max_pdu_length: u32,
	pub priority: Priority,
	#[serde(default)]
	pub retry: RetryPolicy,
}

impl ClientConfig {
	/// Applies timeout and max PDU length to an operation configuration.
	pub fn apply<C: AssociationConfiguration>(&self, configuration: C) -> Result<C, ValidationError> {
		configuration
			.with_timeout(Duration::from_secs(self.timeout))?
			.with_max_pdu_length(self.max_pdu_length)
	}
}

/// A remote application entity.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
	pub aet: AeTitle,
	pub host: String,
	pub port: u16,
}

impl PeerConfig {
	pub fn client(&self, retry_policy: RetryPolicy) -> DimseClient {
		DimseClient::new(&self.host, self.port).with_retry_policy(retry_policy)
	}
}

fn deserialize_level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
	let value = String::deserialize(deserializer)?;
	value.parse().map_err(serde::de::Error::custom)
}
