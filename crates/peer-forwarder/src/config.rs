// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::hash_ring::DEFAULT_PEER_PORT;

pub const DEFAULT_CERTIFICATE_FILE_PATH: &str = "config/default_certificate.pem";
pub const DEFAULT_PRIVATE_KEY_FILE_PATH: &str = "config/default_private_key.pem";
pub const MAX_FORWARDING_BATCH_SIZE: usize = 15_000;
pub const MAX_VIRTUAL_NODES_PER_PEER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardingAuthentication {
    MutualTls,
    #[default]
    Unauthenticated,
}

impl ForwardingAuthentication {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "mutual_tls" => Ok(ForwardingAuthentication::MutualTls),
            "unauthenticated" => Ok(ForwardingAuthentication::Unauthenticated),
            other => Err(ConfigError::InvalidConfig(format!(
                "Unknown authentication '{other}'. Must be one of: mutual_tls, unauthenticated"
            ))),
        }
    }
}

/// Authentication is written as a single-key map, e.g. `{"mutual_tls": {}}`.
fn deserialize_authentication<'de, D>(deserializer: D) -> Result<ForwardingAuthentication, D::Error>
where
    D: Deserializer<'de>,
{
    let map: Option<HashMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    let Some(map) = map else {
        return Ok(ForwardingAuthentication::default());
    };
    if map.len() > 1 {
        return Err(serde::de::Error::custom(
            "Invalid authentication configuration.",
        ));
    }
    match map.keys().next() {
        None => Ok(ForwardingAuthentication::default()),
        Some(name) => ForwardingAuthentication::from_name(name).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    #[default]
    LocalNode,
    Static,
    Dns,
}

/// What happens to a batch once every delivery attempt to its owning peer has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingFailurePolicy {
    #[default]
    ProcessLocally,
    DeadLetter,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerForwarderConfiguration {
    pub port: u32,
    /// in milliseconds
    pub request_timeout: u64,
    /// in milliseconds
    pub client_timeout: u64,
    pub server_thread_count: usize,
    pub max_connection_count: usize,
    pub max_pending_requests: usize,
    pub ssl: bool,
    pub ssl_certificate_file: String,
    pub ssl_key_file: String,
    pub ssl_insecure_disable_verification: bool,
    pub ssl_fingerprint_verification_only: bool,
    #[serde(deserialize_with = "deserialize_authentication")]
    pub authentication: ForwardingAuthentication,
    pub discovery_mode: DiscoveryMode,
    pub static_endpoints: Vec<String>,
    pub domain_name: Option<String>,
    /// Address peers use to reach this node. Defaults to `127.0.0.1:<port>`.
    pub local_address: Option<String>,
    pub buffer_size: usize,
    pub batch_size: usize,
    /// in milliseconds
    pub batch_delay: u64,
    /// in milliseconds
    pub drain_timeout: u64,
    /// in milliseconds
    #[serde(rename = "failed_forwarding_requests_local_write_timeout")]
    pub failed_forwarding_local_write_timeout: u64,
    pub forwarding_batch_size: usize,
    /// in milliseconds
    pub forwarding_timeout: u64,
    pub forwarding_max_retries: u32,
    pub forwarding_retry_backoff_base_ms: u64,
    pub forwarding_failure_policy: ForwardingFailurePolicy,
    /// in bytes
    pub max_request_content_length: usize,
    pub virtual_nodes_per_peer: usize,
    /// in milliseconds
    pub peer_refresh_interval: u64,
}

impl Default for PeerForwarderConfiguration {
    fn default() -> Self {
        Self {
            port: u32::from(DEFAULT_PEER_PORT),
            request_timeout: 10_000,
            client_timeout: 60_000,
            server_thread_count: 200,
            max_connection_count: 500,
            max_pending_requests: 1024,
            ssl: true,
            ssl_certificate_file: DEFAULT_CERTIFICATE_FILE_PATH.to_string(),
            ssl_key_file: DEFAULT_PRIVATE_KEY_FILE_PATH.to_string(),
            ssl_insecure_disable_verification: false,
            ssl_fingerprint_verification_only: false,
            authentication: ForwardingAuthentication::Unauthenticated,
            discovery_mode: DiscoveryMode::LocalNode,
            static_endpoints: Vec::new(),
            domain_name: None,
            local_address: None,
            buffer_size: 512,
            batch_size: 48,
            batch_delay: 3_000,
            drain_timeout: 10_000,
            failed_forwarding_local_write_timeout: 500,
            forwarding_batch_size: 1500,
            forwarding_timeout: 10_000,
            forwarding_max_retries: 3,
            forwarding_retry_backoff_base_ms: 100,
            forwarding_failure_policy: ForwardingFailurePolicy::ProcessLocally,
            max_request_content_length: 10 * 1024 * 1024, // 10MB in Bytes
            virtual_nodes_per_peer: 128,
            peer_refresh_interval: 30_000,
        }
    }
}

impl PeerForwarderConfiguration {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Loads the file named by `PEER_FORWARDER_CONFIG` (defaults otherwise), then applies
    /// `PEER_FORWARDER_PORT` and `PEER_FORWARDER_STATIC_ENDPOINTS` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("PEER_FORWARDER_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(port) = env::var("PEER_FORWARDER_PORT") {
            config.port = port.parse::<u32>().map_err(|_| {
                ConfigError::InvalidConfig(format!("PEER_FORWARDER_PORT is not a number: {port}"))
            })?;
        }

        // Comma-separated host:port list
        if let Ok(endpoints) = env::var("PEER_FORWARDER_STATIC_ENDPOINTS") {
            config.discovery_mode = DiscoveryMode::Static;
            config.static_endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|endpoint| !endpoint.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(message: &str) -> Result<(), ConfigError> {
            Err(ConfigError::InvalidConfig(message.to_string()))
        }

        if self.port > 65535 {
            return invalid("Server port should be between 0 and 65535.");
        }
        if self.request_timeout <= 1 {
            return invalid("Request timeout must be a positive integer greater than 1.");
        }
        if self.client_timeout == 0 {
            return invalid("Client timeout must be a positive integer.");
        }
        if self.server_thread_count == 0 {
            return invalid("Server thread count must be a positive integer.");
        }
        if self.max_connection_count == 0 {
            return invalid("Maximum connection count must be a positive integer.");
        }
        if self.max_pending_requests == 0 {
            return invalid("Maximum pending requests must be a positive integer.");
        }
        if self.buffer_size == 0 {
            return invalid("Buffer size must be a positive integer.");
        }
        if self.batch_size == 0 {
            return invalid("Batch size must be a positive integer.");
        }
        if self.failed_forwarding_local_write_timeout == 0 {
            return invalid("Failed forwarding requests local write timeout must be a positive integer.");
        }
        if self.forwarding_batch_size == 0 || self.forwarding_batch_size > MAX_FORWARDING_BATCH_SIZE
        {
            return Err(ConfigError::InvalidConfig(format!(
                "Forwarding batch size must be between 1 and {MAX_FORWARDING_BATCH_SIZE} inclusive."
            )));
        }
        if self.forwarding_timeout == 0 {
            return invalid("Forwarding timeout must be a positive integer.");
        }
        if self.forwarding_max_retries == 0 {
            return invalid("Forwarding max retries must be at least 1.");
        }
        if self.max_request_content_length == 0 {
            return invalid("Maximum request content length must be a positive integer.");
        }
        if self.virtual_nodes_per_peer == 0
            || self.virtual_nodes_per_peer > MAX_VIRTUAL_NODES_PER_PEER
        {
            return Err(ConfigError::InvalidConfig(format!(
                "Virtual nodes per peer must be between 1 and {MAX_VIRTUAL_NODES_PER_PEER} inclusive."
            )));
        }
        if self.peer_refresh_interval == 0 {
            return invalid("Peer refresh interval must be a positive integer.");
        }
        if self.authentication == ForwardingAuthentication::MutualTls && !self.ssl {
            return invalid("Mutual TLS is only available when SSL is enabled.");
        }
        if self.discovery_mode == DiscoveryMode::Dns
            && self.domain_name.as_deref().map_or(true, str::is_empty)
        {
            return invalid("Domain name cannot be null if discover mode is DNS.");
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        // validate() bounds the port to u16
        u16::try_from(self.port).unwrap_or(u16::MAX)
    }

    pub fn local_address(&self) -> String {
        self.local_address
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.port))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout)
    }

    pub fn failed_forwarding_local_write_timeout(&self) -> Duration {
        Duration::from_millis(self.failed_forwarding_local_write_timeout)
    }

    pub fn forwarding_timeout(&self) -> Duration {
        Duration::from_millis(self.forwarding_timeout)
    }

    pub fn peer_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.peer_refresh_interval)
    }

    pub fn is_mutual_tls(&self) -> bool {
        self.ssl && self.authentication == ForwardingAuthentication::MutualTls
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PeerForwarderConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port(), 4994);
        assert_eq!(config.local_address(), "127.0.0.1:4994");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(config.ssl);
        assert!(!config.is_mutual_tls());
    }

    #[test]
    fn test_from_json_uses_snake_case_property_names() {
        let config = PeerForwarderConfiguration::from_json(
            r#"{
                "port": 21890,
                "request_timeout": 2000,
                "ssl": true,
                "authentication": {"mutual_tls": {}},
                "ssl_fingerprint_verification_only": true,
                "discovery_mode": "static",
                "static_endpoints": ["10.0.0.1", "10.0.0.2:4994"],
                "failed_forwarding_requests_local_write_timeout": 250,
                "forwarding_failure_policy": "dead_letter"
            }"#,
        )
        .unwrap();

        assert_eq!(config.port(), 21890);
        assert_eq!(config.request_timeout(), Duration::from_millis(2000));
        assert!(config.is_mutual_tls());
        assert!(config.ssl_fingerprint_verification_only);
        assert_eq!(config.discovery_mode, DiscoveryMode::Static);
        assert_eq!(config.static_endpoints.len(), 2);
        assert_eq!(
            config.failed_forwarding_local_write_timeout(),
            Duration::from_millis(250)
        );
        assert_eq!(
            config.forwarding_failure_policy,
            ForwardingFailurePolicy::DeadLetter
        );
        // untouched keys keep their defaults
        assert_eq!(config.buffer_size, 512);
    }

    #[test]
    fn test_authentication_accepts_null_body() {
        let config =
            PeerForwarderConfiguration::from_json(r#"{"authentication": {"mutual_tls": null}}"#)
                .unwrap();
        assert_eq!(config.authentication, ForwardingAuthentication::MutualTls);
    }

    #[test]
    fn test_authentication_rejects_multiple_entries() {
        let result = PeerForwarderConfiguration::from_json(
            r#"{"authentication": {"mutual_tls": {}, "unauthenticated": {}}}"#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_authentication_rejects_unknown_name() {
        let result =
            PeerForwarderConfiguration::from_json(r#"{"authentication": {"http_basic": {}}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_mutual_tls_requires_ssl() {
        let result = PeerForwarderConfiguration::from_json(
            r#"{"ssl": false, "authentication": {"mutual_tls": {}}}"#,
        );
        assert_eq!(
            result.unwrap_err().to_string(),
            "Invalid configuration: Mutual TLS is only available when SSL is enabled."
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let cases = [
            r#"{"port": 70000}"#,
            r#"{"request_timeout": 1}"#,
            r#"{"client_timeout": 0}"#,
            r#"{"server_thread_count": 0}"#,
            r#"{"max_connection_count": 0}"#,
            r#"{"buffer_size": 0}"#,
            r#"{"forwarding_batch_size": 15001}"#,
            r#"{"forwarding_max_retries": 0}"#,
            r#"{"virtual_nodes_per_peer": 0}"#,
            r#"{"discovery_mode": "dns"}"#,
        ];
        for case in cases {
            assert!(
                PeerForwarderConfiguration::from_json(case).is_err(),
                "expected {case} to be rejected"
            );
        }
    }

    #[test]
    fn test_from_file_missing() {
        let result = PeerForwarderConfiguration::from_file("/does/not/exist.json");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        env::remove_var("PEER_FORWARDER_CONFIG");
        env::remove_var("PEER_FORWARDER_PORT");
        env::remove_var("PEER_FORWARDER_STATIC_ENDPOINTS");
        let config = PeerForwarderConfiguration::from_env().unwrap();
        assert_eq!(config.port(), 4994);
        assert_eq!(config.discovery_mode, DiscoveryMode::LocalNode);
    }

    #[test]
    #[serial]
    fn test_from_env_file_and_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ssl": false, "buffer_size": 64}}"#).unwrap();

        env::set_var("PEER_FORWARDER_CONFIG", file.path());
        env::set_var("PEER_FORWARDER_PORT", "5995");
        env::set_var("PEER_FORWARDER_STATIC_ENDPOINTS", "10.0.0.1:5995, 10.0.0.2:5995,");
        let config = PeerForwarderConfiguration::from_env().unwrap();
        env::remove_var("PEER_FORWARDER_CONFIG");
        env::remove_var("PEER_FORWARDER_PORT");
        env::remove_var("PEER_FORWARDER_STATIC_ENDPOINTS");

        assert!(!config.ssl);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.port(), 5995);
        assert_eq!(config.discovery_mode, DiscoveryMode::Static);
        assert_eq!(
            config.static_endpoints,
            vec!["10.0.0.1:5995".to_string(), "10.0.0.2:5995".to_string()]
        );
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_port() {
        env::remove_var("PEER_FORWARDER_CONFIG");
        env::set_var("PEER_FORWARDER_PORT", "not_a_port");
        let config = PeerForwarderConfiguration::from_env();
        env::remove_var("PEER_FORWARDER_PORT");
        assert_eq!(
            config.unwrap_err().to_string(),
            "Invalid configuration: PEER_FORWARDER_PORT is not a number: not_a_port"
        );
    }
}
