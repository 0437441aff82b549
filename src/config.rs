//! Process configuration, read from `FHIR_BRIDGE_*` environment variables.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::types::{InvalidIdentifier, ResourceType};

const ENV_PREFIX: &str = "FHIR_BRIDGE_";

const DEFAULT_LISTEN_PORT: u16 = 8080;
const DEFAULT_RESOURCE_TYPES: &str = "Patient,ServiceRequest";
const DEFAULT_CHECKPOINT_FILE: &str = "data/checkpoints.properties";
const DEFAULT_OVERLAP_MS: u64 = 15_000;
const DEFAULT_INITIAL_DELAY_SECS: u64 = 10;
const DEFAULT_POLL_DELAY_SECS: u64 = 60;
const DEFAULT_GATE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(String),

    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("{var}: {source}")]
    InvalidResourceType {
        var: String,
        #[source]
        source: InvalidIdentifier,
    },

    #[error("{present} is set but {missing} is not")]
    IncompleteCredentials { present: String, missing: String },
}

/// HTTP Basic credentials. `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        BasicCredentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The value of an `Authorization` header carrying these credentials.
    pub fn authorization_header(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {token}")
    }
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Connection settings for one FHIR server.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub base_url: String,
    pub credentials: Option<BasicCredentials>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen_addr: SocketAddr,
    pub source: EndpointConfig,
    pub downstream: EndpointConfig,

    /// Callback base URL registered in the subscription. Its credentials are
    /// both sent by the source and required on inbound webhook calls.
    pub webhook: EndpointConfig,

    pub resource_types: Vec<ResourceType>,
    pub checkpoint_file: PathBuf,
    pub overlap: Duration,
    pub initial_delay: Duration,
    pub poll_delay: Duration,
    pub gate_timeout: Duration,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_parallel_writes: usize,
}

impl BridgeConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a full variable
    /// name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let listen_addr: SocketAddr =
            env.parsed("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)))?;
        let source = env.endpoint("SOURCE")?;
        let downstream = env.endpoint("DOWNSTREAM")?;
        let webhook = env.endpoint("WEBHOOK")?;

        let types_raw = env
            .get("RESOURCE_TYPES")
            .unwrap_or_else(|| DEFAULT_RESOURCE_TYPES.to_string());
        let resource_types = parse_resource_types(&types_raw).map_err(|source| {
            ConfigError::InvalidResourceType {
                var: var_name("RESOURCE_TYPES"),
                source,
            }
        })?;
        if resource_types.is_empty() {
            return Err(ConfigError::Invalid {
                var: var_name("RESOURCE_TYPES"),
                value: types_raw,
                reason: "no resource types listed".to_string(),
            });
        }

        let checkpoint_file = env
            .get("CHECKPOINT_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_FILE));

        let default_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let max_parallel_writes: usize = env.parsed("MAX_PARALLEL_WRITES", default_parallelism)?;
        if max_parallel_writes == 0 {
            return Err(ConfigError::Invalid {
                var: var_name("MAX_PARALLEL_WRITES"),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(BridgeConfig {
            listen_addr,
            source,
            downstream,
            webhook,
            resource_types,
            checkpoint_file,
            overlap: Duration::from_millis(env.parsed("OVERLAP_MS", DEFAULT_OVERLAP_MS)?),
            initial_delay: env.secs("INITIAL_DELAY_SECS", DEFAULT_INITIAL_DELAY_SECS)?,
            poll_delay: env.secs("POLL_DELAY_SECS", DEFAULT_POLL_DELAY_SECS)?,
            gate_timeout: env.secs("GATE_TIMEOUT_SECS", DEFAULT_GATE_TIMEOUT_SECS)?,
            http_timeout: env.secs("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?,
            connect_timeout: env.secs("CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
            max_parallel_writes,
        })
    }
}

/// Parses a comma-separated resource type list, ignoring blanks and duplicates.
pub fn parse_resource_types(raw: &str) -> Result<Vec<ResourceType>, InvalidIdentifier> {
    let mut types: Vec<ResourceType> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parsed = ResourceType::parse(name)?;
        if !types.contains(&parsed) {
            types.push(parsed);
        }
    }
    Ok(types)
}

fn var_name(suffix: &str) -> String {
    format!("{ENV_PREFIX}{suffix}")
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&var_name(suffix))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, suffix: &str) -> Result<String, ConfigError> {
        self.get(suffix)
            .ok_or_else(|| ConfigError::Missing(var_name(suffix)))
    }

    fn parsed<T>(&self, suffix: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        match self.get(suffix) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: var_name(suffix),
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, suffix: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parsed(suffix, default).map(Duration::from_secs)
    }

    fn endpoint(&self, prefix: &str) -> Result<EndpointConfig, ConfigError> {
        let url_var = format!("{prefix}_URL");
        let base_url = self.required(&url_var)?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                var: var_name(&url_var),
                value: base_url,
                reason: "expected an http:// or https:// URL".to_string(),
            });
        }

        let user_var = format!("{prefix}_USERNAME");
        let pass_var = format!("{prefix}_PASSWORD");
        let credentials = match (self.get(&user_var), self.get(&pass_var)) {
            (Some(user), Some(pass)) => Some(BasicCredentials::new(user, pass)),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::IncompleteCredentials {
                    present: var_name(&user_var),
                    missing: var_name(&pass_var),
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::IncompleteCredentials {
                    present: var_name(&pass_var),
                    missing: var_name(&user_var),
                });
            }
        };

        Ok(EndpointConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("SOURCE_URL", "http://source/fhir/"),
        ("DOWNSTREAM_URL", "http://downstream/fhir"),
        ("WEBHOOK_URL", "http://bridge:8080/fhir"),
    ];

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let config = BridgeConfig::from_lookup(lookup(REQUIRED)).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.source.base_url, "http://source/fhir");
        assert!(config.source.credentials.is_none());
        assert_eq!(
            config.resource_types,
            vec![ResourceType::new("Patient"), ResourceType::new("ServiceRequest")]
        );
        assert_eq!(config.checkpoint_file, PathBuf::from("data/checkpoints.properties"));
        assert_eq!(config.overlap, Duration::from_millis(15_000));
        assert_eq!(config.initial_delay, Duration::from_secs(10));
        assert_eq!(config.poll_delay, Duration::from_secs(60));
        assert_eq!(config.gate_timeout, Duration::from_secs(60));
        assert_eq!(config.http_timeout, Duration::from_secs(120));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.max_parallel_writes >= 1);
    }

    #[test]
    fn missing_source_url_is_an_error() {
        let err = BridgeConfig::from_lookup(lookup(&REQUIRED[1..])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ref v) if v == "FHIR_BRIDGE_SOURCE_URL"));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("RESOURCE_TYPES", "Observation, Patient,,Observation"),
            ("OVERLAP_MS", "500"),
            ("MAX_PARALLEL_WRITES", "4"),
            ("SOURCE_USERNAME", "alice"),
            ("SOURCE_PASSWORD", "secret"),
        ]);
        let config = BridgeConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(
            config.resource_types,
            vec![ResourceType::new("Observation"), ResourceType::new("Patient")]
        );
        assert_eq!(config.overlap, Duration::from_millis(500));
        assert_eq!(config.max_parallel_writes, 4);
        assert_eq!(
            config.source.credentials,
            Some(BasicCredentials::new("alice", "secret"))
        );
    }

    #[test]
    fn username_without_password_is_an_error() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("WEBHOOK_USERNAME", "hook"));
        let err = BridgeConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteCredentials { .. }));
    }

    #[test]
    fn invalid_number_is_an_error() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("POLL_DELAY_SECS", "soon"));
        let err = BridgeConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "FHIR_BRIDGE_POLL_DELAY_SECS"));
    }

    #[test]
    fn invalid_resource_type_is_an_error() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RESOURCE_TYPES", "patient"));
        let err = BridgeConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidResourceType { .. }));
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("MAX_PARALLEL_WRITES", "0"));
        assert!(BridgeConfig::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn authorization_header_is_basic_base64() {
        let creds = BasicCredentials::new("user", "pass");
        assert_eq!(creds.authorization_header(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn debug_redacts_password() {
        let creds = BasicCredentials::new("user", "hunter2");
        let shown = format!("{creds:?}");
        assert!(shown.contains("user"));
        assert!(!shown.contains("hunter2"));
    }
}
