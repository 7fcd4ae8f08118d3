//! # Transport URIs
//!
//! Parsing and equality for broker endpoints and for the composite
//! `failover:(uri1,uri2,…)?opt=v&…` form.
//!
//! Broker URI equality is structural: scheme, host, port, path, and query
//! are compared after whitespace normalization, so `tcp://a:61616` taken
//! from a broker-pushed cluster list matches the same endpoint configured by
//! hand with stray spaces.
//!
//! Failover query options map one-to-one onto [`FailoverConfig`]. Options
//! prefixed `transport.` are stripped of the prefix and forwarded to every
//! inner transport; everything else must be a known failover option or
//! parsing fails with a configuration error.

use crate::error::TransportError;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A single broker endpoint.
#[derive(Debug, Clone, Eq)]
pub struct BrokerUri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Query parameters in sorted order so equality and display are stable.
    pub params: BTreeMap<String, String>,
}

impl BrokerUri {
    /// Parses `scheme://host:port[/path][?k=v&…]`, trimming all whitespace.
    pub fn parse(input: &str) -> Result<BrokerUri, TransportError> {
        let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let (scheme, rest) = cleaned.split_once("://").ok_or_else(|| {
            TransportError::Configuration(format!("URI '{input}' is missing a scheme"))
        })?;
        if scheme.is_empty() {
            return Err(TransportError::Configuration(format!(
                "URI '{input}' has an empty scheme"
            )));
        }

        let (authority_and_path, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        let (authority, path) = match authority_and_path.split_once('/') {
            Some((a, p)) => (a, format!("/{p}")),
            None => (authority_and_path, String::new()),
        };
        let (host, port_str) = authority.rsplit_once(':').ok_or_else(|| {
            TransportError::Configuration(format!("URI '{input}' is missing a port"))
        })?;
        if host.is_empty() {
            return Err(TransportError::Configuration(format!(
                "URI '{input}' has an empty host"
            )));
        }
        let port: u16 = port_str.parse().map_err(|_| {
            TransportError::Configuration(format!("URI '{input}' has an invalid port"))
        })?;

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                params.insert(key.to_string(), value.to_string());
            }
        }

        Ok(BrokerUri {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            path,
            params,
        })
    }

    /// Socket address string for connecting.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_ssl(&self) -> bool {
        self.scheme == "ssl" || self.scheme == "tls"
    }

    /// Adds a parameter only when absent, returning a new URI. Used to
    /// default `soConnectTimeout` from the failover timeout.
    pub fn with_default_param(&self, key: &str, value: String) -> BrokerUri {
        let mut uri = self.clone();
        uri.params.entry(key.to_string()).or_insert(value);
        uri
    }
}

impl PartialEq for BrokerUri {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.host == other.host
            && self.port == other.port
            && self.path == other.path
            && self.params == other.params
    }
}

impl std::hash::Hash for BrokerUri {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.scheme.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.path.hash(state);
        self.params.hash(state);
    }
}

impl fmt::Display for BrokerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)?;
        if !self.params.is_empty() {
            let query: Vec<String> =
                self.params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "?{}", query.join("&"))?;
        }
        Ok(())
    }
}

/// Configuration of the failover layer; one field per recognized query
/// option. Field-by-field effects are documented on the failover transport.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub use_exponential_backoff: bool,
    pub backoff_multiplier: u32,
    /// Per-URI cap for steady-state reconnects; negative means infinite.
    pub max_reconnect_attempts: i32,
    /// Per-URI cap applied before the first successful connection only;
    /// negative means infinite.
    pub startup_max_reconnect_attempts: i32,
    pub randomize: bool,
    pub priority_backup: bool,
    pub backups_enabled: bool,
    pub backup_pool_size: usize,
    pub track_messages: bool,
    pub track_transaction_producers: bool,
    pub max_cache_size: usize,
    pub max_pull_cache_size: usize,
    pub update_uris_supported: bool,
    pub reconnect_supported: bool,
    pub rebalance_update_uris: bool,
    /// Endpoints always treated as priority regardless of pool order.
    pub priority_uris: Vec<BrokerUri>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(crate::defaults::SEND_TIMEOUT_MS),
            initial_reconnect_delay: Duration::from_millis(
                crate::defaults::INITIAL_RECONNECT_DELAY_MS,
            ),
            max_reconnect_delay: Duration::from_millis(crate::defaults::MAX_RECONNECT_DELAY_MS),
            use_exponential_backoff: true,
            backoff_multiplier: crate::defaults::BACKOFF_MULTIPLIER,
            max_reconnect_attempts: crate::defaults::MAX_RECONNECT_ATTEMPTS,
            startup_max_reconnect_attempts: crate::defaults::MAX_RECONNECT_ATTEMPTS,
            randomize: true,
            priority_backup: false,
            backups_enabled: false,
            backup_pool_size: crate::defaults::BACKUP_POOL_SIZE,
            track_messages: false,
            track_transaction_producers: true,
            max_cache_size: crate::defaults::MAX_CACHE_SIZE,
            max_pull_cache_size: crate::defaults::MAX_PULL_CACHE_SIZE,
            update_uris_supported: true,
            reconnect_supported: true,
            rebalance_update_uris: true,
            priority_uris: Vec::new(),
        }
    }
}

/// A parsed `failover:(…)` URI: the candidate pool, the failover options,
/// and any `transport.`-prefixed options forwarded to the inner transports.
#[derive(Debug, Clone)]
pub struct FailoverUri {
    pub uris: Vec<BrokerUri>,
    pub config: FailoverConfig,
    pub transport_params: BTreeMap<String, String>,
}

impl FailoverUri {
    /// Parses `failover:(uri1,uri2,…)?opt=v&…`. The `failover://(…)` and
    /// parenthesis-free `failover:uri1,uri2` spellings are accepted too.
    pub fn parse(input: &str) -> Result<FailoverUri, TransportError> {
        let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let rest = cleaned
            .strip_prefix("failover://")
            .or_else(|| cleaned.strip_prefix("failover:"))
            .ok_or_else(|| {
                TransportError::Configuration(format!(
                    "'{input}' is not a failover URI (expected failover:(…))"
                ))
            })?;

        let (list_part, query) = if let Some(stripped) = rest.strip_prefix('(') {
            let (inner, after) = stripped.split_once(')').ok_or_else(|| {
                TransportError::Configuration(format!("unbalanced parenthesis in '{input}'"))
            })?;
            let query = after.strip_prefix('?');
            (inner, query)
        } else {
            match rest.split_once('?') {
                Some((l, q)) => (l, Some(q)),
                None => (rest, None),
            }
        };

        let mut uris = Vec::new();
        for piece in list_part.split(',').filter(|p| !p.is_empty()) {
            uris.push(BrokerUri::parse(piece)?);
        }
        if uris.is_empty() {
            return Err(TransportError::Configuration(format!(
                "failover URI '{input}' names no broker URIs"
            )));
        }

        let mut config = FailoverConfig::default();
        let mut transport_params = BTreeMap::new();

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if let Some(inner_key) = key.strip_prefix("transport.") {
                    transport_params.insert(inner_key.to_string(), value.to_string());
                } else {
                    apply_option(&mut config, key, value)?;
                }
            }
        }

        Ok(FailoverUri { uris, config, transport_params })
    }
}

fn apply_option(config: &mut FailoverConfig, key: &str, value: &str) -> Result<(), TransportError> {
    match key {
        "timeout" => config.timeout = Duration::from_millis(parse_u64(key, value)?),
        "initialReconnectDelay" => {
            config.initial_reconnect_delay = Duration::from_millis(parse_u64(key, value)?)
        }
        "maxReconnectDelay" => {
            config.max_reconnect_delay = Duration::from_millis(parse_u64(key, value)?)
        }
        "useExponentialBackOff" => config.use_exponential_backoff = parse_bool(key, value)?,
        "backOffMultiplier" => {
            let multiplier = parse_u64(key, value)?;
            if multiplier < 1 {
                return Err(TransportError::Configuration(
                    "backOffMultiplier must be at least 1".to_string(),
                ));
            }
            config.backoff_multiplier = multiplier as u32;
        }
        "maxReconnectAttempts" => config.max_reconnect_attempts = parse_i32(key, value)?,
        "startupMaxReconnectAttempts" => {
            config.startup_max_reconnect_attempts = parse_i32(key, value)?
        }
        "randomize" => config.randomize = parse_bool(key, value)?,
        "priorityBackup" => config.priority_backup = parse_bool(key, value)?,
        "backup" => config.backups_enabled = parse_bool(key, value)?,
        "backupPoolSize" => config.backup_pool_size = parse_u64(key, value)? as usize,
        "trackMessages" => config.track_messages = parse_bool(key, value)?,
        "trackTransactionProducers" => {
            config.track_transaction_producers = parse_bool(key, value)?
        }
        "maxCacheSize" => config.max_cache_size = parse_u64(key, value)? as usize,
        "maxPullCacheSize" => config.max_pull_cache_size = parse_u64(key, value)? as usize,
        "updateURIsSupported" => config.update_uris_supported = parse_bool(key, value)?,
        "reconnectSupported" => config.reconnect_supported = parse_bool(key, value)?,
        "rebalanceUpdateURIs" => config.rebalance_update_uris = parse_bool(key, value)?,
        "priorityURIs" => {
            for piece in value.split(',').filter(|p| !p.is_empty()) {
                config.priority_uris.push(BrokerUri::parse(piece)?);
            }
        }
        unknown => {
            return Err(TransportError::Configuration(format!(
                "unknown failover option '{unknown}'"
            )))
        }
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, TransportError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(TransportError::Configuration(format!(
            "option '{key}' expects true/false, got '{other}'"
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, TransportError> {
    value.parse().map_err(|_| {
        TransportError::Configuration(format!("option '{key}' expects an integer, got '{value}'"))
    })
}

fn parse_i32(key: &str, value: &str) -> Result<i32, TransportError> {
    value.parse().map_err(|_| {
        TransportError::Configuration(format!("option '{key}' expects an integer, got '{value}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_uri_structural_equality_ignores_whitespace() {
        let a = BrokerUri::parse("tcp://localhost:61616").unwrap();
        let b = BrokerUri::parse(" tcp://localhost :61616 ").unwrap();
        assert_eq!(a, b);
        let c = BrokerUri::parse("tcp://localhost:61617").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn broker_uri_with_params_and_path() {
        let uri = BrokerUri::parse("ssl://broker.example.com:61617/mq?soConnectTimeout=5000")
            .unwrap();
        assert!(uri.is_ssl());
        assert_eq!(uri.path, "/mq");
        assert_eq!(uri.params.get("soConnectTimeout").map(String::as_str), Some("5000"));
        assert_eq!(
            uri.to_string(),
            "ssl://broker.example.com:61617/mq?soConnectTimeout=5000"
        );
    }

    #[test]
    fn rejects_missing_port_or_scheme() {
        assert!(BrokerUri::parse("tcp://localhost").is_err());
        assert!(BrokerUri::parse("localhost:61616").is_err());
    }

    #[test]
    fn failover_uri_full_option_set() {
        let parsed = FailoverUri::parse(
            "failover:(tcp://a:61616,tcp://b:61616)?randomize=false&maxReconnectAttempts=3&\
             initialReconnectDelay=10&useExponentialBackOff=false&backup=true&\
             priorityBackup=true&trackMessages=true&timeout=1000&transport.tcpNoDelay=true",
        )
        .unwrap();

        assert_eq!(parsed.uris.len(), 2);
        assert!(!parsed.config.randomize);
        assert_eq!(parsed.config.max_reconnect_attempts, 3);
        assert_eq!(parsed.config.initial_reconnect_delay, Duration::from_millis(10));
        assert!(!parsed.config.use_exponential_backoff);
        assert!(parsed.config.backups_enabled);
        assert!(parsed.config.priority_backup);
        assert!(parsed.config.track_messages);
        assert_eq!(parsed.config.timeout, Duration::from_millis(1000));
        assert_eq!(parsed.transport_params.get("tcpNoDelay").map(String::as_str), Some("true"));
    }

    #[test]
    fn failover_uri_rejects_unknown_option() {
        let result = FailoverUri::parse("failover:(tcp://a:61616)?bogusOption=1");
        match result {
            Err(TransportError::Configuration(msg)) => assert!(msg.contains("bogusOption")),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn failover_uri_without_parentheses() {
        let parsed = FailoverUri::parse("failover:tcp://a:61616,tcp://b:61617").unwrap();
        assert_eq!(parsed.uris.len(), 2);
        assert_eq!(parsed.uris[1].port, 61617);
    }

    #[test]
    fn infinite_attempts_accepted() {
        let parsed = FailoverUri::parse("failover:(tcp://a:61616)?maxReconnectAttempts=-1").unwrap();
        assert_eq!(parsed.config.max_reconnect_attempts, -1);
    }
}
