//! Server configuration loaded from the environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::sync::{protocol::MAX_MESSAGE_SIZE, IdentityPolicy, SyncHubConfig};

/// Errors raised while reading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Bound on each connection's outbound queue
    pub outbound_queue_capacity: usize,
    /// Period between WebSocket pings
    pub heartbeat_interval: Duration,
    /// Connections silent for this long are dropped
    pub idle_timeout: Duration,
    /// Largest inbound frame accepted
    pub max_message_size: usize,
    pub identity_policy: IdentityPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5000,
            outbound_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            max_message_size: MAX_MESSAGE_SIZE,
            identity_policy: IdentityPolicy::Strict,
        }
    }
}

impl ServerConfig {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            host: parse_or(&lookup, "HOST", defaults.host)?,
            port: parse_or(&lookup, "PORT", defaults.port)?,
            outbound_queue_capacity: positive(
                parse_or(&lookup, "OUTBOUND_QUEUE_CAPACITY", defaults.outbound_queue_capacity)?,
                "OUTBOUND_QUEUE_CAPACITY",
            )?,
            heartbeat_interval: Duration::from_secs(positive(
                parse_or(&lookup, "HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval.as_secs())?,
                "HEARTBEAT_INTERVAL_SECS",
            )?),
            idle_timeout: Duration::from_secs(positive(
                parse_or(&lookup, "IDLE_TIMEOUT_SECS", defaults.idle_timeout.as_secs())?,
                "IDLE_TIMEOUT_SECS",
            )?),
            max_message_size: positive(
                parse_or(&lookup, "MAX_MESSAGE_SIZE", defaults.max_message_size)?,
                "MAX_MESSAGE_SIZE",
            )?,
            identity_policy: parse_or(&lookup, "IDENTITY_POLICY", defaults.identity_policy)?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn hub_config(&self) -> SyncHubConfig {
        SyncHubConfig {
            identity_policy: self.identity_policy,
            max_message_size: self.max_message_size,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn positive<T>(value: T, key: &'static str) -> Result<T, ConfigError>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.identity_policy, IdentityPolicy::Strict);
        assert_eq!(config.addr().to_string(), "0.0.0.0:5000");
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("OUTBOUND_QUEUE_CAPACITY", "16"),
            ("HEARTBEAT_INTERVAL_SECS", "5"),
            ("IDLE_TIMEOUT_SECS", "15"),
            ("IDENTITY_POLICY", "trust"),
            ("MAX_MESSAGE_SIZE", ""),
        ]))
        .unwrap();

        assert_eq!(config.addr().to_string(), "127.0.0.1:8080");
        assert_eq!(config.outbound_queue_capacity, 16);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(config.hub_config().identity_policy, IdentityPolicy::Trust);
        assert_eq!(config.hub_config().max_message_size, MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_message_size_reaches_hub() {
        let config =
            ServerConfig::from_lookup(lookup(&[("MAX_MESSAGE_SIZE", "33554432")])).unwrap();
        assert_eq!(config.max_message_size, 32 * 1024 * 1024);
        assert_eq!(config.hub_config().max_message_size, 32 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_values() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        let err = ServerConfig::from_lookup(lookup(&[("OUTBOUND_QUEUE_CAPACITY", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "OUTBOUND_QUEUE_CAPACITY",
                ..
            }
        ));

        assert!(ServerConfig::from_lookup(lookup(&[("IDENTITY_POLICY", "lenient")])).is_err());
    }
}
