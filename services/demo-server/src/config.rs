use std::time::Duration;

use latency::{LatencyError, parse_duration};
use lifecycle::{
    DEFAULT_DRAIN_POLL_INTERVAL, DEFAULT_DRAIN_TIMEOUT, DEFAULT_HARD_SHUTDOWN_TIMEOUT,
    DEFAULT_PRE_SHUTDOWN_DELAY, DrainConfig,
};
use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_PROXY_SERVICES: [&str; 5] = ["envoy", "nginx", "varnish", "node-demo", "java-demo"];
pub const DEFAULT_UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_UPSTREAM_MAX_IDLE_PER_HOST: usize = 200;
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_HTTP_WORKERS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}: {source}")]
    InvalidDuration {
        key: &'static str,
        source: LatencyError,
    },
    #[error("{key}: expected true or false, got {value:?}")]
    InvalidBool { key: &'static str, value: String },
    #[error("{key}: expected a positive integer, got {value:?}")]
    InvalidCount { key: &'static str, value: String },
    #[error("{key}: invalid proxy service {entry:?}: {reason}")]
    InvalidProxyService {
        key: &'static str,
        entry: String,
        reason: &'static str,
    },
    #[error("{key}: unknown transport runtime {value:?}, expected std or axum")]
    UnknownRuntime { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRuntime {
    Std,
    Axum,
}

impl TransportRuntime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Std => "std",
            Self::Axum => "axum",
        }
    }
}

/// A backend reachable under `/{name}/...`. `authority` is sent as the
/// upstream `Host` and dialed on port 80 when it carries no port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyService {
    pub name: String,
    pub authority: String,
}

impl ProxyService {
    pub fn new(name: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            authority: authority.into(),
        }
    }

    pub fn named(name: &str) -> Self {
        Self::new(name, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_UPSTREAM_IDLE_TIMEOUT,
            max_idle_per_host: DEFAULT_UPSTREAM_MAX_IDLE_PER_HOST,
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub drain: DrainConfig,
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub proxy_services: Vec<ProxyService>,
    pub upstream: UpstreamConfig,
    pub transport_runtime: TransportRuntime,
    pub http_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            drain: DrainConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            proxy_services: DEFAULT_PROXY_SERVICES
                .iter()
                .map(|name| ProxyService::named(name))
                .collect(),
            upstream: UpstreamConfig::default(),
            transport_runtime: TransportRuntime::Std,
            http_workers: default_http_workers(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads every setting through `lookup`; for each key the `DEMO_*` name
    /// wins over its unprefixed fallback and empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&'static str]| first_value(&lookup, keys);

        let bind_addr = first(&["DEMO_BIND", "BIND_ADDR"])
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let graceful = match first(&["DEMO_GRACEFUL_SHUTDOWN", "GRACEFUL_SHUTDOWN"]) {
            Some(value) => parse_bool("DEMO_GRACEFUL_SHUTDOWN", &value)?,
            None => false,
        };
        let drain_timeout = match first(&["DEMO_DRAIN_TIMEOUT", "DRAIN_TIMEOUT"]) {
            Some(value) => parse_drain_timeout("DEMO_DRAIN_TIMEOUT", &value)?,
            None => Some(DEFAULT_DRAIN_TIMEOUT),
        };
        let drain = DrainConfig {
            graceful,
            drain_timeout,
            pre_shutdown_delay: duration_or(
                first(&["DEMO_SHUTDOWN_DELAY", "SHUTDOWN_DELAY"]),
                "DEMO_SHUTDOWN_DELAY",
                DEFAULT_PRE_SHUTDOWN_DELAY,
            )?,
            poll_interval: duration_or(
                first(&["DEMO_DRAIN_POLL_INTERVAL", "DRAIN_POLL_INTERVAL"]),
                "DEMO_DRAIN_POLL_INTERVAL",
                DEFAULT_DRAIN_POLL_INTERVAL,
            )?,
            hard_timeout: duration_or(
                first(&["DEMO_SHUTDOWN_TIMEOUT", "SHUTDOWN_TIMEOUT"]),
                "DEMO_SHUTDOWN_TIMEOUT",
                DEFAULT_HARD_SHUTDOWN_TIMEOUT,
            )?,
        };

        let idle_timeout = duration_or(
            first(&["DEMO_IDLE_TIMEOUT", "IDLE_TIMEOUT"]),
            "DEMO_IDLE_TIMEOUT",
            DEFAULT_IDLE_TIMEOUT,
        )?;
        let max_connections = count_or(
            first(&["DEMO_MAX_CONNECTIONS", "MAX_CONNECTIONS"]),
            "DEMO_MAX_CONNECTIONS",
            DEFAULT_MAX_CONNECTIONS,
        )?;
        let proxy_services = match first(&["DEMO_PROXY_SERVICES", "PROXY_SERVICES"]) {
            Some(value) => parse_proxy_services("DEMO_PROXY_SERVICES", &value)?,
            None => ServerConfig::default().proxy_services,
        };

        let upstream = UpstreamConfig {
            idle_timeout: duration_or(
                first(&["DEMO_UPSTREAM_IDLE_TIMEOUT"]),
                "DEMO_UPSTREAM_IDLE_TIMEOUT",
                DEFAULT_UPSTREAM_IDLE_TIMEOUT,
            )?,
            max_idle_per_host: count_or(
                first(&["DEMO_UPSTREAM_MAX_IDLE_PER_HOST"]),
                "DEMO_UPSTREAM_MAX_IDLE_PER_HOST",
                DEFAULT_UPSTREAM_MAX_IDLE_PER_HOST,
            )?,
            timeout: duration_or(
                first(&["DEMO_UPSTREAM_TIMEOUT"]),
                "DEMO_UPSTREAM_TIMEOUT",
                DEFAULT_UPSTREAM_TIMEOUT,
            )?,
        };

        let transport_runtime = match first(&["DEMO_TRANSPORT_RUNTIME", "TRANSPORT_RUNTIME"]) {
            None => TransportRuntime::Std,
            Some(value) => match value.as_str() {
                "std" => TransportRuntime::Std,
                "axum" => TransportRuntime::Axum,
                _ => {
                    return Err(ConfigError::UnknownRuntime {
                        key: "DEMO_TRANSPORT_RUNTIME",
                        value,
                    });
                }
            },
        };
        let http_workers = match first(&["DEMO_HTTP_WORKERS", "HTTP_WORKERS"]) {
            Some(value) => parse_count("DEMO_HTTP_WORKERS", &value)?.min(MAX_HTTP_WORKERS),
            None => default_http_workers(),
        };

        Ok(Self {
            bind_addr,
            drain,
            idle_timeout,
            max_connections,
            proxy_services,
            upstream,
            transport_runtime,
            http_workers,
        })
    }
}

fn first_value<F>(lookup: &F, keys: &[&'static str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_drain_timeout(key: &'static str, value: &str) -> Result<Option<Duration>, ConfigError> {
    if value.starts_with('-') {
        return Ok(None);
    }
    let timeout =
        parse_duration(value).map_err(|source| ConfigError::InvalidDuration { key, source })?;
    Ok(Some(timeout).filter(|timeout| !timeout.is_zero()))
}

fn duration_or(
    value: Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => {
            parse_duration(&value).map_err(|source| ConfigError::InvalidDuration { key, source })
        }
        None => Ok(default),
    }
}

fn parse_count(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .ok()
        .filter(|count| *count > 0)
        .ok_or_else(|| ConfigError::InvalidCount {
            key,
            value: value.to_string(),
        })
}

fn count_or(value: Option<String>, key: &'static str, default: usize) -> Result<usize, ConfigError> {
    match value {
        Some(value) => parse_count(key, &value),
        None => Ok(default),
    }
}

fn parse_proxy_services(key: &'static str, value: &str) -> Result<Vec<ProxyService>, ConfigError> {
    let mut services: Vec<ProxyService> = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let invalid = |reason: &'static str| ConfigError::InvalidProxyService {
            key,
            entry: entry.to_string(),
            reason,
        };
        let service = match entry.split_once('=') {
            Some((name, authority)) => {
                let authority = authority.trim();
                if authority.is_empty() || authority.contains('/') {
                    return Err(invalid("authority must be host or host:port"));
                }
                ProxyService::new(name.trim(), authority)
            }
            None => ProxyService::named(entry),
        };
        if service.name.is_empty() || service.name.contains(['/', '?', ' ']) {
            return Err(invalid("name must be a single path segment"));
        }
        if services.iter().any(|existing| existing.name == service.name) {
            return Err(invalid("duplicate service name"));
        }
        services.push(service);
    }
    Ok(services)
}

fn default_http_workers() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get().clamp(1, MAX_HTTP_WORKERS))
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn http_workers_are_clamped_to_the_supported_range() {
        let config = config_from(&[("DEMO_HTTP_WORKERS", "500")]).expect("large counts load");
        assert_eq!(config.http_workers, MAX_HTTP_WORKERS);

        let config = config_from(&[("HTTP_WORKERS", "3")]).expect("fallback key loads");
        assert_eq!(config.http_workers, 3);

        assert!((1..=MAX_HTTP_WORKERS).contains(&config_from(&[]).unwrap().http_workers));
        assert!(matches!(
            config_from(&[("DEMO_HTTP_WORKERS", "0")]),
            Err(ConfigError::InvalidCount { key: "DEMO_HTTP_WORKERS", .. })
        ));
    }

    #[test]
    fn defaults_reproduce_the_lossy_baseline() {
        let config = config_from(&[]).expect("empty env should load");
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert!(!config.drain.graceful);
        assert_eq!(config.drain.drain_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.drain.pre_shutdown_delay, Duration::from_secs(10));
        assert_eq!(config.drain.poll_interval, Duration::from_millis(500));
        assert_eq!(config.drain.hard_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.upstream.idle_timeout, Duration::from_secs(4));
        assert_eq!(config.upstream.max_idle_per_host, 200);
        assert_eq!(config.transport_runtime, TransportRuntime::Std);
        let names: Vec<&str> = config
            .proxy_services
            .iter()
            .map(|service| service.name.as_str())
            .collect();
        assert_eq!(names, DEFAULT_PROXY_SERVICES);
    }

    #[test]
    fn prefixed_keys_win_over_fallbacks() {
        let config = config_from(&[
            ("DEMO_BIND", "127.0.0.1:9000"),
            ("BIND_ADDR", "127.0.0.1:9001"),
            ("GRACEFUL_SHUTDOWN", "true"),
            ("DEMO_IDLE_TIMEOUT", ""),
            ("IDLE_TIMEOUT", "5s"),
        ])
        .expect("env should load");
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert!(config.drain.graceful);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn non_positive_drain_timeout_disables_the_drain_loop() {
        for raw in ["0", "0s", "-5s"] {
            let config = config_from(&[
                ("DEMO_GRACEFUL_SHUTDOWN", "true"),
                ("DEMO_DRAIN_TIMEOUT", raw),
            ])
            .expect("env should load");
            assert_eq!(config.drain.drain_timeout, None, "raw {raw:?}");
            assert_eq!(config.drain.drain_window(), None);
        }

        let config = config_from(&[
            ("DEMO_GRACEFUL_SHUTDOWN", "true"),
            ("DEMO_DRAIN_TIMEOUT", "2s"),
        ])
        .expect("env should load");
        assert_eq!(config.drain.drain_window(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn malformed_values_name_the_offending_key() {
        let err = config_from(&[("SHUTDOWN_DELAY", "ten seconds")])
            .expect_err("delay should be rejected");
        assert!(matches!(
            err,
            ConfigError::InvalidDuration {
                key: "DEMO_SHUTDOWN_DELAY",
                ..
            }
        ));

        let err = config_from(&[("DEMO_GRACEFUL_SHUTDOWN", "maybe")])
            .expect_err("flag should be rejected");
        assert_eq!(err.to_string(), "DEMO_GRACEFUL_SHUTDOWN: expected true or false, got \"maybe\"");

        assert!(matches!(
            config_from(&[("DEMO_MAX_CONNECTIONS", "0")]),
            Err(ConfigError::InvalidCount { .. })
        ));
        assert!(matches!(
            config_from(&[("DEMO_TRANSPORT_RUNTIME", "hyper")]),
            Err(ConfigError::UnknownRuntime { .. })
        ));
    }

    #[test]
    fn proxy_services_accept_names_and_explicit_authorities() {
        let config = config_from(&[(
            "DEMO_PROXY_SERVICES",
            " envoy, backend=127.0.0.1:9100 ,,",
        )])
        .expect("services should parse");
        assert_eq!(
            config.proxy_services,
            vec![
                ProxyService::named("envoy"),
                ProxyService::new("backend", "127.0.0.1:9100"),
            ]
        );

        for raw in ["a/b", "x=", "envoy,envoy", "x=http://host/"] {
            assert!(
                matches!(
                    config_from(&[("DEMO_PROXY_SERVICES", raw)]),
                    Err(ConfigError::InvalidProxyService { .. })
                ),
                "raw {raw:?} should be rejected"
            );
        }
    }
}
