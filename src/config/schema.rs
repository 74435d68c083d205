//! The flat key/value configuration and its typed projections.
//!
//! Every value is kept as a string; [`NamespaceSpec`], the target command and
//! the relay options are parsed out of it on demand, so a bad value only
//! fails the operation that needs it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use crate::diagnostics::DEFAULT_PROBE_TIMEOUT;
use crate::netns::orchestrator::DEFAULT_GRACE_PERIOD;
use crate::netns::relay::{DEFAULT_RELAY_BINARY, DEFAULT_RELAY_LOG_LEVEL};
use crate::netns::{Ipv4Cidr, NamespaceSpec, ProxyUrl, RelayOptions, ValidationError};

/// Keys that must have a value before setup, run or clean.
pub const REQUIRED_KEYS: [&str; 11] = [
    "ip",
    "port",
    "socks_url",
    "namespace",
    "tun_interface",
    "tun_ip",
    "veth_host",
    "veth_ns",
    "veth_host_ip",
    "veth_ns_ip",
    "cmd",
];

/// Keys with built-in fallbacks.
pub const OPTIONAL_KEYS: [&str; 7] = [
    "dns",
    "relay_binary",
    "relay_args",
    "relay_log_level",
    "relay_grace_secs",
    "state_dir",
    "probe_timeout_secs",
];

/// Where the state and environment files live by default.
pub const DEFAULT_STATE_DIR: &str = "/run/proxyns";

/// Values every installation starts from. The proxy endpoint has no default.
const DEFAULTS: [(&str, &str); 8] = [
    ("namespace", "proxied"),
    ("tun_interface", "tun0"),
    ("tun_ip", "10.0.0.2/24"),
    ("veth_host", "veth_host"),
    ("veth_ns", "veth_ns"),
    ("veth_host_ip", "10.200.1.1/24"),
    ("veth_ns_ip", "10.200.1.2/24"),
    // Empty runs the user's login shell
    ("cmd", ""),
];

/// Flat configuration: key to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigStore {
    values: BTreeMap<String, String>,
}

impl ConfigStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in defaults.
    pub fn defaults() -> Self {
        Self {
            values: DEFAULTS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Whether any component reads `key`.
    pub fn is_known_key(key: &str) -> bool {
        REQUIRED_KEYS.contains(&key) || OPTIONAL_KEYS.contains(&key)
    }

    /// Parse a TOML document holding one flat table.
    ///
    /// Numbers and booleans are stored in their TOML spelling; arrays of
    /// scalars are joined with spaces. Unknown keys are rejected.
    pub fn from_toml(table: toml::Table) -> Result<Self, ConfigError> {
        let mut store = Self::new();
        for (key, value) in table {
            if !Self::is_known_key(&key) {
                return Err(ConfigError::UnknownKey(key));
            }
            let value = scalar_to_string(&key, value)?;
            store.set(&key, &value)?;
        }
        Ok(store)
    }

    /// Render as a flat TOML table.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(&self.values)?)
    }

    /// Value for `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set `key`, rejecting keys nothing reads.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        if !Self::is_known_key(key) {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }
        self.values.insert(key.to_string(), value.trim().to_string());
        Ok(())
    }

    /// Override with every key set in `other`.
    pub fn merge(&mut self, other: ConfigStore) {
        self.values.extend(other.values);
    }

    /// All key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Required keys without a value, in declaration order.
    ///
    /// `cmd` may be empty; every other required key must be non-empty.
    pub fn missing_required(&self) -> Vec<String> {
        REQUIRED_KEYS
            .iter()
            .filter(|key| match self.get(key) {
                None => true,
                Some(value) => value.is_empty() && **key != "cmd",
            })
            .map(|key| key.to_string())
            .collect()
    }

    /// Fail unless every required key is present.
    pub fn require(&self) -> Result<(), ConfigError> {
        let missing = self.missing_required();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingKeys(missing))
        }
    }

    /// Validated namespace description.
    pub fn namespace_spec(&self) -> Result<NamespaceSpec, ConfigError> {
        self.require()?;

        let spec = NamespaceSpec {
            namespace: self.required("namespace")?.to_string(),
            veth_host: self.required("veth_host")?.to_string(),
            veth_ns: self.required("veth_ns")?.to_string(),
            veth_host_ip: self.parse::<Ipv4Cidr>("veth_host_ip")?,
            veth_ns_ip: self.parse::<Ipv4Cidr>("veth_ns_ip")?,
            tun_interface: self.required("tun_interface")?.to_string(),
            tun_ip: self.parse::<Ipv4Cidr>("tun_ip")?,
            proxy_ip: self.parse::<Ipv4Addr>("ip")?,
            proxy_port: self.proxy_port()?,
            socks_url: self.parse::<ProxyUrl>("socks_url")?,
            dns: self.dns()?,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Proxy endpoint as `(ip, port)`, for diagnostics defaults.
    pub fn proxy_endpoint(&self) -> Result<(String, u16), ConfigError> {
        let ip = self.required("ip")?.to_string();
        Ok((ip, self.proxy_port()?))
    }

    /// The configured command; `None` means an interactive login shell.
    pub fn command(&self) -> Option<String> {
        self.get("cmd")
            .filter(|cmd| !cmd.is_empty())
            .map(str::to_string)
    }

    /// How to invoke the relay.
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            binary: self
                .non_empty("relay_binary")
                .unwrap_or(DEFAULT_RELAY_BINARY)
                .to_string(),
            extra_args: self
                .get("relay_args")
                .map(|args| args.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            log_level: self
                .non_empty("relay_log_level")
                .unwrap_or(DEFAULT_RELAY_LOG_LEVEL)
                .to_string(),
        }
    }

    /// SIGTERM-to-SIGKILL grace period for the relay.
    pub fn grace_period(&self) -> Result<Duration, ConfigError> {
        self.seconds("relay_grace_secs", DEFAULT_GRACE_PERIOD)
    }

    /// Timeout for ping and port probes.
    pub fn probe_timeout(&self) -> Result<Duration, ConfigError> {
        self.seconds("probe_timeout_secs", DEFAULT_PROBE_TIMEOUT)
    }

    /// Directory holding the state and environment files.
    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(self.non_empty("state_dir").unwrap_or(DEFAULT_STATE_DIR))
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<&str, ConfigError> {
        self.non_empty(key)
            .ok_or_else(|| ConfigError::MissingKeys(vec![key.to_string()]))
    }

    fn parse<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.required(key)?;
        raw.parse::<T>()
            .map_err(|e| ValidationError::new(key, format!("'{}': {}", raw, e)).into())
    }

    fn proxy_port(&self) -> Result<u16, ConfigError> {
        let port = self.parse::<u16>("port")?;
        if port == 0 {
            return Err(ValidationError::new("port", "must be between 1 and 65535").into());
        }
        Ok(port)
    }

    /// Nameservers, comma- or whitespace-separated.
    fn dns(&self) -> Result<Vec<Ipv4Addr>, ConfigError> {
        let Some(raw) = self.non_empty("dns") else {
            return Ok(Vec::new());
        };
        raw.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<Ipv4Addr>().map_err(|e| {
                    ConfigError::from(ValidationError::new("dns", format!("'{}': {}", s, e)))
                })
            })
            .collect()
    }

    fn seconds(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.non_empty(key) {
            None => Ok(default),
            Some(_) => {
                let secs = self.parse::<f64>(key)?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(ValidationError::new(key, "must be a positive number").into());
                }
                Duration::try_from_secs_f64(secs).map_err(|e| {
                    ConfigError::from(ValidationError::new(
                        key,
                        format!("'{}' is out of range: {}", secs, e),
                    ))
                })
            }
        }
    }
}

fn scalar_to_string(key: &str, value: toml::Value) -> Result<String, ConfigError> {
    let invalid = |what: &str| {
        ConfigError::from(ValidationError::new(
            key,
            format!("expected a scalar value, found {}", what),
        ))
    };
    match value {
        toml::Value::String(s) => Ok(s),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(d) => Ok(d.to_string()),
        toml::Value::Array(items) => {
            let parts = items
                .into_iter()
                .map(|item| match item {
                    toml::Value::Array(_) | toml::Value::Table(_) => Err(invalid("a nested array")),
                    other => scalar_to_string(key, other),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(parts.join(" "))
        }
        toml::Value::Table(_) => Err(invalid("a table")),
    }
}
