//! Configuration file support for pingud
//!
//! Loads and validates the daemon configuration from a TOML file.
//! Default location: /etc/pingu/pingu.toml

use crate::error::{PinguError, Result};
use crate::route::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pingu/pingu.toml";

/// Route tables the kernel reserves (unspec, default, main, local)
const RESERVED_TABLES: [u32; 4] = [0, 253, 254, 255];

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket for the administrative channel
    #[serde(default = "default_admin_socket")]
    pub admin_socket: PathBuf,

    /// Pidfile guarding against a second instance
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Rule priority of a table without an explicit priority is base + table id
    #[serde(default = "default_rule_priority_base")]
    pub rule_priority_base: u32,
}

/// Probe defaults applied to every host that does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeDefaults {
    /// Steady-state interval between probes in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Per-probe timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive replies needed to declare a host up
    #[serde(default = "default_up_threshold")]
    pub up_threshold: u32,

    /// Consecutive timeouts needed to declare a host down
    #[serde(default = "default_down_threshold")]
    pub down_threshold: u32,

    /// Interval between probes of a burst in milliseconds
    #[serde(default = "default_burst_interval_ms")]
    pub burst_interval_ms: u64,

    /// Maximum number of probes in one burst
    #[serde(default = "default_burst_max_probes")]
    pub burst_max_probes: u32,
}

/// Kernel route request retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Attempts per request, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Upper bound for the retry delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Explicit per-interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Device name ("" for the unnamed interface)
    #[serde(default)]
    pub name: String,

    /// Kernel routing table; auto-assigned when absent
    #[serde(default)]
    pub route_table: Option<u32>,

    /// Policy rule priority; `rule_priority_base + route_table` when absent
    #[serde(default)]
    pub rule_priority: Option<u32>,

    /// Whether the table follows host verdicts or only the link state
    #[serde(default = "default_health_gated")]
    pub health_gated: bool,
}

/// A monitored destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Target address
    pub address: Ipv4Addr,

    /// Interface the host is probed through ("" for no device restriction)
    #[serde(default)]
    pub interface: String,

    /// Display name; defaults to the address
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub up_threshold: Option<u32>,
    #[serde(default)]
    pub down_threshold: Option<u32>,
    #[serde(default)]
    pub burst_interval_ms: Option<u64>,
    #[serde(default)]
    pub burst_max_probes: Option<u32>,

    /// Command run when the host goes up
    #[serde(default)]
    pub up_action: Option<String>,

    /// Command run when the host goes down
    #[serde(default)]
    pub down_action: Option<String>,
}

/// Resolved probe parameters of one host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub up_threshold: u32,
    pub down_threshold: u32,
    pub burst_interval: Duration,
    pub burst_max_probes: u32,
}

/// Complete pingud configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinguConfig {
    /// Process-level settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Probe defaults
    #[serde(default)]
    pub probe: ProbeDefaults,

    /// Kernel request retry settings
    #[serde(default)]
    pub route: RouteConfig,

    /// Explicit interface settings
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceConfig>,

    /// Monitored hosts
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,
}

// Default functions
fn default_admin_socket() -> PathBuf {
    PathBuf::from("/run/pingu/pingu.ctl")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/run/pingu/pingu.pid")
}

fn default_rule_priority_base() -> u32 {
    1000
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_up_threshold() -> u32 {
    3
}

fn default_down_threshold() -> u32 {
    2
}

fn default_burst_interval_ms() -> u64 {
    1000
}

fn default_burst_max_probes() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5000
}

fn default_health_gated() -> bool {
    true
}

// Default implementations
impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            admin_socket: default_admin_socket(),
            pid_file: default_pid_file(),
            rule_priority_base: default_rule_priority_base(),
        }
    }
}

impl Default for ProbeDefaults {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            up_threshold: default_up_threshold(),
            down_threshold: default_down_threshold(),
            burst_interval_ms: default_burst_interval_ms(),
            burst_max_probes: default_burst_max_probes(),
        }
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RouteConfig {
    /// Retry policy for the route controller
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.backoff_initial_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

impl HostConfig {
    /// Host with every probe parameter taken from the defaults
    pub fn new(address: Ipv4Addr, interface: impl Into<String>) -> Self {
        Self {
            address,
            interface: interface.into(),
            label: None,
            interval_ms: None,
            timeout_ms: None,
            up_threshold: None,
            down_threshold: None,
            burst_interval_ms: None,
            burst_max_probes: None,
            up_action: None,
            down_action: None,
        }
    }

    /// Label shown in logs and on the admin channel
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }

    /// Merge per-host overrides with the probe defaults
    pub fn probe_settings(&self, defaults: &ProbeDefaults) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(self.interval_ms.unwrap_or(defaults.interval_ms)),
            timeout: Duration::from_millis(self.timeout_ms.unwrap_or(defaults.timeout_ms)),
            up_threshold: self.up_threshold.unwrap_or(defaults.up_threshold),
            down_threshold: self.down_threshold.unwrap_or(defaults.down_threshold),
            burst_interval: Duration::from_millis(
                self.burst_interval_ms.unwrap_or(defaults.burst_interval_ms),
            ),
            burst_max_probes: self.burst_max_probes.unwrap_or(defaults.burst_max_probes),
        }
    }
}

impl PinguConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PinguError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PinguError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            PinguError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Settings of a declared interface, if any
    pub fn interface(&self, name: &str) -> Option<&InterfaceConfig> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(PinguError::Config("no hosts configured".to_string()));
        }

        if self.route.max_attempts == 0 {
            return Err(PinguError::Config(
                "route.max_attempts must be >= 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut tables = HashSet::new();
        for iface in &self.interfaces {
            if !names.insert(iface.name.as_str()) {
                return Err(PinguError::Config(format!(
                    "interface '{}' declared twice",
                    iface.name
                )));
            }
            if let Some(table) = iface.route_table {
                if RESERVED_TABLES.contains(&table) {
                    return Err(PinguError::Config(format!(
                        "interface '{}': route table {} is reserved",
                        iface.name, table
                    )));
                }
                if !tables.insert(table) {
                    return Err(PinguError::Config(format!(
                        "route table {} assigned to more than one interface",
                        table
                    )));
                }
                if iface.rule_priority.is_none()
                    && self.daemon.rule_priority_base.checked_add(table).is_none()
                {
                    return Err(PinguError::Config(format!(
                        "interface '{}': rule priority base {} + table {} out of range",
                        iface.name, self.daemon.rule_priority_base, table
                    )));
                }
            }
        }

        for host in &self.hosts {
            let settings = host.probe_settings(&self.probe);
            let label = host.display_label();
            if settings.up_threshold == 0 || settings.down_threshold == 0 {
                return Err(PinguError::Config(format!(
                    "host {}: thresholds must be >= 1",
                    label
                )));
            }
            if settings.timeout.is_zero() || settings.timeout >= settings.interval {
                return Err(PinguError::Config(format!(
                    "host {}: timeout must be > 0 and shorter than the interval",
                    label
                )));
            }
            if settings.burst_interval.is_zero() {
                return Err(PinguError::Config(format!(
                    "host {}: burst interval must be > 0",
                    label
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[daemon]
rule_priority_base = 2000

[probe]
interval_ms = 10000
down_threshold = 3

[[interface]]
name = "eth1"
route_table = 20

[[host]]
address = "192.0.2.1"
interface = "eth1"
label = "isp-a"
up_action = "/etc/pingu/up.sh"

[[host]]
address = "198.51.100.1"
interface = "eth2"
timeout_ms = 500
"#;

    #[test]
    fn test_default_config() {
        let config = PinguConfig::default();
        assert_eq!(config.daemon.rule_priority_base, 1000);
        assert_eq!(config.probe.interval_ms, 30_000);
        assert_eq!(config.probe.up_threshold, 3);
        assert_eq!(config.probe.down_threshold, 2);
        assert_eq!(config.route.max_attempts, 5);
    }

    #[test]
    fn test_toml_deserialization() {
        let config = PinguConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.daemon.rule_priority_base, 2000);
        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[0].display_label(), "isp-a");
        assert_eq!(config.hosts[1].display_label(), "198.51.100.1");
        // Unspecified values should use defaults
        assert_eq!(config.probe.timeout_ms, 1000);
        assert!(config.interfaces[0].health_gated);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_probe_settings_merge() {
        let config = PinguConfig::from_toml(SAMPLE).unwrap();
        let settings = config.hosts[1].probe_settings(&config.probe);
        assert_eq!(settings.interval, Duration::from_secs(10));
        assert_eq!(settings.timeout, Duration::from_millis(500));
        assert_eq!(settings.down_threshold, 3);
        assert_eq!(settings.up_threshold, 3);
    }

    #[test]
    fn test_validate_no_hosts() {
        let config = PinguConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_threshold() {
        let mut config = PinguConfig::from_toml(SAMPLE).unwrap();
        config.hosts[0].up_threshold = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_timeout_longer_than_interval() {
        let mut config = PinguConfig::from_toml(SAMPLE).unwrap();
        config.hosts[0].timeout_ms = Some(20_000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_reserved_table() {
        let mut config = PinguConfig::from_toml(SAMPLE).unwrap();
        config.interfaces[0].route_table = Some(254);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_priority_out_of_range() {
        let mut config = PinguConfig::from_toml(SAMPLE).unwrap();
        config.interfaces[0].route_table = Some(4_294_967_000);
        assert!(config.validate().is_err());

        // An explicit priority makes any table id usable
        config.interfaces[0].rule_priority = Some(900);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_interface() {
        let mut config = PinguConfig::from_toml(SAMPLE).unwrap();
        let dup = config.interfaces[0].clone();
        config.interfaces.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy() {
        let policy = RouteConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = PinguConfig::load(file.path()).unwrap();
        assert_eq!(config.hosts[0].interface, "eth1");
    }

    #[test]
    fn test_load_nonexistent_file() {
        assert!(PinguConfig::load("/nonexistent/pingu.toml").is_err());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(PinguConfig::from_toml("[[host]]\naddress = 12").is_err());
    }
}
