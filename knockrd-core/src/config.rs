//! Service configuration.
//!
//! Loaded from a YAML or TOML file, overridden from `KNOCKRD_*` environment
//! variables, then normalized and validated. Omitted fields take the
//! defaults below.

use crate::error::ConfigError;
use crate::target::{KvTarget, ListTarget, RuleTarget};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default name of the access-state collection.
pub const DEFAULT_TABLE: &str = "knockrd";

/// Default namespace for mirrored keys.
pub const DEFAULT_KV_PREFIX: &str = "knockrd/allowed";

/// Environment variable naming the config file when no path is given.
pub const CONFIG_PATH_ENV: &str = "KNOCKRD_CONFIG";

const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_CACHE_TTL_SECS: u64 = 10;
const DEFAULT_NEGATIVE_CACHE_TTL_SECS: u64 = 5;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAP_SIZE_MB: usize = 64;

// ============================================================================
// KNOCKRD CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KnockConfig {
    /// Name of the access-state collection.
    pub table_name: String,

    /// Directory of the LMDB environment. `None` keeps state in memory.
    pub store_path: Option<PathBuf>,

    /// LMDB map size in megabytes.
    pub store_map_size_mb: usize,

    /// Lifetime of a granted entry.
    pub ttl_secs: u64,

    /// Lifetime of a positive cache entry. Zero disables the cache.
    pub cache_ttl_secs: u64,

    /// Lifetime of a negative cache entry.
    pub negative_cache_ttl_secs: u64,

    pub store_timeout_ms: u64,
    pub sink_timeout_ms: u64,

    /// Backoff applied to startup provisioning only.
    pub provisioning: RetryPolicy,

    pub ip_set: Option<IpSetConfig>,

    pub security_groups: Vec<RuleTarget>,

    pub consul: Option<ConsulConfig>,
}

impl Default for KnockConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE.to_string(),
            store_path: None,
            store_map_size_mb: DEFAULT_MAP_SIZE_MB,
            ttl_secs: DEFAULT_TTL_SECS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            negative_cache_ttl_secs: DEFAULT_NEGATIVE_CACHE_TTL_SECS,
            store_timeout_ms: DEFAULT_TIMEOUT_MS,
            sink_timeout_ms: DEFAULT_TIMEOUT_MS,
            provisioning: RetryPolicy::default(),
            ip_set: None,
            security_groups: Vec::new(),
            consul: None,
        }
    }
}

/// List targets, one per address family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpSetConfig {
    pub v4: Option<ListTarget>,
    pub v6: Option<ListTarget>,
}

impl IpSetConfig {
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulConfig {
    /// `host:port` of the agent.
    pub address: String,
    #[serde(default = "default_consul_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub kv_path: Option<String>,
}

fn default_consul_scheme() -> String {
    "http".to_string()
}

impl ConsulConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            scheme: default_consul_scheme(),
            datacenter: None,
            kv_path: None,
        }
    }

    /// `scheme://address`
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.address.trim_end_matches('/'))
    }

    pub fn kv_target(&self) -> KvTarget {
        match self.kv_path.as_deref() {
            Some(path) if !path.trim().is_empty() => KvTarget::new(path.trim()),
            _ => KvTarget::new(DEFAULT_KV_PREFIX),
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 3_000,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubling from the
    /// minimum and capped at the maximum.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.min_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// A change made by [`KnockConfig::normalize`]. Callers log these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAdjustment {
    CacheTtlClamped { from_secs: u64, to_secs: u64 },
    NegativeCacheTtlClamped { from_secs: u64, to_secs: u64 },
}

impl fmt::Display for ConfigAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheTtlClamped { from_secs, to_secs } => write!(
                f,
                "cache_ttl_secs {} exceeds ttl_secs, using {}",
                from_secs, to_secs
            ),
            Self::NegativeCacheTtlClamped { from_secs, to_secs } => write!(
                f,
                "negative_cache_ttl_secs {} exceeds cache_ttl_secs, using {}",
                from_secs, to_secs
            ),
        }
    }
}

impl KnockConfig {
    /// Read the file at `path` (or `KNOCKRD_CONFIG`, or defaults when
    /// neither is set), apply env overrides, normalize and validate.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<ConfigAdjustment>), ConfigError> {
        let from_env = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        let adjustments = config.normalize();
        config.validate()?;
        Ok((config, adjustments))
    }

    /// Parse a file as TOML when it ends in `.toml`, YAML otherwise.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        let parsed = if is_toml {
            toml::from_str(&contents).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&contents).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::LoadFailed {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Override fields from the process environment.
    ///
    /// Environment variables:
    /// - `KNOCKRD_TABLE_NAME`
    /// - `KNOCKRD_STORE_PATH`
    /// - `KNOCKRD_TTL_SECS`, `KNOCKRD_CACHE_TTL_SECS`, `KNOCKRD_NEGATIVE_CACHE_TTL_SECS`
    /// - `KNOCKRD_STORE_TIMEOUT_MS`, `KNOCKRD_SINK_TIMEOUT_MS`
    /// - `KNOCKRD_CONSUL_ADDRESS`, `KNOCKRD_CONSUL_DATACENTER`, `KNOCKRD_CONSUL_KV_PATH`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Same as [`apply_env`](Self::apply_env) with an injectable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(table) = var("KNOCKRD_TABLE_NAME") {
            self.table_name = table;
        }
        if let Some(path) = var("KNOCKRD_STORE_PATH") {
            self.store_path = Some(PathBuf::from(path));
        }
        if let Some(v) = var("KNOCKRD_TTL_SECS") {
            self.ttl_secs = parse_env("KNOCKRD_TTL_SECS", &v)?;
        }
        if let Some(v) = var("KNOCKRD_CACHE_TTL_SECS") {
            self.cache_ttl_secs = parse_env("KNOCKRD_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = var("KNOCKRD_NEGATIVE_CACHE_TTL_SECS") {
            self.negative_cache_ttl_secs = parse_env("KNOCKRD_NEGATIVE_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = var("KNOCKRD_STORE_TIMEOUT_MS") {
            self.store_timeout_ms = parse_env("KNOCKRD_STORE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("KNOCKRD_SINK_TIMEOUT_MS") {
            self.sink_timeout_ms = parse_env("KNOCKRD_SINK_TIMEOUT_MS", &v)?;
        }
        if let Some(address) = var("KNOCKRD_CONSUL_ADDRESS") {
            match self.consul.as_mut() {
                Some(consul) => consul.address = address,
                None => self.consul = Some(ConsulConfig::new(address)),
            }
        }
        if let Some(consul) = self.consul.as_mut() {
            if let Some(dc) = var("KNOCKRD_CONSUL_DATACENTER") {
                consul.datacenter = Some(dc);
            }
            if let Some(path) = var("KNOCKRD_CONSUL_KV_PATH") {
                consul.kv_path = Some(path);
            }
        }
        Ok(())
    }

    /// Clamp cache TTLs so that negative <= positive <= store TTL.
    pub fn normalize(&mut self) -> Vec<ConfigAdjustment> {
        let mut adjustments = Vec::new();
        if self.cache_ttl_secs > self.ttl_secs {
            adjustments.push(ConfigAdjustment::CacheTtlClamped {
                from_secs: self.cache_ttl_secs,
                to_secs: self.ttl_secs,
            });
            self.cache_ttl_secs = self.ttl_secs;
        }
        if self.negative_cache_ttl_secs > self.cache_ttl_secs {
            adjustments.push(ConfigAdjustment::NegativeCacheTtlClamped {
                from_secs: self.negative_cache_ttl_secs,
                to_secs: self.cache_ttl_secs,
            });
            self.negative_cache_ttl_secs = self.cache_ttl_secs;
        }
        adjustments
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_name.trim().is_empty() {
            return Err(ConfigError::missing("table_name"));
        }
        if self.ttl_secs == 0 {
            return Err(ConfigError::invalid("ttl_secs", self.ttl_secs, "must be > 0"));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "store_timeout_ms",
                self.store_timeout_ms,
                "must be > 0",
            ));
        }
        if self.sink_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "sink_timeout_ms",
                self.sink_timeout_ms,
                "must be > 0",
            ));
        }
        if self.store_path.is_some() && self.store_map_size_mb == 0 {
            return Err(ConfigError::invalid(
                "store_map_size_mb",
                self.store_map_size_mb,
                "must be > 0",
            ));
        }
        if self.provisioning.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "provisioning.max_attempts",
                self.provisioning.max_attempts,
                "must be > 0",
            ));
        }
        if self.provisioning.max_delay_ms < self.provisioning.min_delay_ms {
            return Err(ConfigError::invalid(
                "provisioning.max_delay_ms",
                self.provisioning.max_delay_ms,
                "must be >= min_delay_ms",
            ));
        }

        if let Some(ip_set) = &self.ip_set {
            validate_list_target("ip_set.v4", ip_set.v4.as_ref())?;
            validate_list_target("ip_set.v6", ip_set.v6.as_ref())?;
        }

        for (i, group) in self.security_groups.iter().enumerate() {
            if group.id.trim().is_empty() {
                return Err(ConfigError::missing(format!("security_groups[{}].id", i)));
            }
            if group.protocol.trim().is_empty() {
                return Err(ConfigError::missing(format!(
                    "security_groups[{}].protocol",
                    i
                )));
            }
            if group.from_port > group.to_port {
                return Err(ConfigError::invalid(
                    format!("security_groups[{}].from_port", i),
                    group.from_port,
                    "must be <= to_port",
                ));
            }
        }

        if let Some(consul) = &self.consul {
            if consul.address.trim().is_empty() {
                return Err(ConfigError::missing("consul.address"));
            }
            if consul.scheme != "http" && consul.scheme != "https" {
                return Err(ConfigError::invalid(
                    "consul.scheme",
                    &consul.scheme,
                    "must be http or https",
                ));
            }
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_cache_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_ttl_secs > 0
    }
}

fn validate_list_target(field: &str, target: Option<&ListTarget>) -> Result<(), ConfigError> {
    let Some(target) = target else {
        return Ok(());
    };
    if target.id.trim().is_empty() {
        return Err(ConfigError::missing(format!("{}.id", field)));
    }
    if target.name.trim().is_empty() {
        return Err(ConfigError::missing(format!("{}.name", field)));
    }
    Ok(())
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(name, value, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::ListScope;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE_YAML: &str = r#"
table_name: knock-test
ttl_secs: 1800
cache_ttl_secs: 20
ip_set:
  v4:
    id: ipset-v4
    name: knockrd-v4
    scope: REGIONAL
  v6:
    id: ipset-v6
    name: knockrd-v6
    scope: CLOUDFRONT
security_groups:
  - id: sg-0123
    from_port: 22
    to_port: 22
    protocol: tcp
consul:
  address: 127.0.0.1:8500
  datacenter: dc1
"#;

    #[test]
    fn test_defaults() {
        let config = KnockConfig::default();
        assert_eq!(config.table_name, DEFAULT_TABLE);
        assert_eq!(config.ttl(), Duration::from_secs(3600));
        assert_eq!(config.cache_ttl(), Duration::from_secs(10));
        assert_eq!(config.store_timeout(), Duration::from_secs(30));
        assert!(config.cache_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let config = KnockConfig::from_yaml_str(SAMPLE_YAML).expect("parse");
        assert_eq!(config.table_name, "knock-test");
        assert_eq!(config.ttl_secs, 1800);
        assert_eq!(config.negative_cache_ttl_secs, 5);
        let ip_set = config.ip_set.as_ref().expect("ip_set");
        assert_eq!(ip_set.v6.as_ref().map(|t| t.scope), Some(ListScope::CloudFront));
        assert_eq!(config.security_groups.len(), 1);
        let consul = config.consul.as_ref().expect("consul");
        assert_eq!(consul.scheme, "http");
        assert_eq!(consul.base_url(), "http://127.0.0.1:8500");
        assert_eq!(consul.kv_target().prefix, DEFAULT_KV_PREFIX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_scope_rejected() {
        let yaml = "ip_set:\n  v4:\n    id: a\n    name: b\n    scope: GLOBAL\n";
        let err = KnockConfig::from_yaml_str(yaml).expect_err("bad scope");
        assert!(matches!(err, ConfigError::LoadFailed { .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(KnockConfig::from_yaml_str("tll_secs: 5\n").is_err());
    }

    #[test]
    fn test_from_path_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        writeln!(file, "table_name = \"from-toml\"\nttl_secs = 60").expect("write");
        let config = KnockConfig::from_path(file.path()).expect("load");
        assert_eq!(config.table_name, "from-toml");
        assert_eq!(config.ttl_secs, 60);
    }

    #[test]
    fn test_from_path_missing_file() {
        let err = KnockConfig::from_path(Path::new("/nonexistent/knockrd.yaml"))
            .expect_err("missing");
        assert!(matches!(err, ConfigError::LoadFailed { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KNOCKRD_TTL_SECS", "120"),
            ("KNOCKRD_TABLE_NAME", "from-env"),
            ("KNOCKRD_CONSUL_ADDRESS", "consul:8500"),
            ("KNOCKRD_CONSUL_DATACENTER", "dc2"),
            ("KNOCKRD_SINK_TIMEOUT_MS", ""),
        ]
        .into_iter()
        .collect();
        let mut config = KnockConfig::default();
        config
            .apply_env_from(|name| env.get(name).map(|v| v.to_string()))
            .expect("apply");
        assert_eq!(config.ttl_secs, 120);
        assert_eq!(config.table_name, "from-env");
        assert_eq!(config.sink_timeout_ms, DEFAULT_TIMEOUT_MS);
        let consul = config.consul.expect("consul");
        assert_eq!(consul.address, "consul:8500");
        assert_eq!(consul.datacenter.as_deref(), Some("dc2"));
    }

    #[test]
    fn test_env_invalid_number() {
        let mut config = KnockConfig::default();
        let err = config
            .apply_env_from(|name| (name == "KNOCKRD_TTL_SECS").then(|| "soon".to_string()))
            .expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_normalize_clamps_cache_ttls() {
        let mut config = KnockConfig {
            ttl_secs: 30,
            cache_ttl_secs: 60,
            negative_cache_ttl_secs: 45,
            ..KnockConfig::default()
        };
        let adjustments = config.normalize();
        assert_eq!(config.cache_ttl_secs, 30);
        assert_eq!(config.negative_cache_ttl_secs, 30);
        assert_eq!(
            adjustments,
            vec![
                ConfigAdjustment::CacheTtlClamped {
                    from_secs: 60,
                    to_secs: 30
                },
                ConfigAdjustment::NegativeCacheTtlClamped {
                    from_secs: 45,
                    to_secs: 30
                },
            ]
        );
    }

    #[test]
    fn test_zero_cache_ttl_disables_cache() {
        let mut config = KnockConfig {
            cache_ttl_secs: 0,
            ..KnockConfig::default()
        };
        config.normalize();
        assert!(!config.cache_enabled());
        assert_eq!(config.negative_cache_ttl_secs, 0);
    }

    #[test]
    fn test_validate_rejects_bad_targets() {
        let mut config = KnockConfig::from_yaml_str(SAMPLE_YAML).expect("parse");
        config.security_groups[0].from_port = 100;
        config.security_groups[0].to_port = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut config = KnockConfig::from_yaml_str(SAMPLE_YAML).expect("parse");
        if let Some(ip_set) = config.ip_set.as_mut() {
            if let Some(v4) = ip_set.v4.as_mut() {
                v4.id = String::new();
            }
        }
        assert_eq!(
            config.validate(),
            Err(ConfigError::missing("ip_set.v4.id"))
        );

        let mut config = KnockConfig::default();
        config.table_name = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::missing("table_name")));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(3000));
    }
}
