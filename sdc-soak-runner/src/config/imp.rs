// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::{DUMMY_PASSPHRASE, tls_material_from_folder},
    device::{Epr, LocationDetail, NetworkAdapter, TlsMaterial},
    errors::{AdapterSelectionError, ConfigParseError, ConfigParseErrorKind, TlsConfigError},
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{
    Config, ConfigBuilder, ConfigError, Environment, File, FileFormat, builder::DefaultState,
};
use serde::Deserialize;
use std::{net::IpAddr, time::Duration};
use tracing::{debug, warn};

/// Where environment variables are read from.
#[derive(Clone, Debug, Default)]
pub enum EnvironmentSource {
    /// The process environment.
    #[default]
    Process,

    /// A fixed set of variables. Useful for tests.
    Custom(config::Map<String, String>),
}

/// Command-line overrides, applied on top of every other layer.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    entries: Vec<(String, String)>,
}

impl ConfigOverrides {
    /// Creates an empty set of overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `key` with `value`. Nested keys are separated with `.`, e.g. `fault.duration`.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.entries.push((key.into(), value.to_string()));
        self
    }

    /// Returns true if no overrides are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Settings for service discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoverySettings {
    /// Give up after this long.
    pub timeout: Duration,

    /// Give up after this many unsuccessful searches. `None` means no cap.
    pub max_attempts: Option<usize>,

    /// How long to wait between searches.
    pub retry_interval: Duration,
}

/// Settings for supervising the background provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartupSettings {
    /// How long to wait for readiness.
    pub timeout: Duration,

    /// How often to check on a provider task that has not signalled.
    pub poll_interval: Duration,
}

/// Timings of the fault injector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FaultSettings {
    /// Total run time.
    pub duration: Duration,

    /// Interval between ticks.
    pub tick: Duration,

    /// Minimum time between simulated outages.
    pub reconnect_interval: Duration,

    /// How long each outage lasts.
    pub outage: Duration,

    /// How long to wait after an outage before writing values again.
    pub settle: Duration,

    /// Inject a wrongly-typed value on one tick in this many.
    pub bad_value_every: u64,
}

/// Settings for the throughput measurement.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThroughputSettings {
    /// How long to sample updates.
    pub duration: Duration,

    /// How often the provider updates its metrics while sampling.
    pub send_interval: Duration,
}

/// The compiled sdc-soak configuration.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// The endpoint reference the consumer searches for.
    pub search_epr: Epr,

    /// Prefer a loopback adapter.
    pub use_loopback: bool,

    /// Bind to the adapter with this address, if it exists.
    pub ip: Option<IpAddr>,

    /// Where to put log files.
    pub log_dir: Option<Utf8PathBuf>,

    /// Where to capture protocol traffic. `None` means the default directory.
    pub commlog_dir: Option<Utf8PathBuf>,

    /// Whether to capture protocol traffic.
    pub enable_commlog: bool,

    /// Folder with TLS material. TLS is disabled if unset.
    pub ca_folder: Option<Utf8PathBuf>,

    /// Passphrase for the TLS private key.
    pub ssl_passwd: Option<String>,

    /// Service discovery.
    pub discovery: DiscoverySettings,

    /// Bound on connecting to the discovered provider.
    pub connect_timeout: Duration,

    /// Bound on each operation invocation.
    pub operation_timeout: Duration,

    /// How long to collect updates.
    pub metric_wait: Duration,

    /// Minimum updates per entity, if set explicitly.
    pub min_updates: Option<usize>,

    /// The reference provider's location.
    pub location: LocationDetail,

    /// How often the reference provider updates its metrics.
    pub send_interval: Duration,

    /// Supervising the background provider.
    pub startup: StartupSettings,

    /// The fault injector.
    pub fault: FaultSettings,

    /// The throughput measurement.
    pub throughput: ThroughputSettings,
}

impl HarnessConfig {
    /// Contains the default config as a TOML file.
    ///
    /// Config files, the environment and overrides are layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Environment configuration uses this prefix, plus a _.
    pub const ENVIRONMENT_PREFIX: &'static str = "ref";

    /// Reads the config from its layers.
    pub fn from_sources(
        config_file: Option<&Utf8Path>,
        environment: EnvironmentSource,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigParseError> {
        let make_error =
            |kind| ConfigParseError::new(config_file.map(Utf8Path::to_path_buf), kind);

        let mut builder = Self::make_default_config();
        if let Some(config_file) = config_file {
            builder = builder.add_source(File::new(config_file.as_str(), FileFormat::Toml));
        }

        let mut env = Environment::with_prefix(Self::ENVIRONMENT_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        if let EnvironmentSource::Custom(vars) = environment {
            env = env.source(Some(vars));
        }
        builder = builder.add_source(env);

        for (key, value) in &overrides.entries {
            builder = builder
                .set_override(key.as_str(), value.as_str())
                .map_err(|error| make_error(ConfigParseErrorKind::BuildError(Box::new(error))))?;
        }

        let deserialized = Self::build_and_deserialize_config(&builder).map_err(make_error)?;
        deserialized.compile().map_err(make_error)
    }

    /// Returns the number of updates each entity must receive.
    ///
    /// Unless set explicitly, this is `metric_wait / 5 - 1`, floored and saturating at zero.
    pub fn update_threshold(&self) -> usize {
        self.min_updates.unwrap_or_else(|| {
            let fifths = (self.metric_wait.as_secs_f64() / 5.0).floor() as usize;
            fifths.saturating_sub(1)
        })
    }

    /// Picks the adapter to bind discovery to.
    ///
    /// An adapter matching [`ip`](Self::ip) wins. Otherwise the first adapter whose loopback-ness
    /// matches [`use_loopback`](Self::use_loopback) is used, falling back to the first adapter.
    pub fn select_adapter(
        &self,
        adapters: &[NetworkAdapter],
    ) -> Result<NetworkAdapter, AdapterSelectionError> {
        if let Some(ip) = self.ip {
            match adapters.iter().find(|adapter| adapter.ip == ip) {
                Some(adapter) => return Ok(adapter.clone()),
                None => warn!("no network adapter with address {ip}, ignoring it"),
            }
        }

        if let Some(adapter) = adapters
            .iter()
            .find(|adapter| adapter.is_loopback() == self.use_loopback)
        {
            return Ok(adapter.clone());
        }

        let fallback = adapters.first().ok_or(AdapterSelectionError::NoAdapters)?;
        warn!(
            "no {} network adapter found, using {} ({})",
            if self.use_loopback {
                "loopback"
            } else {
                "non-loopback"
            },
            fallback.name,
            fallback.ip,
        );
        Ok(fallback.clone())
    }

    /// Loads TLS material from [`ca_folder`](Self::ca_folder), if set.
    pub fn tls_material(&self) -> Result<Option<TlsMaterial>, TlsConfigError> {
        let Some(folder) = &self.ca_folder else {
            return Ok(None);
        };
        if self.ssl_passwd.as_deref() == Some(DUMMY_PASSPHRASE) {
            warn!(
                "using the default TLS passphrase `{DUMMY_PASSPHRASE}`; set `ref_ssl_passwd` for \
                 anything but local testing"
            );
        }
        tls_material_from_folder(folder, self.ssl_passwd.clone()).map(Some)
    }

    /// Logs the effective configuration at debug level.
    pub fn log_effective(&self) {
        debug!("search EPR: {}", self.search_epr);
        debug!(
            "discovery: timeout {}, attempts {}, retry every {}",
            humantime::format_duration(self.discovery.timeout),
            self.discovery
                .max_attempts
                .map_or_else(|| "unlimited".to_owned(), |n| n.to_string()),
            humantime::format_duration(self.discovery.retry_interval),
        );
        debug!(
            "metric wait {} (threshold {}), operation timeout {}",
            humantime::format_duration(self.metric_wait),
            self.update_threshold(),
            humantime::format_duration(self.operation_timeout),
        );
        debug!(
            "TLS: {}",
            self.ca_folder
                .as_ref()
                .map_or_else(|| "disabled".to_owned(), |folder| format!("`{folder}`")),
        );
    }

    // ---
    // Helper methods
    // ---

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<HarnessConfigDeserialize, ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        serde_path_to_error::deserialize(config).map_err(|error| {
            // Both serde_path_to_error and the config crate report the key. We drop the key from
            // the config error for consistency.
            let path = error.path().clone();
            let config_error = error.into_inner();
            let error = match config_error {
                ConfigError::At { error, .. } => *error,
                other => other,
            };
            ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                path, error,
            )))
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
struct HarnessConfigDeserialize {
    #[serde(default)]
    search_epr: Option<String>,
    use_loopback: bool,
    #[serde(default)]
    ip: Option<IpAddr>,
    #[serde(default)]
    log_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    commlog_dir: Option<Utf8PathBuf>,
    enable_commlog: bool,
    #[serde(default)]
    ca: Option<Utf8PathBuf>,
    #[serde(default)]
    ssl_passwd: Option<String>,
    discovery_timeout: f64,
    discovery_runs: usize,
    discovery_retry_interval: f64,
    connect_timeout: f64,
    operation_timeout: f64,
    metric_wait: f64,
    min_updates: usize,
    fac: String,
    poc: String,
    bed: String,
    send_interval: f64,
    startup: StartupDeserialize,
    fault: FaultDeserialize,
    throughput: ThroughputDeserialize,
}

#[derive(Clone, Debug, Deserialize)]
struct StartupDeserialize {
    timeout: f64,
    poll_interval: f64,
}

#[derive(Clone, Debug, Deserialize)]
struct FaultDeserialize {
    duration: f64,
    tick: f64,
    reconnect_interval: f64,
    outage: f64,
    settle: f64,
    bad_value_every: u64,
}

#[derive(Clone, Debug, Deserialize)]
struct ThroughputDeserialize {
    duration: f64,
    send_interval: f64,
}

impl HarnessConfigDeserialize {
    fn compile(self) -> Result<HarnessConfig, ConfigParseErrorKind> {
        let search_epr = match &self.search_epr {
            Some(epr) => epr
                .parse::<Epr>()
                .map_err(|error| ConfigParseErrorKind::InvalidValue {
                    key: "search_epr",
                    reason: error.to_string(),
                })?,
            None => Epr::new_v4(),
        };

        if self.fault.bad_value_every == 0 {
            return Err(ConfigParseErrorKind::InvalidValue {
                key: "fault.bad_value_every",
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(HarnessConfig {
            search_epr,
            use_loopback: self.use_loopback,
            ip: self.ip,
            log_dir: self.log_dir,
            commlog_dir: self.commlog_dir,
            enable_commlog: self.enable_commlog,
            ca_folder: self.ca,
            ssl_passwd: self.ssl_passwd,
            discovery: DiscoverySettings {
                timeout: seconds("discovery_timeout", self.discovery_timeout)?,
                max_attempts: (self.discovery_runs > 0).then_some(self.discovery_runs),
                retry_interval: seconds("discovery_retry_interval", self.discovery_retry_interval)?,
            },
            connect_timeout: positive_seconds("connect_timeout", self.connect_timeout)?,
            operation_timeout: positive_seconds("operation_timeout", self.operation_timeout)?,
            metric_wait: seconds("metric_wait", self.metric_wait)?,
            min_updates: (self.min_updates > 0).then_some(self.min_updates),
            location: LocationDetail {
                facility: self.fac,
                point_of_care: self.poc,
                bed: self.bed,
            },
            send_interval: positive_seconds("send_interval", self.send_interval)?,
            startup: StartupSettings {
                timeout: seconds("startup.timeout", self.startup.timeout)?,
                poll_interval: positive_seconds(
                    "startup.poll_interval",
                    self.startup.poll_interval,
                )?,
            },
            fault: FaultSettings {
                duration: seconds("fault.duration", self.fault.duration)?,
                tick: positive_seconds("fault.tick", self.fault.tick)?,
                reconnect_interval: positive_seconds(
                    "fault.reconnect_interval",
                    self.fault.reconnect_interval,
                )?,
                outage: seconds("fault.outage", self.fault.outage)?,
                settle: seconds("fault.settle", self.fault.settle)?,
                bad_value_every: self.fault.bad_value_every,
            },
            throughput: ThroughputSettings {
                duration: positive_seconds("throughput.duration", self.throughput.duration)?,
                send_interval: positive_seconds(
                    "throughput.send_interval",
                    self.throughput.send_interval,
                )?,
            },
        })
    }
}

fn seconds(key: &'static str, value: f64) -> Result<Duration, ConfigParseErrorKind> {
    Duration::try_from_secs_f64(value).map_err(|error| ConfigParseErrorKind::InvalidValue {
        key,
        reason: format!("{value} is not a valid number of seconds ({error})"),
    })
}

fn positive_seconds(key: &'static str, value: f64) -> Result<Duration, ConfigParseErrorKind> {
    let duration = seconds(key, value)?;
    if duration.is_zero() {
        return Err(ConfigParseErrorKind::InvalidValue {
            key,
            reason: "must be greater than zero".to_owned(),
        });
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use newtype_uuid::GenericUuid;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use test_case::test_case;

    fn env(vars: &[(&str, &str)]) -> EnvironmentSource {
        EnvironmentSource::Custom(
            vars.iter()
                .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                .collect(),
        )
    }

    fn load(vars: &[(&str, &str)], overrides: &ConfigOverrides) -> HarnessConfig {
        HarnessConfig::from_sources(None, env(vars), overrides).expect("config is valid")
    }

    #[test]
    fn default_config_is_valid() {
        let config = load(&[], &ConfigOverrides::new());

        assert_eq!(config.search_epr.as_untyped_uuid().get_version_num(), 4);
        assert!(!config.use_loopback);
        assert!(config.enable_commlog);
        assert_eq!(config.ca_folder, None);
        assert_eq!(config.ssl_passwd.as_deref(), Some(DUMMY_PASSPHRASE));
        assert_eq!(
            config.discovery,
            DiscoverySettings {
                timeout: Duration::from_secs(30),
                max_attempts: None,
                retry_interval: Duration::from_millis(100),
            }
        );
        assert_eq!(config.operation_timeout, Duration::from_secs(10));
        assert_eq!(config.metric_wait, Duration::from_secs(20));
        assert_eq!(config.min_updates, None);
        assert_eq!(config.location.to_string(), "r_fac/r_poc/r_bed");
        assert_eq!(config.fault.duration, Duration::from_secs(30));
        assert_eq!(config.fault.tick, Duration::from_millis(500));
        assert_eq!(config.fault.bad_value_every, 5);
        assert_eq!(config.throughput.duration, Duration::from_secs(5));
    }

    #[test]
    fn search_epr_is_fresh_unless_configured() {
        let first = load(&[], &ConfigOverrides::new());
        let second = load(&[], &ConfigOverrides::new());
        assert_ne!(first.search_epr, second.search_epr);

        let epr = "12345678-6f55-11ea-9697-123456789abc";
        let from_env = load(&[("ref_search_epr", epr)], &ConfigOverrides::new());
        assert_eq!(from_env.search_epr.to_string(), epr);

        let mut overrides = ConfigOverrides::new();
        overrides.set("search_epr", epr);
        let from_override = load(&[], &overrides);
        assert_eq!(from_override.search_epr, from_env.search_epr);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = load(
            &[
                ("ref_use_loopback", "true"),
                ("ref_ip", "127.0.0.1"),
                ("ref_discovery_runs", "3"),
                ("ref_metric_wait", "7.5"),
                ("ref_min_updates", "4"),
                ("ref_enable_commlog", "false"),
                ("ref_ssl_passwd", "1234"),
                ("ref_fac", "icu"),
                ("ref_fault__duration", "12"),
            ],
            &ConfigOverrides::new(),
        );

        assert!(config.use_loopback);
        assert_eq!(config.ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(config.discovery.max_attempts, Some(3));
        assert_eq!(config.metric_wait, Duration::from_millis(7500));
        assert_eq!(config.min_updates, Some(4));
        assert!(!config.enable_commlog);
        assert_eq!(config.ssl_passwd.as_deref(), Some("1234"));
        assert_eq!(config.location.facility, "icu");
        assert_eq!(config.fault.duration, Duration::from_secs(12));
    }

    #[test]
    fn layers_apply_in_order() {
        let dir = Utf8TempDir::new().unwrap();
        let config_file = dir.path().join("sdc-soak.toml");
        std::fs::write(
            &config_file,
            indoc! {r#"
                metric_wait = 40
                operation_timeout = 3
                bed = "file_bed"

                [fault]
                tick = 0.25
            "#},
        )
        .unwrap();

        let mut overrides = ConfigOverrides::new();
        overrides.set("metric_wait", 15).set("fault.duration", 6);
        let config = HarnessConfig::from_sources(
            Some(&config_file),
            env(&[("ref_operation_timeout", "4")]),
            &overrides,
        )
        .unwrap();

        // The file beats the defaults, the environment beats the file, overrides beat
        // everything.
        assert_eq!(config.location.bed, "file_bed");
        assert_eq!(config.fault.tick, Duration::from_millis(250));
        assert_eq!(config.operation_timeout, Duration::from_secs(4));
        assert_eq!(config.metric_wait, Duration::from_secs(15));
        assert_eq!(config.fault.duration, Duration::from_secs(6));
    }

    #[test_case("search_epr", "not-a-uuid", "search_epr"; "bad epr")]
    #[test_case("operation_timeout", "0", "operation_timeout"; "zero timeout")]
    #[test_case("metric_wait", "-1", "metric_wait"; "negative wait")]
    #[test_case("fault.bad_value_every", "0", "fault.bad_value_every"; "zero cadence")]
    fn invalid_values_are_rejected(key: &str, value: &str, expected_key: &str) {
        let mut overrides = ConfigOverrides::new();
        overrides.set(key, value);
        let error = HarnessConfig::from_sources(None, env(&[]), &overrides)
            .expect_err("value is invalid");

        match error.kind() {
            ConfigParseErrorKind::InvalidValue { key, .. } => assert_eq!(*key, expected_key),
            other => panic!("unexpected error kind: {other}"),
        }
    }

    #[test]
    fn type_errors_report_the_key() {
        let error = HarnessConfig::from_sources(
            None,
            env(&[("ref_discovery_runs", "many")]),
            &ConfigOverrides::new(),
        )
        .expect_err("value has the wrong type");

        match error.kind() {
            ConfigParseErrorKind::DeserializeError(error) => {
                assert_eq!(error.path().to_string(), "discovery_runs");
            }
            other => panic!("unexpected error kind: {other}"),
        }
    }

    #[test_case(20.0, None, 3; "twenty seconds")]
    #[test_case(10.0, None, 1; "ten seconds")]
    #[test_case(22.0, None, 3; "floors")]
    #[test_case(4.0, None, 0; "saturates")]
    #[test_case(20.0, Some(7), 7; "explicit")]
    fn update_threshold(wait_secs: f64, min_updates: Option<usize>, expected: usize) {
        let mut config = load(&[], &ConfigOverrides::new());
        config.metric_wait = Duration::from_secs_f64(wait_secs);
        config.min_updates = min_updates;
        assert_eq!(config.update_threshold(), expected);
    }

    #[test]
    fn adapter_selection() {
        let loopback = NetworkAdapter::new("lo", IpAddr::V4(Ipv4Addr::LOCALHOST));
        let ethernet = NetworkAdapter::new("eth0", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)));
        let both = [loopback.clone(), ethernet.clone()];
        let mut config = load(&[], &ConfigOverrides::new());

        assert_eq!(config.select_adapter(&both).unwrap(), ethernet);

        config.use_loopback = true;
        assert_eq!(config.select_adapter(&both).unwrap(), loopback);

        // An explicit address wins over loopback preference.
        config.ip = Some(ethernet.ip);
        assert_eq!(config.select_adapter(&both).unwrap(), ethernet);

        // An unknown address is ignored.
        config.ip = Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)));
        assert_eq!(config.select_adapter(&both).unwrap(), loopback);

        // Without a matching adapter, the first one is used.
        assert_eq!(
            config.select_adapter(std::slice::from_ref(&ethernet)).unwrap(),
            ethernet
        );

        assert!(matches!(
            config.select_adapter(&[]),
            Err(AdapterSelectionError::NoAdapters)
        ));
    }
}
