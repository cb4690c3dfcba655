/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{FlowProtocol, DEFAULT_LOG_FILE};
use crate::lookup::HostTags;
use crate::store::Layout;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86400);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
    #[error("multiplexer {0} has no parsers")]
    NoParsers(String),
    #[error("multiplexer {0} listens on port 0")]
    ZeroPort(String),
    #[error("port {0} used by more than one multiplexer")]
    DuplicatePort(u16),
    #[error("multiplexer {0} mixes sflow with version sniffed parsers")]
    SflowSharesPort(String),
    #[error("{0} must not be zero")]
    ZeroDuration(&'static str),
    #[error("layout {0} defined twice")]
    DuplicateLayout(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MultiplexerConfig {
    pub name: String,
    pub enabled: bool,
    pub port: u16,
    pub parsers: Vec<FlowProtocol>,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            enabled: true,
            port: 2055,
            parsers: vec![
                FlowProtocol::Netflow5,
                FlowProtocol::Netflow9,
                FlowProtocol::Ipfix,
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TemplateCleanupConfig {
    #[serde(with = "humantime_serde")]
    pub netflow9_cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub ipfix_cleanup_interval: Duration,
}

impl Default for TemplateCleanupConfig {
    fn default() -> Self {
        Self {
            netflow9_cleanup_interval: 2 * DAY,
            ipfix_cleanup_interval: 2 * DAY,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DuplicateFlaggingConfig {
    #[serde(with = "humantime_serde")]
    pub claim_expiration_lifespan: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for DuplicateFlaggingConfig {
    fn default() -> Self {
        Self {
            claim_expiration_lifespan: 10 * MINUTE,
            cleanup_interval: HOUR,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TraceRetentionConfig {
    #[serde(with = "humantime_serde")]
    pub lifespan: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for TraceRetentionConfig {
    fn default() -> Self {
        Self {
            lifespan: 7 * DAY,
            cleanup_interval: HOUR,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DnsConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub invalidation_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            invalidation_duration: 2 * DAY,
            cleanup_interval: 6 * HOUR,
            check_interval: DAY,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TagsConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub refresh_period: Duration,
    pub static_tags: HostTags,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_period: HOUR,
            static_tags: HostTags::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ImportMetricsConfig {
    #[serde(with = "humantime_serde")]
    pub summation_period: Duration,
    #[serde(with = "humantime_serde")]
    pub save_period: Duration,
}

impl Default for ImportMetricsConfig {
    fn default() -> Self {
        Self {
            summation_period: Duration::from_secs(10),
            save_period: 12 * HOUR,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StatsConfig {
    pub statsd_address: Option<SocketAddr>,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            statsd_address: None,
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log_file: String,
    pub log_level: String,
    pub log_retention: usize,
    pub multiplexers: Vec<MultiplexerConfig>,
    pub template_cleanup: TemplateCleanupConfig,
    pub duplicate_flagging: DuplicateFlaggingConfig,
    pub trace_retention: TraceRetentionConfig,
    pub dns: DnsConfig,
    pub tags: TagsConfig,
    pub import_metrics: ImportMetricsConfig,
    pub stats: StatsConfig,
    pub layouts: Vec<Layout>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file: DEFAULT_LOG_FILE.to_owned(),
            log_level: "info".to_owned(),
            log_retention: 30,
            multiplexers: vec![MultiplexerConfig::default()],
            template_cleanup: Default::default(),
            duplicate_flagging: Default::default(),
            trace_retention: Default::default(),
            dns: Default::default(),
            tags: Default::default(),
            import_metrics: Default::default(),
            stats: Default::default(),
            layouts: vec![],
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        let mut cfg = if contents.trim().is_empty() {
            // parsing empty string leads to EOF error
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(contents)
                .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?
        };

        // convert relative path to absolute
        if Path::new(&cfg.log_file).is_relative() {
            let Ok(mut pb) = env::current_dir() else {
                return Err(ConfigError::YamlConfigInvalid("get cwd failed".to_owned()));
            };
            pb.push(&cfg.log_file);
            match pb.to_str() {
                Some(s) => cfg.log_file = s.to_owned(),
                None => {
                    return Err(ConfigError::YamlConfigInvalid(format!(
                        "invalid log path {}",
                        cfg.log_file
                    )))
                }
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ports = HashSet::new();
        for m in self.multiplexers.iter() {
            if m.parsers.is_empty() {
                return Err(ConfigError::NoParsers(m.name.clone()));
            }
            if m.port == 0 {
                return Err(ConfigError::ZeroPort(m.name.clone()));
            }
            if m.parsers.contains(&FlowProtocol::Sflow)
                && m.parsers.iter().any(|p| *p != FlowProtocol::Sflow)
            {
                return Err(ConfigError::SflowSharesPort(m.name.clone()));
            }
            if !ports.insert(m.port) {
                return Err(ConfigError::DuplicatePort(m.port));
            }
        }

        let durations = [
            (
                "duplicate-flagging.claim-expiration-lifespan",
                self.duplicate_flagging.claim_expiration_lifespan,
            ),
            ("trace-retention.lifespan", self.trace_retention.lifespan),
            (
                "trace-retention.cleanup-interval",
                self.trace_retention.cleanup_interval,
            ),
            (
                "import-metrics.summation-period",
                self.import_metrics.summation_period,
            ),
            ("stats.interval", self.stats.interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ZeroDuration(*name));
        }

        let mut names = HashSet::new();
        for layout in self.layouts.iter() {
            if !names.insert(layout.name.as_str()) {
                return Err(ConfigError::DuplicateLayout(layout.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::layer::LayerKind;

    #[test]
    fn empty_file_gives_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\n").unwrap();
        let c = Config::load_from_file(file.path()).unwrap();
        assert_eq!(c.log_file, DEFAULT_LOG_FILE);
        assert_eq!(c.log_level, "info");
        assert_eq!(c.multiplexers, vec![MultiplexerConfig::default()]);
        assert_eq!(c.duplicate_flagging.claim_expiration_lifespan, 10 * MINUTE);
        assert_eq!(c.template_cleanup.ipfix_cleanup_interval, 2 * DAY);
        assert_eq!(c.trace_retention.lifespan, 7 * DAY);
        assert!(c.dns.enabled);
        assert!(!c.tags.enabled);
        assert!(c.layouts.is_empty());
    }

    #[test]
    fn read_yaml_file() {
        let yaml = r#"
log-file: /tmp/packrat/packrat.log
log-level: debug
multiplexers:
  - name: netflow
    port: 2055
    parsers: [netflow5, netflow9, ipfix]
  - name: sflow
    port: 6343
    parsers: [sflow]
  - name: spare
    enabled: false
    port: 9995
    parsers: [ipfix]
duplicate-flagging:
  claim-expiration-lifespan: 5m
trace-retention:
  lifespan: 2h
dns:
  enabled: false
tags:
  enabled: true
  refresh-period: 30m
  static-tags:
    10.0.0.1: [vm, web]
stats:
  statsd-address: 127.0.0.1:8125
layouts:
  - name: default
    query-conditions:
      data-protocols: [tcp]
    layers:
      - type: filter
        implicit-include: true
        conditions: []
      - type: vmware-tagging
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let c = Config::load_from_file(file.path()).unwrap();

        assert_eq!(c.log_level, "debug");
        assert_eq!(c.multiplexers.len(), 3);
        assert!(!c.multiplexers[2].enabled);
        assert_eq!(c.multiplexers[1].parsers, vec![FlowProtocol::Sflow]);
        assert_eq!(c.duplicate_flagging.claim_expiration_lifespan, 5 * MINUTE);
        assert_eq!(c.duplicate_flagging.cleanup_interval, HOUR);
        assert_eq!(c.trace_retention.lifespan, 2 * HOUR);
        assert_eq!(c.trace_retention.cleanup_interval, HOUR);
        assert!(!c.dns.enabled);
        assert_eq!(c.tags.refresh_period, 30 * MINUTE);
        assert_eq!(
            c.tags.static_tags[&"10.0.0.1".parse().unwrap()],
            vec!["vm".to_owned(), "web".to_owned()]
        );
        assert_eq!(c.stats.statsd_address, Some("127.0.0.1:8125".parse().unwrap()));
        assert_eq!(c.layouts[0].layers.len(), 2);
        assert!(matches!(c.layouts[0].layers[1].kind, LayerKind::VmwareTagging(_)));
    }

    #[test]
    fn relative_log_file_made_absolute() {
        let c = Config::load("log-file: packrat.log").unwrap();
        assert!(Path::new(&c.log_file).is_absolute());
        assert!(c.log_file.ends_with("packrat.log"));
    }

    #[test]
    fn invalid_multiplexers_rejected() {
        let cases = [
            (
                "multiplexers: [{name: a, port: 2055, parsers: []}]",
                ConfigError::NoParsers("a".to_owned()),
            ),
            (
                "multiplexers: [{name: a, port: 0, parsers: [netflow5]}]",
                ConfigError::ZeroPort("a".to_owned()),
            ),
            (
                "multiplexers: [{name: a, port: 6343, parsers: [sflow, ipfix]}]",
                ConfigError::SflowSharesPort("a".to_owned()),
            ),
            (
                "multiplexers: [{name: a, port: 2055, parsers: [netflow5]}, {name: b, port: 2055, parsers: [ipfix]}]",
                ConfigError::DuplicatePort(2055),
            ),
        ];
        for (yaml, expected) in cases {
            assert_eq!(Config::load(yaml).unwrap_err(), expected, "{}", yaml);
        }
    }

    #[test]
    fn bad_yaml_and_durations() {
        assert!(matches!(
            Config::load("multiplexers: 3"),
            Err(ConfigError::YamlConfigInvalid(_))
        ));
        assert!(matches!(
            Config::load("multiplexers: [{name: a, parsers: [netflow7]}]"),
            Err(ConfigError::YamlConfigInvalid(_))
        ));
        assert_eq!(
            Config::load("stats: {interval: 0s}").unwrap_err(),
            ConfigError::ZeroDuration("stats.interval")
        );
        assert_eq!(
            Config::load("trace-retention: {lifespan: 0s}").unwrap_err(),
            ConfigError::ZeroDuration("trace-retention.lifespan")
        );
        assert_eq!(
            Config::load("layouts: [{name: a}, {name: a}]").unwrap_err(),
            ConfigError::DuplicateLayout("a".to_owned())
        );
    }
}
