use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};

use crate::error::{GovernorError, Result};

pub const REAL_DEBRID: &str = "realdebrid";
pub const ALL_DEBRID: &str = "alldebrid";
pub const TORBOX: &str = "torbox";

/// Tuning for one external service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub max_requests_per_minute: u32,
    pub max_concurrent: usize,
    pub retry_attempts: u32,
    pub backoff_multiplier: f64,
    /// Width of the symmetric jitter band around 1.0, in [0, 1]
    pub jitter_range: f64,
    pub burst_size: u32,
}

impl ServiceConfig {
    pub fn real_debrid() -> Self {
        Self {
            max_requests_per_minute: 250,
            max_concurrent: 3,
            retry_attempts: 7,
            backoff_multiplier: 2.0,
            jitter_range: 0.2,
            burst_size: 10,
        }
    }

    pub fn all_debrid() -> Self {
        Self {
            max_requests_per_minute: 300,
            max_concurrent: 5,
            retry_attempts: 5,
            backoff_multiplier: 1.5,
            jitter_range: 0.3,
            burst_size: 15,
        }
    }

    pub fn torbox() -> Self {
        Self {
            max_requests_per_minute: 500,
            max_concurrent: 8,
            retry_attempts: 10,
            backoff_multiplier: 2.0,
            jitter_range: 0.2,
            burst_size: 20,
        }
    }

    pub fn validate(&self, service: &str) -> Result<()> {
        let reason = if self.max_requests_per_minute == 0 {
            Some("max_requests_per_minute must be at least 1")
        } else if self.max_concurrent == 0 {
            Some("max_concurrent must be at least 1")
        } else if self.burst_size == 0 {
            Some("burst_size must be at least 1")
        } else if !(self.backoff_multiplier >= 1.0) || !self.backoff_multiplier.is_finite() {
            Some("backoff_multiplier must be a finite number >= 1.0")
        } else if !(0.0..=1.0).contains(&self.jitter_range) {
            Some("jitter_range must be within [0, 1]")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(GovernorError::InvalidConfig {
                service: service.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Copy of this config with every supplied field of `update` applied
    pub fn merged(&self, update: &ServiceConfigUpdate) -> Self {
        Self {
            max_requests_per_minute: update
                .max_requests_per_minute
                .unwrap_or(self.max_requests_per_minute),
            max_concurrent: update.max_concurrent.unwrap_or(self.max_concurrent),
            retry_attempts: update.retry_attempts.unwrap_or(self.retry_attempts),
            backoff_multiplier: update.backoff_multiplier.unwrap_or(self.backoff_multiplier),
            jitter_range: update.jitter_range.unwrap_or(self.jitter_range),
            burst_size: update.burst_size.unwrap_or(self.burst_size),
        }
    }
}

/// The three debrid services and their stock tuning
pub fn default_services() -> BTreeMap<String, ServiceConfig> {
    BTreeMap::from([
        (REAL_DEBRID.to_string(), ServiceConfig::real_debrid()),
        (ALL_DEBRID.to_string(), ServiceConfig::all_debrid()),
        (TORBOX.to_string(), ServiceConfig::torbox()),
    ])
}

/// Partial config; `None` fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfigUpdate {
    pub max_requests_per_minute: Option<u32>,
    pub max_concurrent: Option<usize>,
    pub retry_attempts: Option<u32>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_range: Option<f64>,
    pub burst_size: Option<u32>,
}

impl ServiceConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Process-level settings for the governor binary and embedders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    pub log_level: String,
    pub services: BTreeMap<String, ServiceConfig>,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            services: default_services(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    log_level: Option<String>,
    services: BTreeMap<String, ServiceConfigUpdate>,
}

impl GovernorSettings {
    /// Loads settings from a JSON file. Services or fields the file omits keep
    /// their defaults; unknown service names are added (all fields required).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: SettingsFile = serde_json::from_str(raw)?;
        let mut settings = Self::default();
        if let Some(level) = file.log_level {
            settings.log_level = level;
        }

        for (name, update) in file.services {
            let merged = match settings.services.get(&name) {
                Some(existing) => existing.merged(&update),
                None => complete_config(&name, &update)?,
            };
            settings.services.insert(name, merged);
        }
        Ok(settings)
    }

    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_env_without_loading()
    }

    pub fn from_env_without_loading() -> Self {
        let mut settings = Self::default();
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings
    }

    /// Applies `GOVERNOR_*` overrides from `lookup`; values that fail to parse are skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("GOVERNOR_LOG_LEVEL") {
            self.log_level = level;
        }

        for (name, config) in self.services.iter_mut() {
            let prefix = format!("GOVERNOR_{}", env_key(name));
            let update = ServiceConfigUpdate {
                max_requests_per_minute: parse_override(&lookup, &prefix, "REQUESTS_PER_MINUTE"),
                max_concurrent: parse_override(&lookup, &prefix, "MAX_CONCURRENT"),
                retry_attempts: parse_override(&lookup, &prefix, "RETRY_ATTEMPTS"),
                backoff_multiplier: parse_override(&lookup, &prefix, "BACKOFF_MULTIPLIER"),
                jitter_range: parse_override(&lookup, &prefix, "JITTER_RANGE"),
                burst_size: parse_override(&lookup, &prefix, "BURST_SIZE"),
            };
            if !update.is_empty() {
                *config = config.merged(&update);
            }
        }
    }

    pub fn validate_and_log(&self) -> Result<()> {
        info!("⚙️ Governor settings (log level: {}):", self.log_level);
        for (name, config) in &self.services {
            config.validate(name)?;
            info!(
                "   {}: {}req/m, {} concurrent, burst {}, {} retries (x{}, jitter {})",
                name,
                config.max_requests_per_minute,
                config.max_concurrent,
                config.burst_size,
                config.retry_attempts,
                config.backoff_multiplier,
                config.jitter_range
            );
        }
        Ok(())
    }
}

fn complete_config(name: &str, update: &ServiceConfigUpdate) -> Result<ServiceConfig> {
    let missing = |field: &str| GovernorError::InvalidConfig {
        service: name.to_string(),
        reason: format!("new service is missing {}", field),
    };
    Ok(ServiceConfig {
        max_requests_per_minute: update
            .max_requests_per_minute
            .ok_or_else(|| missing("max_requests_per_minute"))?,
        max_concurrent: update.max_concurrent.ok_or_else(|| missing("max_concurrent"))?,
        retry_attempts: update.retry_attempts.ok_or_else(|| missing("retry_attempts"))?,
        backoff_multiplier: update
            .backoff_multiplier
            .ok_or_else(|| missing("backoff_multiplier"))?,
        jitter_range: update.jitter_range.ok_or_else(|| missing("jitter_range"))?,
        burst_size: update.burst_size.ok_or_else(|| missing("burst_size"))?,
    })
}

fn env_key(service: &str) -> String {
    service
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_override<T, F>(lookup: &F, prefix: &str, field: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{}_{}", prefix, field);
    let raw = lookup(&key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_default_table() {
        let services = default_services();
        assert_eq!(services.len(), 3);

        let rd = &services[REAL_DEBRID];
        assert_eq!(rd.max_requests_per_minute, 250);
        assert_eq!(rd.max_concurrent, 3);
        assert_eq!(rd.retry_attempts, 7);
        assert_eq!(rd.burst_size, 10);

        let ad = &services[ALL_DEBRID];
        assert_eq!((ad.max_requests_per_minute, ad.max_concurrent, ad.burst_size), (300, 5, 15));
        assert_eq!(ad.backoff_multiplier, 1.5);

        let tb = &services[TORBOX];
        assert_eq!(
            (tb.max_requests_per_minute, tb.max_concurrent, tb.retry_attempts),
            (500, 8, 10)
        );

        for (name, config) in &services {
            assert!(config.validate(name).is_ok());
        }
    }

    #[test]
    fn test_merge_preserves_unspecified_fields() {
        let base = ServiceConfig::real_debrid();
        let merged = base.merged(&ServiceConfigUpdate {
            max_concurrent: Some(1),
            jitter_range: Some(0.0),
            ..Default::default()
        });

        assert_eq!(merged.max_concurrent, 1);
        assert_eq!(merged.jitter_range, 0.0);
        assert_eq!(merged.max_requests_per_minute, base.max_requests_per_minute);
        assert_eq!(merged.retry_attempts, base.retry_attempts);
        assert_eq!(merged.burst_size, base.burst_size);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            ServiceConfigUpdate {
                max_requests_per_minute: Some(0),
                ..Default::default()
            },
            ServiceConfigUpdate {
                max_concurrent: Some(0),
                ..Default::default()
            },
            ServiceConfigUpdate {
                burst_size: Some(0),
                ..Default::default()
            },
            ServiceConfigUpdate {
                jitter_range: Some(1.5),
                ..Default::default()
            },
            ServiceConfigUpdate {
                backoff_multiplier: Some(0.5),
                ..Default::default()
            },
            ServiceConfigUpdate {
                backoff_multiplier: Some(f64::NAN),
                ..Default::default()
            },
        ];
        for update in bad {
            let config = ServiceConfig::torbox().merged(&update);
            assert!(
                matches!(config.validate(TORBOX), Err(GovernorError::InvalidConfig { .. })),
                "{:?} should be rejected",
                update
            );
        }
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GOVERNOR_LOG_LEVEL", "debug"),
            ("GOVERNOR_REALDEBRID_MAX_CONCURRENT", "2"),
            ("GOVERNOR_TORBOX_JITTER_RANGE", "0.05"),
            ("GOVERNOR_ALLDEBRID_BURST_SIZE", "not-a-number"),
        ]);
        let mut settings = GovernorSettings::default();
        settings.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.services[REAL_DEBRID].max_concurrent, 2);
        assert_eq!(settings.services[TORBOX].jitter_range, 0.05);
        assert_eq!(settings.services[ALL_DEBRID], ServiceConfig::all_debrid());
    }

    #[test]
    fn test_settings_from_json() {
        let raw = r#"{
            "log_level": "warn",
            "services": {
                "realdebrid": { "max_concurrent": 1 },
                "premiumize": {
                    "max_requests_per_minute": 60,
                    "max_concurrent": 2,
                    "retry_attempts": 3,
                    "backoff_multiplier": 2.0,
                    "jitter_range": 0.1,
                    "burst_size": 5
                }
            }
        }"#;
        let settings = GovernorSettings::from_json(raw).unwrap();

        assert_eq!(settings.log_level, "warn");
        assert_eq!(settings.services.len(), 4);
        assert_eq!(settings.services[REAL_DEBRID].max_concurrent, 1);
        assert_eq!(settings.services[REAL_DEBRID].max_requests_per_minute, 250);
        assert_eq!(settings.services["premiumize"].burst_size, 5);
    }

    #[test]
    fn test_settings_json_incomplete_new_service() {
        let raw = r#"{ "services": { "premiumize": { "max_concurrent": 2 } } }"#;
        assert!(matches!(
            GovernorSettings::from_json(raw),
            Err(GovernorError::InvalidConfig { .. })
        ));
    }
}
