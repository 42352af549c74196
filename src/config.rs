use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveTime, Weekday};
use serde::Deserialize;
use thiserror::Error;

use crate::catalog::{Catalog, Professional, Service};
use crate::hours::BusinessHours;
use crate::inference::{KeywordRule, ServiceRules};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed catalog file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("invalid business hours: {0}")]
    InvalidHours(String),
}

/// Process settings read from `SALONBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding the WAL. In-memory store when unset.
    pub data_dir: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub allow_past_bookings: bool,
    pub default_service: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: None,
            catalog_path: None,
            metrics_port: None,
            compact_threshold: 1000,
            allow_past_bookings: false,
            default_service: "corte".into(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            data_dir: non_empty("SALONBOOK_DATA_DIR").map(PathBuf::from),
            catalog_path: non_empty("SALONBOOK_CATALOG").map(PathBuf::from),
            metrics_port: non_empty("SALONBOOK_METRICS_PORT").and_then(|s| s.parse().ok()),
            compact_threshold: non_empty("SALONBOOK_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            allow_past_bookings: non_empty("SALONBOOK_ALLOW_PAST")
                .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.allow_past_bookings),
            default_service: non_empty("SALONBOOK_DEFAULT_SERVICE")
                .unwrap_or(defaults.default_service),
        }
    }

    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("salonbook.wal"))
    }
}

#[derive(Debug, Deserialize)]
struct ProfessionalEntry {
    id: String,
    name: String,
    services: Vec<String>,
    #[serde(default)]
    calendar_id: Option<String>,
}

/// On-disk catalog. Sections left out keep their built-in defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogFile {
    #[serde(default)]
    services: Option<Vec<Service>>,
    #[serde(default)]
    professionals: Option<Vec<ProfessionalEntry>>,
    /// Weekday ("mon", "tuesday", ...) → list of `["HH:MM", "HH:MM"]` windows.
    #[serde(default)]
    hours: Option<BTreeMap<String, Vec<(String, String)>>>,
    #[serde(default)]
    keywords: Option<Vec<KeywordRule>>,
}

/// Everything the engine and the importer need from configuration.
#[derive(Debug, Clone)]
pub struct SalonConfig {
    pub catalog: Catalog,
    pub hours: BusinessHours,
    pub rules: ServiceRules,
}

impl Default for SalonConfig {
    fn default() -> Self {
        Self {
            catalog: Catalog::default(),
            hours: BusinessHours::default(),
            rules: ServiceRules::default(),
        }
    }
}

impl SalonConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_json(&std::fs::read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile = serde_json::from_str(raw)?;
        Self::from_file(file)
    }

    fn from_file(file: CatalogFile) -> Result<Self, ConfigError> {
        let catalog = match (file.services, file.professionals) {
            (None, None) => Catalog::default(),
            (services, professionals) => {
                let services = services.unwrap_or_else(|| Catalog::default().services().to_vec());
                let entries = professionals.unwrap_or_default();
                let mut catalog = Catalog::new(
                    services,
                    entries
                        .iter()
                        .map(|p| Professional {
                            id: p.id.clone(),
                            name: p.name.clone(),
                            services: p.services.iter().cloned().collect(),
                        })
                        .collect(),
                )?;
                for entry in &entries {
                    if let Some(calendar_id) = &entry.calendar_id {
                        catalog = catalog.with_calendar(&entry.id, calendar_id.clone())?;
                    }
                }
                catalog
            }
        };

        let hours = match file.hours {
            None => BusinessHours::default(),
            Some(days) => {
                let mut hours = BusinessHours::closed();
                for (day, windows) in days {
                    let weekday: Weekday = day
                        .parse()
                        .map_err(|_| ConfigError::InvalidHours(format!("unknown weekday {day:?}")))?;
                    let windows = windows
                        .iter()
                        .map(|(open, close)| Ok((parse_time(open)?, parse_time(close)?)))
                        .collect::<Result<Vec<_>, ConfigError>>()?;
                    hours = hours.with_day(weekday, &windows)?;
                }
                hours
            }
        };

        let rules = match file.keywords {
            None => ServiceRules::default(),
            Some(rules) => {
                if let Some(rule) = rules.iter().find(|r| catalog.service(&r.service_id).is_none()) {
                    return Err(ConfigError::InvalidCatalog(format!(
                        "keyword {:?} maps to unknown service {}",
                        rule.keyword, rule.service_id
                    )));
                }
                ServiceRules::new(rules.into_iter().map(|r| (r.keyword, r.service_id)))
            }
        };

        Ok(Self {
            catalog,
            hours,
            rules,
        })
    }
}

fn parse_time(raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| ConfigError::InvalidHours(format!("bad time {raw:?}, expected HH:MM")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn settings_defaults_when_env_empty() {
        let settings = Settings::from_lookup(|_| None);
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.wal_path(), None);
    }

    #[test]
    fn settings_read_every_variable() {
        let env: HashMap<&str, &str> = [
            ("SALONBOOK_DATA_DIR", "/var/lib/salonbook"),
            ("SALONBOOK_METRICS_PORT", "9100"),
            ("SALONBOOK_COMPACT_THRESHOLD", "50"),
            ("SALONBOOK_ALLOW_PAST", "true"),
            ("SALONBOOK_DEFAULT_SERVICE", "barba"),
        ]
        .into();
        let settings = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(
            settings.wal_path(),
            Some(PathBuf::from("/var/lib/salonbook/salonbook.wal"))
        );
        assert_eq!(settings.metrics_port, Some(9100));
        assert_eq!(settings.compact_threshold, 50);
        assert!(settings.allow_past_bookings);
        assert_eq!(settings.default_service, "barba");
    }

    #[test]
    fn settings_ignore_garbage_numbers() {
        let settings = Settings::from_lookup(|k| {
            (k == "SALONBOOK_COMPACT_THRESHOLD").then(|| "lots".to_string())
        });
        assert_eq!(settings.compact_threshold, 1000);
    }

    #[test]
    fn empty_file_keeps_defaults() {
        let config = SalonConfig::from_json("{}").unwrap();
        assert_eq!(config.catalog.professionals().len(), 3);
        assert_eq!(config.hours, BusinessHours::default());
        assert_eq!(config.rules, ServiceRules::default());
    }

    #[test]
    fn full_file_overrides_everything() {
        let config = SalonConfig::from_json(
            r#"{
                "services": [{"id": "corte", "name": "Corte", "duration_min": 45, "price_cents": 1800}],
                "professionals": [{"id": "eva", "name": "Eva", "services": ["corte"], "calendar_id": "cal-eva"}],
                "hours": {"mon": [["09:00", "13:00"]], "saturday": [["10:00", "12:00"]]},
                "keywords": [{"keyword": "pelo", "service_id": "corte"}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.catalog.service("corte").unwrap().duration_min, 45);
        assert_eq!(config.catalog.calendar_for("eva"), Some("cal-eva"));
        assert_eq!(config.hours.windows(Weekday::Mon).len(), 1);
        assert!(config.hours.windows(Weekday::Tue).is_empty());
        assert_eq!(config.hours.windows(Weekday::Sat).len(), 1);
        assert_eq!(config.rules.infer("Pelo largo"), Some("corte"));
    }

    #[test]
    fn rejects_bad_times_and_weekdays() {
        let bad_time = SalonConfig::from_json(r#"{"hours": {"mon": [["9am", "13:00"]]}}"#);
        assert!(matches!(bad_time, Err(ConfigError::InvalidHours(_))));
        let bad_day = SalonConfig::from_json(r#"{"hours": {"funday": [["09:00", "13:00"]]}}"#);
        assert!(matches!(bad_day, Err(ConfigError::InvalidHours(_))));
    }

    #[test]
    fn rejects_keyword_for_unknown_service() {
        let result =
            SalonConfig::from_json(r#"{"keywords": [{"keyword": "uñas", "service_id": "manicura"}]}"#);
        assert!(matches!(result, Err(ConfigError::InvalidCatalog(_))));
    }
}
