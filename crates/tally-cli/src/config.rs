//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Weekday;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use tally_core::{Calendar, DEFAULT_CATEGORY, Interval, Zone};
use tally_store::StoreConfig;

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// First day of WEEK buckets.
    pub week_start: Weekday,
    /// Interval of counters created without one, including by imports.
    pub default_interval: Interval,
    /// Category of counters created without one, including by imports.
    pub default_category: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("week_start", &self.week_start)
            .field("default_interval", &self.default_interval)
            .field("default_category", &self.default_category)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("tally.db"),
            week_start: Weekday::Mon,
            default_interval: Interval::default(),
            default_category: DEFAULT_CATEGORY.to_string(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: defaults, `config.toml` in the config directory, the
    /// given file, then `TALLY_*` environment variables.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("TALLY_"));

        figment.extract()
    }

    /// Calendar in the local time zone.
    pub const fn calendar(&self) -> Calendar {
        Calendar::new(Zone::Local, self.week_start)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            calendar: self.calendar(),
            default_interval: self.default_interval,
            default_category: self.default_category.clone(),
        }
    }
}

/// Returns the platform-specific config directory for tally.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tally"))
}

/// Returns the platform-specific data directory for tally.
///
/// On Linux: `~/.local/share/tally`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("tally"))
}
