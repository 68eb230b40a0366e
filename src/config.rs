// ⚙️ Configuration - ~/.carbon-ledger/config.toml
//
// Every field is optional. A missing or unreadable file means defaults.

use crate::catalog::{default_offerings, load_offerings_json, Catalog};
use crate::error::LedgerResult;
use serde::Deserialize;
use std::path::PathBuf;

/// Budget offered when the caller does not name one
pub const DEFAULT_BUDGET_USD: f64 = 25.0;

pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Default, Clone, Deserialize)]
pub struct LedgerConfig {
    pub database_path: Option<PathBuf>,
    /// JSON pricing-feed export; built-in offerings when absent
    pub catalog_path: Option<PathBuf>,
    pub catalog_max_age_secs: Option<i64>,
    pub default_budget_usd: Option<f64>,
    pub server_addr: Option<String>,
}

impl LedgerConfig {
    /// Load from the default location, falling back to defaults
    pub fn load() -> Self {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Self::default();
            }
        };

        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Self::default()
            }
        }
    }

    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .or_else(|| data_dir().map(|dir| dir.join("ledger.db")))
            .unwrap_or_else(|| PathBuf::from("ledger.db"))
    }

    pub fn default_budget_usd(&self) -> f64 {
        self.default_budget_usd
            .filter(|b| b.is_finite() && *b > 0.0)
            .unwrap_or(DEFAULT_BUDGET_USD)
    }

    pub fn server_addr(&self) -> String {
        self.server_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string())
    }

    /// Build the catalog this configuration describes
    pub fn catalog(&self) -> LedgerResult<Catalog> {
        let mut catalog = Catalog::new();
        if let Some(secs) = self.catalog_max_age_secs.filter(|s| *s > 0) {
            catalog = catalog.with_max_age(chrono::Duration::seconds(secs));
        }

        let offerings = match &self.catalog_path {
            Some(path) => load_offerings_json(path)?,
            None => default_offerings(),
        };
        catalog.replace(offerings)?;

        Ok(catalog)
    }
}

fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".carbon-ledger"))
}

fn config_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("config.toml"))
}
