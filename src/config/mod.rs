use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::mqtt::{Credentials, GatewaySettings};
use crate::victron::SiteIdentifier;

pub const CONFIG_ENV: &str = "CERBO_CONFIG";
const SEARCH_PATHS: [&str; 2] = ["config/cerbo.yaml", "cerbo.yaml"];

/* The device broker cuts off anything faster than that */
const MIN_CONNECT_TIMEOUT: u64 = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no configuration found, tried {0}")]
    NotFound(String),
    #[error("unable to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("unable to parse {path}: {source}")]
    Parse { path: String, source: serde_yml::Error },
    #[error("site {0}: {1}")]
    Invalid(String, String),
}

fn site_enabled_default() -> bool { return true }
fn site_keepalive_default() -> u64 { return 30 }
fn site_reconnect_default() -> u64 { return 180 }
fn site_connect_timeout_default() -> u64 { return 5 }
fn site_relays_default() -> Vec<u8> { return vec![0, 1] }
fn site_client_name_default() -> String { return "cerbo-gx".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SiteConfig {
    pub name: String,
    pub site_id: String,
    pub username: String,
    pub password: String,
    /// PEM bundle used to verify the broker
    pub ca_file: String,
    pub area: Option<String>,
    #[serde(default="site_enabled_default")]
    pub enabled: bool,
    #[serde(default="site_keepalive_default")]
    pub keepalive_interval: u64,  // Seconds between R/{site}/keepalive
    #[serde(default="site_reconnect_default")]
    pub reconnect_interval: u64,  // Seconds between reconnect attempts
    #[serde(default="site_connect_timeout_default")]
    pub connect_timeout: u64,     // Seconds to wait for the CONNACK
    #[serde(default="site_relays_default")]
    pub relays: Vec<u8>,
    #[serde(default="site_client_name_default")]
    pub client_name: String,
}

impl SiteConfig {
    pub fn identifier(&self) -> SiteIdentifier {
        return SiteIdentifier::new(&self.site_id);
    }

    pub fn credentials(&self) -> Credentials {
        return Credentials { username: self.username.clone(), password: self.password.clone() };
    }

    /// Every start gets a fresh client id, the broker drops duplicates
    pub fn gateway_settings(&self) -> GatewaySettings {
        return GatewaySettings {
            client_id: format!("{}-{}", self.client_name, Uuid::new_v4()),
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            reconnect_interval: Duration::from_secs(self.reconnect_interval),
            connect_timeout: Duration::from_secs(self.connect_timeout.max(MIN_CONNECT_TIMEOUT)),
        };
    }

    pub fn read_ca_bundle(&self) -> Result<Vec<u8>, ConfigError> {
        return fs::read(&self.ca_file).map_err(|e| ConfigError::Io { path: self.ca_file.clone(), source: e });
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.identifier().as_str().is_empty() {
            return Err(ConfigError::Invalid(self.name.clone(), "site_id is empty".to_string()));
        }
        if self.keepalive_interval == 0 {
            return Err(ConfigError::Invalid(self.name.clone(), "keepalive_interval must be positive".to_string()));
        }
        if self.reconnect_interval == 0 {
            return Err(ConfigError::Invalid(self.name.clone(), "reconnect_interval must be positive".to_string()));
        }
        return Ok(());
    }
}

fn sites_default() -> Vec<SiteConfig> { return Vec::new(); }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default="sites_default")]
    pub sites: Vec<SiteConfig>,
}

impl Config {
    pub fn parse(contents: &str, path: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)
                            .map_err(|e| ConfigError::Parse { path: path.to_string(), source: e })?;

        let mut seen: Vec<String> = Vec::new();
        for site in c.sites.iter() {
            site.validate()?;
            let id = site.identifier().normalized();
            if seen.contains(&id) {
                return Err(ConfigError::Invalid(site.name.clone(), format!("site_id {id} configured twice")));
            }
            seen.push(id);
        }
        return Ok(c);
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let p = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io { path: p.clone(), source: e })?;
        let c = Config::parse(&contents, &p)?;
        info!("Loaded {} site(s) from {p}", c.sites.len());
        return Ok(c);
    }

    /// `$CERBO_CONFIG` first, then `config/cerbo.yaml` and `cerbo.yaml`
    pub fn load() -> Result<Self, ConfigError> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(p));
        }
        for p in SEARCH_PATHS {
            candidates.push(PathBuf::from(p));
        }

        for p in candidates.iter() {
            if p.is_file() {
                return Config::load_from(p);
            }
            debug!("No config at {}", p.display());
        }

        let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        return Err(ConfigError::NotFound(tried.join(", ")));
    }

    pub fn enabled_sites(&self) -> impl Iterator<Item = &SiteConfig> {
        return self.sites.iter().filter(|s| s.enabled);
    }
}
