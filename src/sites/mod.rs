use std::collections::HashMap;
use std::sync::Arc;
use log::{error, info};

use crate::config::{Config, ConfigError, SiteConfig};
use crate::mqtt::{ConnectError, MqttGateway};

pub struct Site {
    pub config: SiteConfig,
    pub gateway: Arc<MqttGateway>,
}

/// All configured installations, keyed by the normalized site id
pub struct SiteManager {
    sites: HashMap<String, Site>,
}

impl SiteManager {
    pub fn new() -> Self {
        return SiteManager { sites: HashMap::new() };
    }

    /// Build one gateway per enabled site. Nothing connects yet.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut manager = SiteManager::new();
        for site in config.enabled_sites() {
            let ca = site.read_ca_bundle()?;
            let gateway = MqttGateway::new(site.identifier(), site.credentials(), ca, site.gateway_settings());
            manager.insert(site.clone(), Arc::new(gateway));
        }
        return Ok(manager);
    }

    pub fn insert(&mut self, config: SiteConfig, gateway: Arc<MqttGateway>) {
        let key = gateway.site().normalized();
        self.sites.insert(key, Site { config, gateway });
    }

    pub fn get(&self, site_id: &str) -> Option<&Site> {
        return self.sites.get(&site_id.trim().to_lowercase());
    }

    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        return self.sites.values();
    }

    pub fn len(&self) -> usize {
        return self.sites.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.sites.is_empty();
    }

    /// Start every site. A site that cannot connect is reported and skipped,
    /// the others keep running.
    pub async fn start_all(&self) -> Vec<(String, ConnectError)> {
        let mut failed = Vec::new();
        for (key, site) in self.sites.iter() {
            match site.gateway.start().await {
                Ok(_) => {
                    info!("[{}] Site {} started", site.gateway.site(), site.config.name);
                },
                Err(e) => {
                    error!("[{}] Site {} failed to start: {e}", site.gateway.site(), site.config.name);
                    failed.push((key.clone(), e));
                }
            }
        }
        return failed;
    }

    pub async fn stop_all(&self) {
        for site in self.sites.values() {
            site.gateway.stop().await;
        }
    }
}

impl Default for SiteManager {
    fn default() -> Self {
        return SiteManager::new();
    }
}
