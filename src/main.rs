use cerbo_gx::{entities::sensor::default_sensors, Config, DeviceInfo, MqttGateway, SiteEntities, SiteManager};
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    let default_filter = std::env::var("CERBO_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let manager = match SiteManager::from_config(&config) {
        Ok(m) => m,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if manager.is_empty() {
        error!("No enabled sites configured");
        return ExitCode::FAILURE;
    }

    let failed = manager.start_all().await;
    if failed.len() == manager.len() {
        error!("None of the configured sites could be reached");
        return ExitCode::FAILURE;
    }

    let mut entities: Vec<(SiteEntities, Arc<MqttGateway>)> = Vec::new();
    for site in manager.sites() {
        if failed.iter().any(|(key, _)| *key == site.gateway.site().normalized()) {
            continue;
        }

        let gateway = site.gateway.clone();
        let device = DeviceInfo::new(gateway.site().clone(), &site.config.name, site.config.area.clone());
        let mut set = SiteEntities::new(device, &default_sensors(), &site.config.relays, gateway.clone());
        set.attach_all(&gateway);

        /* Log every state change of the session */
        let mut state = gateway.watch_state();
        let label = gateway.site().to_string();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                info!("[{label}] Connection {current:?}");
            }
        });

        entities.push((set, gateway));
    }

    info!("All sites started, now waiting for a signal to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to wait for Ctrl-C: {e}");
    }

    info!("Shutting down");
    for (set, gateway) in entities.iter_mut() {
        set.detach_all(gateway);
    }
    manager.stop_all().await;
    return ExitCode::SUCCESS;
}
