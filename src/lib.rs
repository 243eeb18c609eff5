//! Gateway between Victron Cerbo GX installations and their VRM MQTT broker.
//!
//! One [`mqtt::MqttGateway`] per site holds a single TLS session that every
//! entity of that site shares. Entities subscribe through the gateway and
//! decode their own payloads.

pub mod config;
pub mod entities;
pub mod mqtt;
pub mod sites;
pub mod victron;

// Re-export common types for easier access
pub use config::{Config, ConfigError, SiteConfig};
pub use entities::{DeviceInfo, SiteEntities};
pub use mqtt::{ConnectError, ConnectionState, MqttGateway, PublishError, SubscriptionHandle};
pub use sites::SiteManager;
pub use victron::{resolve, BrokerAddress, SiteIdentifier};
