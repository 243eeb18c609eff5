/*
    Consumers of the gateway. Every entity decodes its own topic, the gateway
    only hands out raw payloads.
*/

use std::sync::{Arc, Mutex};
use chrono::{DateTime, Utc};
use log::info;

use crate::mqtt::{CommandSink, InboundMessage, MqttGateway, PublishError, SubscriptionHandle};
use crate::victron::SiteIdentifier;

pub mod decode;
pub mod sensor;
pub mod switch;

use decode::DecodeError;
use sensor::{SensorDescription, TelemetrySensor};
use switch::RelaySwitch;

pub const MANUFACTURER: &str = "Victron Energy";
pub const MODEL: &str = "Cerbo GX";

#[derive(Clone, Debug, PartialEq)]
pub enum StateValue {
    Number(f64),
    Switch(bool),
}

#[derive(Clone, Debug)]
pub struct Reading {
    pub value: StateValue,
    pub updated: DateTime<Utc>,
}

impl Reading {
    pub fn now(value: StateValue) -> Self {
        return Reading { value, updated: Utc::now() };
    }
}

/// The installation all entities of a site belong to
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub site: SiteIdentifier,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub area: Option<String>,
}

impl DeviceInfo {
    pub fn new(site: SiteIdentifier, name: &str, area: Option<String>) -> Self {
        return DeviceInfo {
            site,
            name: name.to_string(),
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            area,
        };
    }

    pub fn unique_id(&self, key: &str) -> String {
        return format!("{}_{}", self.site, key);
    }
}

/// A value that follows one telemetry topic
pub trait ObservableValue: Send + Sync {
    fn unique_id(&self) -> String;
    fn name(&self) -> &str;
    fn topic(&self) -> &str;
    fn state(&self) -> Option<Reading>;
    /// Decode a payload and update the state. On error the state is kept.
    fn on_message(&self, payload: &[u8]) -> Result<(), DecodeError>;
}

/// Something that can be switched on the device
pub trait Controllable: Send + Sync {
    fn turn_on(&self) -> Result<(), PublishError>;
    fn turn_off(&self) -> Result<(), PublishError>;
}

pub(crate) fn store(cell: &Mutex<Option<Reading>>, value: StateValue) {
    *cell.lock().unwrap_or_else(|e| e.into_inner()) = Some(Reading::now(value));
}

pub(crate) fn load(cell: &Mutex<Option<Reading>>) -> Option<Reading> {
    return cell.lock().unwrap_or_else(|e| e.into_inner()).clone();
}

/// Wire an entity to the gateway, the handle detaches it again
pub fn attach(entity: Arc<dyn ObservableValue>, gateway: &MqttGateway) -> SubscriptionHandle {
    let topic = entity.topic().to_string();
    return gateway.attach(&topic, move |m: &InboundMessage| entity.on_message(&m.payload));
}

/// The standard entity set of one installation
pub struct SiteEntities {
    pub device: DeviceInfo,
    pub sensors: Vec<Arc<TelemetrySensor>>,
    pub relays: Vec<Arc<RelaySwitch>>,
    handles: Vec<SubscriptionHandle>,
}

impl SiteEntities {
    pub fn new(device: DeviceInfo, sensors: &[SensorDescription], relays: &[u8], sink: Arc<dyn CommandSink>) -> Self {
        let sensors = sensors.iter()
                             .map(|d| Arc::new(TelemetrySensor::new(d.clone(), &device)))
                             .collect();
        let relays = relays.iter()
                           .map(|n| Arc::new(RelaySwitch::new(*n, &device, sink.clone())))
                           .collect();

        return SiteEntities { device, sensors, relays, handles: Vec::new() };
    }

    pub fn observables(&self) -> Vec<Arc<dyn ObservableValue>> {
        let mut list: Vec<Arc<dyn ObservableValue>> = Vec::new();
        for s in self.sensors.iter() {
            list.push(s.clone());
        }
        for r in self.relays.iter() {
            list.push(r.clone());
        }
        return list;
    }

    pub fn attach_all(&mut self, gateway: &MqttGateway) {
        for entity in self.observables() {
            self.handles.push(attach(entity, gateway));
        }
        info!("[{}] {} entities attached", self.device.site, self.handles.len());
    }

    pub fn detach_all(&mut self, gateway: &MqttGateway) {
        for handle in self.handles.drain(..) {
            gateway.detach(&handle);
        }
    }
}
