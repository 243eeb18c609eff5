use std::sync::{Arc, Mutex, Weak};
use log::{debug, info, warn};
use serde_json::json;

use crate::mqtt::{CommandSink, PublishError};
use crate::victron::topics;
use super::decode::{decode_switch, DecodeError};
use super::{load, store, Controllable, DeviceInfo, ObservableValue, Reading, StateValue};

/// One of the GX relays, state on the N/ topic, commands on the W/ topic.
///
/// The sink is held weakly since the gateway owns the relay through its
/// registry. Commands fail with `NotConnected` once the gateway is gone.
pub struct RelaySwitch {
    relay: u8,
    unique_id: String,
    name: String,
    state_topic: String,
    command_topic: String,
    sink: Weak<dyn CommandSink>,
    state: Mutex<Option<Reading>>,
}

impl RelaySwitch {
    pub fn new(relay: u8, device: &DeviceInfo, sink: Arc<dyn CommandSink>) -> Self {
        let path = format!("Relay/{relay}/State");
        return RelaySwitch {
            relay,
            unique_id: device.unique_id(&format!("relay_{relay}")),
            name: format!("{} Relay {relay}", device.name),
            state_topic: topics::telemetry(&device.site, &path),
            command_topic: topics::command(&device.site, &path),
            sink: Arc::downgrade(&sink),
            state: Mutex::new(None),
        };
    }

    pub fn relay(&self) -> u8 {
        return self.relay;
    }

    pub fn command_topic(&self) -> &str {
        return &self.command_topic;
    }

    pub fn is_on(&self) -> bool {
        return matches!(self.state().map(|r| r.value), Some(StateValue::Switch(true)));
    }

    fn set(&self, on: bool) -> Result<(), PublishError> {
        info!("{} switching {}", self.unique_id, if on { "on" } else { "off" });
        let payload = serde_json::to_vec(&json!({ "value": if on { 1 } else { 0 } }))
                        .map_err(|e| PublishError::Encoding(e.to_string()))?;
        let Some(sink) = self.sink.upgrade() else {
            warn!("{} Gateway is gone, dropping command", self.unique_id);
            return Err(PublishError::NotConnected);
        };
        sink.send_command(&self.command_topic, payload)?;

        /* The device confirms on the N/ topic, assume it worked meanwhile */
        store(&self.state, StateValue::Switch(on));
        return Ok(());
    }
}

impl ObservableValue for RelaySwitch {
    fn unique_id(&self) -> String {
        return self.unique_id.clone();
    }

    fn name(&self) -> &str {
        return &self.name;
    }

    fn topic(&self) -> &str {
        return &self.state_topic;
    }

    fn state(&self) -> Option<Reading> {
        return load(&self.state);
    }

    fn on_message(&self, payload: &[u8]) -> Result<(), DecodeError> {
        if let Some(on) = decode_switch(payload)? {
            debug!("{} is {}", self.unique_id, if on { "on" } else { "off" });
            store(&self.state, StateValue::Switch(on));
        }
        return Ok(());
    }
}

impl Controllable for RelaySwitch {
    fn turn_on(&self) -> Result<(), PublishError> {
        return self.set(true);
    }

    fn turn_off(&self) -> Result<(), PublishError> {
        return self.set(false);
    }
}
