use std::sync::Mutex;
use log::debug;

use crate::victron::topics;
use super::decode::{decode_number, DecodeError};
use super::{load, store, DeviceInfo, ObservableValue, Reading, StateValue};

/// Everything that tells one numeric sensor apart from another
#[derive(Clone, Debug, PartialEq)]
pub struct SensorDescription {
    pub key: String,
    pub name: String,
    /// Below `N/{site}/system/0/`
    pub path: String,
    /// Field of the first list element, unused for scalar payloads
    pub field: Option<String>,
    pub unit: String,
    pub device_class: String,
    pub precision: u32,
}

impl SensorDescription {
    pub fn new(key: &str, name: &str, path: &str, field: Option<&str>, unit: &str, device_class: &str, precision: u32) -> Self {
        return SensorDescription {
            key: key.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            field: field.map(|f| f.to_string()),
            unit: unit.to_string(),
            device_class: device_class.to_string(),
            precision,
        };
    }
}

pub fn default_sensors() -> Vec<SensorDescription> {
    return vec![
        SensorDescription::new("battery_percent", "Battery Percent", "Batteries", Some("soc"), "%", "battery", 0),
        SensorDescription::new("battery_voltage", "Battery Voltage", "Batteries", Some("voltage"), "V", "voltage", 2),
        SensorDescription::new("battery_temperature", "Battery Temperature", "Batteries", Some("temperature"), "°C", "temperature", 1),
        SensorDescription::new("dc_battery_voltage", "DC Battery Voltage", "Dc/Battery/Voltage", None, "V", "voltage", 2),
        SensorDescription::new("dc_battery_current", "DC Battery Current", "Dc/Battery/Current", None, "A", "current", 2),
        SensorDescription::new("dc_battery_temperature", "DC Battery Temperature", "Dc/Battery/Temperature", None, "°C", "temperature", 1),
        SensorDescription::new("pv_power", "PV Power", "Dc/Pv/Power", None, "W", "power", 0),
    ];
}

pub struct TelemetrySensor {
    description: SensorDescription,
    unique_id: String,
    name: String,
    topic: String,
    state: Mutex<Option<Reading>>,
}

impl TelemetrySensor {
    pub fn new(description: SensorDescription, device: &DeviceInfo) -> Self {
        return TelemetrySensor {
            unique_id: device.unique_id(&description.key),
            name: format!("{} {}", device.name, description.name),
            topic: topics::telemetry(&device.site, &description.path),
            description,
            state: Mutex::new(None),
        };
    }

    pub fn description(&self) -> &SensorDescription {
        return &self.description;
    }

    pub fn value(&self) -> Option<f64> {
        match self.state().map(|r| r.value) {
            Some(StateValue::Number(v)) => Some(v),
            _ => None,
        }
    }
}

fn round(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    return (value * factor).round() / factor;
}

impl ObservableValue for TelemetrySensor {
    fn unique_id(&self) -> String {
        return self.unique_id.clone();
    }

    fn name(&self) -> &str {
        return &self.name;
    }

    fn topic(&self) -> &str {
        return &self.topic;
    }

    fn state(&self) -> Option<Reading> {
        return load(&self.state);
    }

    fn on_message(&self, payload: &[u8]) -> Result<(), DecodeError> {
        match decode_number(payload, self.description.field.as_deref())? {
            Some(v) => {
                let v = round(v, self.description.precision);
                debug!("{} = {v} {}", self.unique_id, self.description.unit);
                store(&self.state, StateValue::Number(v));
            },
            None => {
                debug!("{} No value in payload", self.unique_id);
            }
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::victron::SiteIdentifier;

    fn sensor(key: &str) -> TelemetrySensor {
        let device = DeviceInfo::new(SiteIdentifier::new("abc123"), "Boat", None);
        let description = default_sensors().into_iter().find(|d| d.key == key).unwrap();
        return TelemetrySensor::new(description, &device);
    }

    #[test]
    fn test_sensor_identity() {
        let s = sensor("battery_voltage");
        assert_eq!(s.topic(), "N/abc123/system/0/Batteries");
        assert_eq!(s.unique_id(), "abc123_battery_voltage");
        assert_eq!(s.name(), "Boat Battery Voltage");
        assert!(s.state().is_none());
    }

    #[test]
    fn test_battery_list_payload() {
        let payload = br#"{"value":[{"soc": 87.4, "voltage": 52.1, "temperature": 21.26}]}"#;

        let soc = sensor("battery_percent");
        soc.on_message(payload).unwrap();
        assert_eq!(soc.value(), Some(87.0));

        let voltage = sensor("battery_voltage");
        voltage.on_message(payload).unwrap();
        assert_eq!(voltage.value(), Some(52.1));

        let temperature = sensor("battery_temperature");
        temperature.on_message(payload).unwrap();
        assert_eq!(temperature.value(), Some(21.3));
    }

    #[test]
    fn test_scalar_payload() {
        let current = sensor("dc_battery_current");
        current.on_message(br#"{"value": -3.456}"#).unwrap();
        assert_eq!(current.value(), Some(-3.46));
    }

    #[test]
    fn test_bad_payload_keeps_state() {
        let pv = sensor("pv_power");
        pv.on_message(br#"{"value": 1200}"#).unwrap();

        assert!(pv.on_message(b"").is_err());
        assert!(pv.on_message(b"not json").is_err());
        pv.on_message(br#"{"value": null}"#).unwrap();
        assert_eq!(pv.value(), Some(1200.0));
    }
}
