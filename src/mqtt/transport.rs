use rumqttc::QoS;

use super::{PublishError, TransportError};

/// Outbound side of an MQTT connection.
///
/// All calls only enqueue a request and return immediately, they never wait
/// for the broker.
pub trait MqttTransport: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<(), PublishError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use rumqttc::QoS;

    use super::MqttTransport;
    use crate::mqtt::{PublishError, TransportError};

    #[derive(Clone, Debug, PartialEq)]
    pub enum Call {
        Subscribe(String),
        Unsubscribe(String),
        Publish(String, Vec<u8>),
    }

    /// Records every request instead of sending it
    #[derive(Default)]
    pub struct RecordingTransport {
        pub calls: Mutex<Vec<Call>>,
        pub fail_publish: Mutex<bool>,
        /* Free slots for (un)subscribe requests, None is unbounded */
        queue_slots: Mutex<Option<usize>>,
    }

    impl RecordingTransport {
        /// Accept `n` more (un)subscribe requests, reject everything after
        pub fn reject_after(&self, n: usize) {
            *self.queue_slots.lock().unwrap() = Some(n);
        }

        /// The event loop caught up, the queue takes requests again
        pub fn drain(&self) {
            *self.queue_slots.lock().unwrap() = None;
        }

        fn take_slot(&self) -> Result<(), TransportError> {
            let mut slots = self.queue_slots.lock().unwrap();
            match *slots {
                Some(0) => Err(TransportError::Rejected("request queue full".to_string())),
                Some(n) => {
                    *slots = Some(n - 1);
                    Ok(())
                },
                None => Ok(()),
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            return self.calls.lock().unwrap().clone();
        }

        pub fn count(&self, call: &Call) -> usize {
            return self.calls.lock().unwrap().iter().filter(|c| *c == call).count();
        }

        pub fn publishes(&self) -> usize {
            return self.calls.lock().unwrap().iter().filter(|c| matches!(c, Call::Publish(_, _))).count();
        }

        pub fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    impl MqttTransport for RecordingTransport {
        fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.take_slot()?;
            self.calls.lock().unwrap().push(Call::Subscribe(topic.to_string()));
            Ok(())
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.take_slot()?;
            self.calls.lock().unwrap().push(Call::Unsubscribe(topic.to_string()));
            Ok(())
        }

        fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS, _retain: bool) -> Result<(), PublishError> {
            if *self.fail_publish.lock().unwrap() {
                return Err(PublishError::NotConnected);
            }
            self.calls.lock().unwrap().push(Call::Publish(topic.to_string(), payload));
            Ok(())
        }
    }
}
