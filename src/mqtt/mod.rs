pub mod dispatch;
pub mod keepalive;
pub mod registry;
pub mod session;
pub mod transport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rumqttc::QoS;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::entities::decode::DecodeError;
use crate::victron::{self, topics, SiteIdentifier};
use dispatch::Dispatcher;
use keepalive::KeepAliveScheduler;
use registry::{SubscriptionId, SubscriptionRegistry};
use session::{SessionSettings, TlsSession};
use transport::MqttTransport;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error("network error: {0}")]
    Network(String),
    #[error("broker rejected the credentials: {0}")]
    Auth(String),
    #[error("no connection acknowledgment within {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("not connected")]
    NotConnected,
    #[error("payload encoding failed: {0}")]
    Encoding(String),
    #[error("request queue rejected the publish: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("request queue rejected the request: {0}")]
    Rejected(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
         .field("username", &self.username)
         .field("password", &"***")
         .finish()
    }
}

#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: &str, payload: Vec<u8>) -> Self {
        return InboundMessage {
            topic: topic.to_string(),
            payload,
            received: Utc::now(),
        };
    }
}

/// Handoff from the transport worker to the consumer side
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    Message(InboundMessage),
}

pub type Callback = Arc<dyn Fn(&InboundMessage) -> Result<(), DecodeError> + Send + Sync>;

pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&InboundMessage) -> Result<(), DecodeError> + Send + Sync + 'static,
{
    return Arc::new(f);
}

/// Returned by `attach`, the only way to detach again
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: String,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        return &self.topic;
    }
}

/// Anything the controllable entities can send their commands through
pub trait CommandSink: Send + Sync {
    fn send_command(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub client_id: String,
    pub keepalive_interval: Duration,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
}

impl GatewaySettings {
    fn session(&self) -> SessionSettings {
        return SessionSettings {
            client_id: self.client_id.clone(),
            connect_timeout: self.connect_timeout,
            reconnect_interval: self.reconnect_interval,
            keep_alive: Duration::from_secs(60),
        };
    }
}

/// One VRM site: a single session shared by every consumer attached to it.
pub struct MqttGateway {
    label: String,
    site: SiteIdentifier,
    credentials: Credentials,
    ca_bundle: Vec<u8>,
    settings: GatewaySettings,
    session: Arc<TlsSession>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttGateway {
    pub fn new(site: SiteIdentifier, credentials: Credentials, ca_bundle: Vec<u8>, settings: GatewaySettings) -> Self {
        let label = format!("[{site}]");
        let session = Arc::new(TlsSession::new(label.clone(), settings.session()));

        return MqttGateway {
            label,
            site,
            credentials,
            ca_bundle,
            settings,
            session,
            registry: Arc::new(SubscriptionRegistry::new()),
            dispatcher: tokio::sync::Mutex::new(None),
        };
    }

    pub fn site(&self) -> &SiteIdentifier {
        return &self.site;
    }

    pub fn state(&self) -> ConnectionState {
        return self.session.state();
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        return self.session.watch_state();
    }

    /// Connect to the broker derived from the site id and begin delivering
    /// messages. A failure here is the only connection error surfaced to the
    /// caller, later outages are handled by the session itself.
    pub async fn start(&self) -> Result<(), ConnectError> {
        let address = victron::resolve(self.site.as_str());
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            debug!("{} Gateway already started", self.label);
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.session.connect(&address, &self.credentials, &self.ca_bundle, tx).await?;
        *dispatcher = Some(tokio::spawn(self.new_dispatcher().run(rx)));
        return Ok(());
    }

    #[cfg(test)]
    pub(crate) async fn start_with(&self, options: rumqttc::MqttOptions) -> Result<(), ConnectError> {
        let mut dispatcher = self.dispatcher.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        self.session.open(options, tx).await?;
        *dispatcher = Some(tokio::spawn(self.new_dispatcher().run(rx)));
        return Ok(());
    }

    fn new_dispatcher(&self) -> Dispatcher {
        let keepalive = KeepAliveScheduler::new(topics::keepalive(&self.site), self.settings.keepalive_interval);
        return Dispatcher::new(self.label.clone(), self.registry.clone(), self.session.clone(), keepalive);
    }

    /// Disconnect and stop keep-alive. Events already queued are still
    /// delivered, but no callback runs once this returns.
    pub async fn stop(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        self.session.disconnect().await;

        /* The worker took the sending side with it, so the dispatcher drains and ends */
        if let Some(handle) = dispatcher.take() {
            if let Err(e) = handle.await {
                warn!("{} Dispatcher ended abnormally: {e}", self.label);
            }
        }

        self.registry.mark_offline();
        info!("{} Gateway stopped", self.label);
    }

    pub fn attach<F>(&self, topic: &str, f: F) -> SubscriptionHandle
    where
        F: Fn(&InboundMessage) -> Result<(), DecodeError> + Send + Sync + 'static,
    {
        let id = self.registry.add(self.session.as_ref(), topic, Arc::new(f));
        debug!("{} Attached {id} to {topic}", self.label);
        return SubscriptionHandle { topic: topic.to_string(), id };
    }

    /// Attach a bounded queue instead of a callback. Messages are dropped
    /// with a warning while the queue is full.
    pub fn attach_channel(&self, topic: &str, capacity: usize) -> (SubscriptionHandle, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = self.attach(topic, move |message: &InboundMessage| {
            if let Err(e) = tx.try_send(message.clone()) {
                warn!("Dropping message on {}: {e}", message.topic);
            }
            Ok(())
        });
        return (handle, rx);
    }

    pub fn detach(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.registry.remove(self.session.as_ref(), &handle.topic, handle.id);
        if removed {
            debug!("{} Detached {} from {}", self.label, handle.id, handle.topic);
        }
        return removed;
    }

    pub fn topics(&self) -> Vec<String> {
        return self.registry.topics();
    }

    /// Fire and forget at QoS 0
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        return self.session.publish(topic, payload, QoS::AtMostOnce, false);
    }

    /// Send `{"value": value}` to `W/{site}/system/0/{path}`
    pub fn write_value(&self, path: &str, value: Value) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(&json!({ "value": value }))
                        .map_err(|e| PublishError::Encoding(e.to_string()))?;
        return self.publish(&topics::command(&self.site, path), payload);
    }

    /// Ask the GX device to republish the current value of a telemetry topic
    pub fn request_read(&self, topic: &str) -> Result<(), PublishError> {
        return self.publish(&topics::read_request(topic), Vec::new());
    }
}

impl CommandSink for MqttGateway {
    fn send_command(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        return self.publish(topic, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn gateway() -> MqttGateway {
        return MqttGateway::new(SiteIdentifier::new("abc"),
                                Credentials { username: "user".to_string(), password: "secret".to_string() },
                                Vec::new(),
                                GatewaySettings {
                                    client_id: "cerbo-gx-test".to_string(),
                                    keepalive_interval: Duration::from_secs(30),
                                    reconnect_interval: Duration::from_secs(180),
                                    connect_timeout: Duration::from_secs(2),
                                });
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        return haystack.windows(needle.len()).any(|w| w == needle);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let c = Credentials { username: "user".to_string(), password: "secret".to_string() };
        let printed = format!("{c:?}");
        assert!(printed.contains("user"));
        assert!(!printed.contains("secret"));
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let gw = gateway();
        assert_eq!(gw.state(), ConnectionState::Disconnected);
        assert_eq!(gw.publish("W/abc/system/0/Relay/0/State", Vec::new()), Err(PublishError::NotConnected));
        assert_eq!(gw.write_value("Relay/0/State", json!(1)), Err(PublishError::NotConnected));
        assert_eq!(gw.request_read("N/abc/system/0/Serial"), Err(PublishError::NotConnected));
    }

    #[tokio::test]
    async fn test_attach_detach_without_connection() {
        let gw = gateway();
        let first = gw.attach("N/abc/system/0/Batteries", |_m: &InboundMessage| Ok(()));
        let second = gw.attach("N/abc/system/0/Batteries", |_m: &InboundMessage| Ok(()));
        assert_eq!(first.topic(), "N/abc/system/0/Batteries");
        assert_ne!(first, second);
        assert_eq!(gw.topics(), vec!["N/abc/system/0/Batteries".to_string()]);

        assert!(gw.detach(&first));
        assert!(!gw.detach(&first));
        assert!(gw.detach(&second));
        assert!(gw.topics().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let gw = gateway();
        gw.stop().await;
        gw.stop().await;
        assert_eq!(gw.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let topic = "N/abc/system/0/Dc/Pv/Power";

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            /* Wait for the replayed subscription and the first keep-alive */
            let mut received = Vec::new();
            while !(contains(&received, topic.as_bytes()) && contains(&received, b"R/abc/keepalive")) {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&buf[..n]);
            }

            let payload = "{\"value\":512}";
            let mut packet = vec![0x30, (2 + topic.len() + payload.len()) as u8, 0x00, topic.len() as u8];
            packet.extend_from_slice(topic.as_bytes());
            packet.extend_from_slice(payload.as_bytes());
            socket.write_all(&packet).await.unwrap();

            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {},
                }
            }
        });

        let gw = gateway();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        gw.attach(topic, move |m: &InboundMessage| {
            s.lock().unwrap().push(String::from_utf8_lossy(&m.payload).to_string());
            Ok(())
        });
        let (_handle, mut rx) = gw.attach_channel(topic, 4);

        gw.start_with(rumqttc::MqttOptions::new("cerbo-gx-test", "127.0.0.1", port)).await.unwrap();
        assert_eq!(gw.state(), ConnectionState::Connected);

        let message = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(message.payload, b"{\"value\":512}".to_vec());

        gw.stop().await;
        assert_eq!(gw.state(), ConnectionState::Disconnected);
        assert_eq!(*seen.lock().unwrap(), vec!["{\"value\":512}".to_string()]);
        timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    }
    #[tokio::test]
    async fn test_no_callbacks_after_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let topic = "N/abc/system/0/Batteries";

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let mut received = Vec::new();
            while !contains(&received, topic.as_bytes()) {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&buf[..n]);
            }

            /* Publish until the client hangs up */
            let payload = "{\"value\":[{\"soc\":80}]}";
            let mut packet = vec![0x30, (2 + topic.len() + payload.len()) as u8, 0x00, topic.len() as u8];
            packet.extend_from_slice(topic.as_bytes());
            packet.extend_from_slice(payload.as_bytes());
            for _ in 0..5000 {
                if socket.write_all(&packet).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let gw = gateway();
        let count = Arc::new(Mutex::new(0usize));
        let c = count.clone();
        gw.attach(topic, move |_m: &InboundMessage| {
            *c.lock().unwrap() += 1;
            Ok(())
        });

        gw.start_with(rumqttc::MqttOptions::new("cerbo-gx-test", "127.0.0.1", port)).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while *count.lock().unwrap() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();

        gw.stop().await;
        let after_stop = *count.lock().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*count.lock().unwrap(), after_stop);
        assert_eq!(gw.state(), ConnectionState::Disconnected);

        timeout(Duration::from_secs(15), broker).await.unwrap().unwrap();
    }
}
