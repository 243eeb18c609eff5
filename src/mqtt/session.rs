use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use tokio::sync::{mpsc::UnboundedSender, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::victron::BrokerAddress;
use super::transport::MqttTransport;
use super::{ConnectError, ConnectionState, Credentials, InboundMessage, PublishError, SessionEvent, TransportError};

/* Requests queued towards the event loop before try_* calls start failing */
const REQUEST_CAPACITY: usize = 100;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub client_id: String,
    /// Bound for the first CONNACK
    pub connect_timeout: Duration,
    /// Flat wait between reconnect attempts after an unexpected disconnect
    pub reconnect_interval: Duration,
    /// MQTT protocol level keep alive (PINGREQ)
    pub keep_alive: Duration,
}

/// Owns exactly one MQTT connection.
///
/// The rumqttc event loop is polled on its own tokio task. That task never
/// calls consumer code, it only pushes `SessionEvent`s into the channel given
/// at connect time.
pub struct TlsSession {
    label: String,
    settings: SessionSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    client: RwLock<Option<AsyncClient>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /* serializes connect and disconnect */
    lifecycle: tokio::sync::Mutex<()>,
}

impl TlsSession {
    pub fn new(label: String, settings: SessionSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        return TlsSession {
            label,
            settings,
            state: Arc::new(state),
            client: RwLock::new(None),
            worker: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        };
    }

    pub fn state(&self) -> ConnectionState {
        return *self.state.borrow();
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        return self.state.subscribe();
    }

    pub fn settings(&self) -> &SessionSettings {
        return &self.settings;
    }

    /// Connect to the broker on the secure port, authenticating with the
    /// credentials and trusting only the given CA bundle.
    pub async fn connect(&self,
                         address: &BrokerAddress,
                         credentials: &Credentials,
                         ca_bundle: &[u8],
                         events: UnboundedSender<SessionEvent>) -> Result<(), ConnectError> {
        let mut options = MqttOptions::new(self.settings.client_id.clone(), address.host.clone(), address.port);
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
        /* rustls only speaks TLS 1.2 and 1.3 */
        options.set_transport(Transport::tls(ca_bundle.to_vec(), None, None));

        info!("{} Connecting to {address}", self.label);
        return self.open(options, events).await;
    }

    pub(crate) async fn open(&self, mut options: MqttOptions, events: UnboundedSender<SessionEvent>) -> Result<(), ConnectError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() != ConnectionState::Disconnected {
            debug!("{} Session already running", self.label);
            return Ok(());
        }

        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);

        self.state.send_replace(ConnectionState::Connecting);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client);

        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = Worker {
            label: self.label.clone(),
            state: self.state.clone(),
            events,
            reconnect_interval: self.settings.reconnect_interval,
            connect_timeout: self.settings.connect_timeout,
        };
        let handle = tokio::spawn(worker.run(eventloop, ready_tx));

        let outcome = match timeout(self.settings.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectError::Network("event loop stopped before the broker answered".to_string())),
            Err(_) => Err(ConnectError::Timeout(self.settings.connect_timeout)),
        };

        match outcome {
            Ok(_) => {
                *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                return Ok(());
            },
            Err(e) => {
                error!("{} Connection failed: {e}", self.label);
                self.state.send_replace(ConnectionState::Disconnected);
                handle.abort();
                let _ = handle.await;
                *self.client.write().unwrap_or_else(|e| e.into_inner()) = None;
                return Err(e);
            }
        }
    }

    /// Graceful shutdown. Calling it on a disconnected session does nothing.
    /// Once it returns the worker is gone and no further event is emitted.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = self.state.send_replace(ConnectionState::Disconnected);
        let client = self.client.write().unwrap_or_else(|e| e.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();

        if previous == ConnectionState::Disconnected && worker.is_none() {
            debug!("{} Already disconnected", self.label);
            return;
        }

        if let Some(client) = client {
            /* Best effort, the broker drops us on socket close anyway */
            if let Err(e) = client.try_disconnect() {
                debug!("{} Could not queue DISCONNECT: {e}", self.label);
            }
        }

        if let Some(mut worker) = worker {
            if timeout(DISCONNECT_GRACE, &mut worker).await.is_err() {
                worker.abort();
                let _ = worker.await;
            }
        }

        info!("{} Disconnected", self.label);
    }

    fn connected_client(&self) -> Option<AsyncClient> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        return self.client.read().unwrap_or_else(|e| e.into_inner()).clone();
    }
}

impl MqttTransport for TlsSession {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.connected_client().ok_or(TransportError::NotConnected)?;
        debug!("{} Subscribing {topic}", self.label);
        return client.try_subscribe(topic, QoS::AtLeastOnce)
                     .map_err(|e| TransportError::Rejected(e.to_string()));
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.connected_client().ok_or(TransportError::NotConnected)?;
        debug!("{} Unsubscribing {topic}", self.label);
        return client.try_unsubscribe(topic)
                     .map_err(|e| TransportError::Rejected(e.to_string()));
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<(), PublishError> {
        let client = self.connected_client().ok_or(PublishError::NotConnected)?;
        return client.try_publish(topic, qos, retain, payload)
                     .map_err(|e| PublishError::Rejected(e.to_string()));
    }
}

struct Worker {
    label: String,
    state: Arc<watch::Sender<ConnectionState>>,
    events: UnboundedSender<SessionEvent>,
    reconnect_interval: Duration,
    connect_timeout: Duration,
}

impl Worker {
    /// Move to `next` unless an explicit disconnect already put the session
    /// into Disconnected. Returns the previous state on success.
    fn transition(&self, next: ConnectionState) -> Option<ConnectionState> {
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Disconnected {
                return false;
            }
            previous = Some(std::mem::replace(current, next));
            return true;
        });
        return previous;
    }

    async fn run(self, mut eventloop: EventLoop, ready: oneshot::Sender<Result<(), ConnectError>>) {
        let mut ready = Some(ready);
        let mut last_error = String::new();

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if self.transition(ConnectionState::Connected).is_none() {
                        break;
                    }
                    info!("{} Connected", self.label);
                    last_error.clear();
                    let _ = self.events.send(SessionEvent::Connected);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                },
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    debug!("{} Received {} ({} bytes)", self.label, p.topic, p.payload.len());
                    let _ = self.events.send(SessionEvent::Message(InboundMessage::new(&p.topic, p.payload.to_vec())));
                },
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("{} A subscription ack was received", self.label);
                },
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("{} DISCONNECT sent, stopping event loop", self.label);
                    break;
                },
                Ok(_) => {},
                Err(e) => {
                    /* The first failure belongs to the caller of connect() */
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(classify(&e, self.connect_timeout)));
                        break;
                    }

                    let Some(previous) = self.transition(ConnectionState::Reconnecting) else {
                        break;
                    };

                    if previous == ConnectionState::Connected {
                        warn!("{} Connection lost: {e}", self.label);
                        let _ = self.events.send(SessionEvent::Disconnected { reason: e.to_string() });
                    }

                    /* Rate limit identical errors while the broker stays away */
                    if e.to_string() != last_error {
                        error!("{} Error in MQTT {:?}, retrying in {:?}", self.label, e, self.reconnect_interval);
                        last_error = e.to_string();
                    } else {
                        debug!("{} Still failing: {e}", self.label);
                    }

                    sleep(self.reconnect_interval).await;

                    if self.transition(ConnectionState::Connecting).is_none() {
                        break;
                    }
                }
            }
        }
    }
}

fn classify(e: &ConnectionError, connect_timeout: Duration) -> ConnectError {
    match e {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                ConnectError::Auth(format!("{code:?}"))
            },
            other => ConnectError::Network(format!("broker refused connection: {other:?}")),
        },
        ConnectionError::NetworkTimeout => ConnectError::Timeout(connect_timeout),
        other => ConnectError::Network(other.to_string()),
    }
}
