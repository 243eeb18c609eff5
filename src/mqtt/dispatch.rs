use std::sync::Arc;
use std::time::Duration;
use log::{debug, info};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

use super::keepalive::KeepAliveScheduler;
use super::registry::SubscriptionRegistry;
use super::transport::MqttTransport;
use super::SessionEvent;

/* How often rejected (un)subscribe requests are sent again */
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Consumer side of the session: every callback runs here, one event after
/// the other, never on the transport worker.
pub struct Dispatcher {
    label: String,
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<dyn MqttTransport>,
    keepalive: KeepAliveScheduler,
}

impl Dispatcher {
    pub fn new(label: String,
               registry: Arc<SubscriptionRegistry>,
               transport: Arc<dyn MqttTransport>,
               keepalive: KeepAliveScheduler) -> Self {
        return Dispatcher { label, registry, transport, keepalive };
    }

    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                let count = self.registry.resubscribe_all(self.transport.as_ref());
                info!("{} Connected, resubscribed {count} topics", self.label);
                self.keepalive.start(self.transport.clone());
            },
            SessionEvent::Disconnected { reason } => {
                info!("{} Connection lost ({reason}), pausing until reconnect", self.label);
                self.registry.mark_offline();
                self.keepalive.stop();
            },
            SessionEvent::Message(message) => {
                let count = self.registry.dispatch(&message);
                debug!("{} {} delivered to {count} callbacks", self.label, message.topic);
            }
        }
    }

    /// Push (un)subscribe requests the transport rejected earlier
    pub fn retry_pending(&self) {
        if self.registry.pending() == 0 {
            return;
        }
        let left = self.registry.retry_pending(self.transport.as_ref());
        if left == 0 {
            info!("{} All pending subscriptions sent", self.label);
        } else {
            debug!("{} {left} subscription requests still pending", self.label);
        }
    }

    /// Runs until the session side of the channel is gone
    pub async fn run(mut self, mut events: UnboundedReceiver<SessionEvent>) {
        let mut retry = tokio::time::interval(RETRY_INTERVAL);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle(event),
                        None => break,
                    }
                },
                _ = retry.tick() => {
                    self.retry_pending();
                }
            }
        }

        debug!("{} Event channel closed", self.label);
        self.registry.mark_offline();
        self.keepalive.stop();
    }
}
