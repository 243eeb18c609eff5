use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use rumqttc::QoS;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::transport::MqttTransport;

/// Publishes an empty message on a fixed topic while the session is connected.
/// The GX device keeps sending N/ updates only as long as it sees these.
pub struct KeepAliveScheduler {
    topic: String,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl KeepAliveScheduler {
    pub fn new(topic: String, interval: Duration) -> Self {
        return KeepAliveScheduler {
            topic,
            interval,
            task: None,
        };
    }

    /// (Re)start the schedule, the first publish happens right away
    pub fn start(&mut self, transport: Arc<dyn MqttTransport>) {
        self.stop();

        let topic = self.topic.clone();
        let interval = self.interval;
        info!("Keep-alive on {topic} every {interval:?}");

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            /* One publish after a stall, not one per missed tick */
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match transport.publish(&topic, Vec::new(), QoS::AtMostOnce, false) {
                    Ok(_) => { debug!("Keep-alive sent to {topic}"); },
                    Err(e) => { warn!("Keep-alive on {topic} failed, trying again next tick: {e}"); }
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Stopping keep-alive on {}", self.topic);
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        return self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false);
    }
}

impl Drop for KeepAliveScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::transport::testing::{Call, RecordingTransport};

    #[tokio::test(start_paused = true)]
    async fn test_publishes_on_interval() {
        let transport = Arc::new(RecordingTransport::default());
        let mut keepalive = KeepAliveScheduler::new("R/abc/keepalive".to_string(), Duration::from_secs(30));

        keepalive.start(transport.clone());
        assert!(keepalive.is_running());

        /* Immediate publish plus one per interval */
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(transport.count(&Call::Publish("R/abc/keepalive".to_string(), Vec::new())), 3);

        keepalive.stop();
        assert!(!keepalive.is_running());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.publishes(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_keeps_schedule() {
        let transport = Arc::new(RecordingTransport::default());
        *transport.fail_publish.lock().unwrap() = true;

        let mut keepalive = KeepAliveScheduler::new("R/abc/keepalive".to_string(), Duration::from_secs(30));
        keepalive.start(transport.clone());

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(transport.publishes(), 0);
        assert!(keepalive.is_running());

        *transport.fail_publish.lock().unwrap() = false;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.publishes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let transport = Arc::new(RecordingTransport::default());
        {
            let mut keepalive = KeepAliveScheduler::new("R/abc/keepalive".to_string(), Duration::from_secs(30));
            keepalive.start(transport.clone());
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.publishes(), 1);
    }
    #[tokio::test(start_paused = true)]
    async fn test_no_burst_after_stall() {
        let transport = Arc::new(RecordingTransport::default());
        let mut keepalive = KeepAliveScheduler::new("R/abc/keepalive".to_string(), Duration::from_secs(30));
        keepalive.start(transport.clone());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.publishes(), 1);

        /* Clock jumps past three deadlines at once */
        tokio::time::advance(Duration::from_secs(100)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.publishes(), 2);

        /* Next one is a full interval after the late tick */
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(transport.publishes(), 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.publishes(), 3);
    }
}
