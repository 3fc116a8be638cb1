//! Best-effort publish/subscribe over named channels.
//!
//! Messages are wrapped in an envelope `{"timestamp": <epoch-ms>, "data": ..}`
//! and pushed to whoever is subscribed at that moment.  Nothing is buffered
//! for absent subscribers and nothing is acknowledged, so consumers treat a
//! message as a hint and re-read the status board for the truth.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::now_ms;
use crate::error::StoreError;
use crate::keyspace::Channel;
use crate::metrics::{ChannelLabels, Metrics};
use crate::store::{Store, SubscriptionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: i64,
    pub data: Value,
}

/// Decode a raw channel message.  Anything that is not a valid envelope is
/// still delivered: the raw text as a JSON string, stamped with `received_at`.
pub fn decode_envelope(raw: &str, received_at: i64) -> (Value, i64) {
    match serde_json::from_str::<Envelope>(raw) {
        Ok(envelope) => (envelope.data, envelope.timestamp),
        Err(e) => {
            warn!(error = %e, "undecodable pub/sub envelope, delivering raw payload");
            (Value::String(raw.to_string()), received_at)
        }
    }
}

/// This instance's hold on a channel: the store subscription and the task
/// draining it.
struct Registration {
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct PubSub {
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
    handlers: Arc<Mutex<HashMap<Channel, Registration>>>,
}

impl PubSub {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            metrics,
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<Channel, Registration>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fire-and-forget publish.  Returns `false` if the message could not be
    /// handed to the store; never raises.
    pub async fn publish<T>(&self, channel: Channel, payload: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(%channel, error = %e, "pub/sub payload failed to serialize");
                return false;
            }
        };
        let envelope = Envelope {
            timestamp: now_ms(),
            data,
        };
        let message = match serde_json::to_string(&envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!(%channel, error = %e, "pub/sub envelope failed to serialize");
                return false;
            }
        };
        match self.store.publish(channel.as_str(), &message).await {
            Ok(receivers) => {
                self.metrics
                    .pubsub_published
                    .get_or_create(&ChannelLabels {
                        channel: channel.as_str(),
                    })
                    .inc();
                trace!(%channel, receivers, "published");
                true
            }
            Err(e) => {
                self.metrics.store_error("publish");
                warn!(%channel, error = %e, "publish failed");
                false
            }
        }
    }

    /// Register `handler` for `channel`, replacing any previous registration.
    /// The handler runs once per received message with `(payload, timestamp)`.
    ///
    /// Only messages published after this returns are delivered.
    pub async fn subscribe<F>(&self, channel: Channel, handler: F) -> Result<(), StoreError>
    where
        F: Fn(Value, i64) + Send + Sync + 'static,
    {
        self.unsubscribe(channel).await;

        let mut subscription = self.store.subscribe(channel.as_str()).await?;
        let id = subscription.id();
        let metrics = Arc::clone(&self.metrics);
        let task = tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                metrics
                    .pubsub_received
                    .get_or_create(&ChannelLabels {
                        channel: channel.as_str(),
                    })
                    .inc();
                let (payload, timestamp) = decode_envelope(&msg.payload, now_ms());
                handler(payload, timestamp);
            }
            trace!(%channel, "subscription stream ended");
        });

        let registration = Registration {
            subscription: id,
            task,
        };
        let previous = self.handlers().insert(channel, registration);
        if let Some(previous) = previous {
            self.release(channel, previous).await;
        }
        debug!(%channel, id, "handler registered");
        Ok(())
    }

    /// Remove this instance's registration for `channel`.  Returns whether one
    /// existed.  Other subscribers to the channel keep receiving.
    pub async fn unsubscribe(&self, channel: Channel) -> bool {
        let removed = self.handlers().remove(&channel);
        let Some(registration) = removed else {
            return false;
        };
        self.release(channel, registration).await;
        debug!(%channel, "handler removed");
        true
    }

    async fn release(&self, channel: Channel, registration: Registration) {
        registration.task.abort();
        if let Err(e) = self
            .store
            .unsubscribe(channel.as_str(), registration.subscription)
            .await
        {
            warn!(%channel, error = %e, "store unsubscribe failed");
        }
    }

    /// Remove every registration (graceful shutdown).
    pub async fn unsubscribe_all(&self) {
        let channels: Vec<Channel> = self.handlers().keys().copied().collect();
        for channel in channels {
            self.unsubscribe(channel).await;
        }
    }

    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.handlers().contains_key(&channel)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::coordination::testing::{failing_store, memory_store, metrics};

    type Received = mpsc::UnboundedReceiver<(Value, i64)>;

    async fn listen(pubsub: &PubSub, channel: Channel) -> Received {
        let (tx, rx) = mpsc::unbounded_channel();
        pubsub
            .subscribe(channel, move |payload, ts| {
                let _ = tx.send((payload, ts));
            })
            .await
            .unwrap();
        rx
    }

    async fn next(rx: &mut Received) -> Option<(Value, i64)> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn envelope_wire_format() {
        let envelope = Envelope {
            timestamp: 1_700_000_000_000,
            data: json!({"lockerId": "5"}),
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"timestamp": 1_700_000_000_000_i64, "data": {"lockerId": "5"}})
        );
    }

    #[test]
    fn undecodable_envelope_is_delivered_raw() {
        let (payload, ts) = decode_envelope("plain text", 42);
        assert_eq!(payload, json!("plain text"));
        assert_eq!(ts, 42);

        let (payload, ts) = decode_envelope(r#"{"timestamp": 7, "data": [1]}"#, 42);
        assert_eq!(payload, json!([1]));
        assert_eq!(ts, 7);
    }

    #[tokio::test]
    async fn subscriber_receives_published_payload() {
        let pubsub = PubSub::new(memory_store(), metrics());
        let mut rx = listen(&pubsub, Channel::SystemEvents).await;

        assert!(pubsub.publish(Channel::SystemEvents, &json!({"event": "deploy"})).await);
        let (payload, ts) = next(&mut rx).await.unwrap();
        assert_eq!(payload, json!({"event": "deploy"}));
        assert!(ts > 0);
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn fan_out_reaches_every_instance() {
        let store = memory_store();
        let a = PubSub::new(Arc::clone(&store), metrics());
        let b = PubSub::new(Arc::clone(&store), metrics());
        let mut rx_a = listen(&a, Channel::MaintenanceAlerts).await;
        let mut rx_b = listen(&b, Channel::MaintenanceAlerts).await;

        a.publish(Channel::MaintenanceAlerts, "door 3 jammed").await;
        assert_eq!(next(&mut rx_a).await.unwrap().0, json!("door 3 jammed"));
        assert_eq!(next(&mut rx_b).await.unwrap().0, json!("door 3 jammed"));
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_messages() {
        let pubsub = PubSub::new(memory_store(), metrics());
        pubsub.publish(Channel::SystemEvents, &json!(1)).await;
        let mut rx = listen(&pubsub, Channel::SystemEvents).await;
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn other_channels_are_not_delivered() {
        let pubsub = PubSub::new(memory_store(), metrics());
        let mut rx = listen(&pubsub, Channel::HardwareAlerts).await;
        pubsub.publish(Channel::LockerStatus, &json!(1)).await;
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let pubsub = PubSub::new(memory_store(), metrics());
        let mut rx = listen(&pubsub, Channel::SystemEvents).await;
        assert!(pubsub.is_subscribed(Channel::SystemEvents));

        assert!(pubsub.unsubscribe(Channel::SystemEvents).await);
        assert!(!pubsub.unsubscribe(Channel::SystemEvents).await);
        pubsub.publish(Channel::SystemEvents, &json!(1)).await;
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_leaves_other_instances_listening() {
        let store = memory_store();
        let a = PubSub::new(Arc::clone(&store), metrics());
        let b = PubSub::new(Arc::clone(&store), metrics());
        let mut rx_a = listen(&a, Channel::LockerStatus).await;
        let mut rx_b = listen(&b, Channel::LockerStatus).await;

        assert!(a.unsubscribe(Channel::LockerStatus).await);
        assert!(b.is_subscribed(Channel::LockerStatus));

        b.publish(Channel::LockerStatus, &json!({"lockerId": "12"}))
            .await;
        assert_eq!(
            next(&mut rx_b).await.unwrap().0,
            json!({"lockerId": "12"})
        );
        assert!(next(&mut rx_a).await.is_none());
    }

    #[tokio::test]
    async fn resubscribe_replaces_handler() {
        let pubsub = PubSub::new(memory_store(), metrics());
        let mut first = listen(&pubsub, Channel::SystemEvents).await;
        let mut second = listen(&pubsub, Channel::SystemEvents).await;

        pubsub.publish(Channel::SystemEvents, &json!("x")).await;
        assert!(next(&mut second).await.is_some());
        assert!(next(&mut first).await.is_none());
    }

    #[tokio::test]
    async fn store_outage_is_reported_not_raised() {
        let pubsub = PubSub::new(failing_store(), metrics());
        assert!(!pubsub.publish(Channel::SystemEvents, &json!(1)).await);
        assert!(pubsub
            .subscribe(Channel::SystemEvents, |_, _| {})
            .await
            .is_err());
        assert!(!pubsub.is_subscribed(Channel::SystemEvents));
    }
}
