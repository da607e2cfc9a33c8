use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, warn};

use parley_types::events::{GatewayEvent, Topic};

pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// One published event, serialized once and shared by every receiver.
#[derive(Debug)]
pub struct Dispatch {
    pub topic: Topic,
    pub event: GatewayEvent,
    pub json: Arc<str>,
}

/// Fan-out bus for every broadcast topic.
///
/// Each session holds its own receiver, which buffers up to the channel
/// capacity. Publishing never waits on a receiver: a session that falls
/// behind skips the oldest events and sees `RecvError::Lagged`.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    broadcast_tx: broadcast::Sender<Arc<Dispatch>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(DispatcherInner { broadcast_tx }),
        }
    }

    /// Subscribe to every topic. Sessions filter room topics locally.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Dispatch>> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Publish an event on its topic. Returns how many receivers were
    /// handed the event; zero when nobody is listening.
    pub fn publish(&self, event: GatewayEvent) -> usize {
        let Some(topic) = event.topic() else {
            warn!("Dropping direct-only event on broadcast bus: {:?}", event);
            return 0;
        };

        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {} event: {}", topic, e);
                return 0;
            }
        };

        let dispatch = Arc::new(Dispatch {
            topic,
            event,
            json: json.into(),
        });

        self.inner.broadcast_tx.send(dispatch).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.broadcast_tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_types::models::{Identity, Message};
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();

        let event = GatewayEvent::MessageCreate {
            room_id: "r1".into(),
            message: Message {
                sender: Identity::from("bob"),
                content: "hi".into(),
                timestamp: Utc::now(),
            },
        };
        assert_eq!(dispatcher.publish(event.clone()), 2);

        for rx in [&mut a, &mut b] {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.topic, Topic::Room("r1".into()));
            assert_eq!(got.event, event);
            assert!(got.json.contains("\"MessageCreate\""));
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.publish(GatewayEvent::PresenceUpdate { users: vec![] }), 0);
    }

    #[test]
    fn direct_events_are_not_broadcast() {
        let dispatcher = Dispatcher::new();
        let _rx = dispatcher.subscribe();
        let ready = GatewayEvent::Ready {
            session_id: Uuid::new_v4(),
            identity: Identity::from("alice"),
        };
        assert_eq!(dispatcher.publish(ready), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let dispatcher = Dispatcher::with_capacity(2);
        let mut slow = dispatcher.subscribe();

        for _ in 0..5 {
            dispatcher.publish(GatewayEvent::PresenceUpdate { users: vec![] });
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert!(slow.recv().await.is_ok());
    }
}
