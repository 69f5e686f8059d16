use tokio::sync::broadcast;
use wifi_capture_schemas::models::SnifferEvent;

/// Fan out sink for state change notifications. The core pushes every
/// transition through here and does not care whether anything is listening, a
/// websocket layer can subscribe for push delivery while a polling client just
/// calls the controller getters instead.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<SnifferEvent>,
}

impl EventPublisher {
    pub fn new() -> Self {
        // lagging subscribers drop old events rather than block the core
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnifferEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers. Zero subscribers is fine.
    pub fn publish(&self, event: SnifferEvent) {
        tracing::trace!("publishing event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wifi_capture_schemas::models::Band;

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_fail() {
        let publisher = EventPublisher::new();
        publisher.publish(SnifferEvent::ConnectionUp);
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let publisher = EventPublisher::new();
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();
        publisher.publish(SnifferEvent::CaptureStarted {
            band: Band::Band5G,
            interface: "ath2".to_string(),
        });
        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                SnifferEvent::CaptureStarted { band, interface } => {
                    assert_eq!(band, Band::Band5G);
                    assert_eq!(interface, "ath2");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
