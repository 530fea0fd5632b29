//! Push notifications by composition.
//!
//! Components that publish lifecycle events hold an [`EventNotifier`] and
//! delegate to it. Subscribers get their own receiver; dropping the
//! receiver unsubscribes.

use tokio::sync::broadcast;

/// Default number of events buffered per subscriber before lagging.
const DEFAULT_CAPACITY: usize = 256;

/// Broadcast notifier for cloneable events.
#[derive(Debug)]
pub struct EventNotifier<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventNotifier<E> {
    /// Create a notifier with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a notifier buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventNotifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let notifier = EventNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.emit(1u32);
        notifier.emit(2u32);

        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let notifier: EventNotifier<&'static str> = EventNotifier::new();
        notifier.emit("nobody listening");
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let notifier: EventNotifier<u8> = EventNotifier::new();
        let rx = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);
        drop(rx);
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
