//! In-process backplane.
//!
//! Several caches in the same process (or in the same test) share one hub by cloning
//! connections from it. Each connection can be switched off to simulate an outage.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use super::{Backplane, BackplaneError, TransportEvent};

struct Subscriber {
    sender: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

/// A connection to an in-process pub/sub hub.
pub struct MemoryBackplane {
    hub: Arc<DashMap<String, Vec<Subscriber>>>,
    connected: Arc<AtomicBool>,
}

impl MemoryBackplane {
    /// Create a new hub and a first connection to it.
    pub fn new() -> Self {
        MemoryBackplane {
            hub: Arc::new(DashMap::new()),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Open another connection to the same hub.
    pub fn connect(&self) -> Self {
        MemoryBackplane {
            hub: Arc::clone(&self.hub),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Simulate losing or regaining the connection.
    ///
    /// While disconnected, publishing fails and nothing is delivered to this
    /// connection's subscribers. Reconnecting notifies them with
    /// [`TransportEvent::Reconnected`].
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if connected && !was {
            for subscribers in self.hub.iter() {
                for sub in subscribers
                    .iter()
                    .filter(|s| Arc::ptr_eq(&s.connected, &self.connected))
                {
                    let _ = sub.sender.try_send(TransportEvent::Reconnected);
                }
            }
        }
    }
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BackplaneError> {
        if !self.is_connected() {
            return Err(BackplaneError::Unavailable("connection is down".to_string()));
        }

        if let Some(mut subscribers) = self.hub.get_mut(channel) {
            subscribers.retain(|sub| !sub.sender.is_closed());
            for sub in subscribers
                .iter()
                .filter(|s| s.connected.load(Ordering::SeqCst))
            {
                if sub
                    .sender
                    .try_send(TransportEvent::Message(payload.clone()))
                    .is_err()
                {
                    tracing::warn!(channel = %channel, "subscriber lagging, message dropped");
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        sender: mpsc::Sender<TransportEvent>,
    ) -> Result<(), BackplaneError> {
        self.hub
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                sender,
                connected: Arc::clone(&self.connected),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_between_connections() {
        let a = MemoryBackplane::new();
        let b = a.connect();

        let (tx, mut rx) = mpsc::channel(8);
        b.subscribe("ch", tx).await.unwrap();

        a.publish("ch", b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::Message(b"hello".to_vec())));

        // Other channels are not delivered.
        a.publish("other", b"nope".to_vec()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_connection_fails_and_reconnects() {
        let a = MemoryBackplane::new();
        let b = a.connect();
        let (tx, mut rx) = mpsc::channel(8);
        b.subscribe("ch", tx).await.unwrap();

        a.set_connected(false);
        assert!(matches!(
            a.publish("ch", b"x".to_vec()).await,
            Err(BackplaneError::Unavailable(_))
        ));

        b.set_connected(false);
        a.set_connected(true);
        a.publish("ch", b"missed".to_vec()).await.unwrap();
        assert!(rx.try_recv().is_err());

        b.set_connected(true);
        assert_eq!(rx.recv().await, Some(TransportEvent::Reconnected));
    }
}
