//! In-process local broadcast relay
//!
//! The shared medium co-located providers use to exchange relay messages
//! without touching the network transport — the same role the browser
//! BroadcastChannel plays for multiple tabs of one host. Channels are named
//! per (server url, room) so unrelated rooms never cross.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::protocol::RelayFrame;

pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<RelayFrame>>>,
}

impl LocalBus {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn channel(&self, name: &str) -> broadcast::Sender<RelayFrame> {
        self.channels
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    /// Subscribe to a named channel, creating it if needed.
    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<RelayFrame> {
        self.channel(name).subscribe()
    }

    /// Publish a frame to everyone subscribed to the channel, the sender's
    /// own subscription included (receivers filter by sender tag).
    pub fn publish(&self, name: &str, frame: RelayFrame) {
        let _ = self.channel(name).send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RelayMessage;

    #[tokio::test]
    async fn test_channels_are_isolated_by_name() {
        let bus = LocalBus::new();
        let mut rx_a = bus.subscribe("a");
        let mut rx_b = bus.subscribe("b");

        bus.publish(
            "a",
            RelayFrame {
                sender: 1,
                message: RelayMessage::QueryAwareness,
            },
        );

        assert_eq!(rx_a.recv().await.unwrap().sender, 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publisher_receives_own_frame_for_filtering() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("room");
        bus.publish(
            "room",
            RelayFrame {
                sender: 7,
                message: RelayMessage::QueryAwareness,
            },
        );
        // Delivered with the sender tag; the provider drops its own frames.
        assert_eq!(rx.recv().await.unwrap().sender, 7);
    }
}
