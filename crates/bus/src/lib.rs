//! Room-keyed publish/subscribe per §4.5. Generalizes `live.rs`'s
//! single global `broadcast::Sender<String>` into one channel per room,
//! and borrows `notify/dispatcher.rs`'s per-channel independent-failure
//! discipline: a lagging subscriber on one room never affects another.

use std::time::Duration;

use dashmap::DashMap;
use seg_core::events::{Envelope, Room};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const ROOM_CHANNEL_CAPACITY: usize = 256;
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(50);

/// A session's receive half for one room subscription.
pub type RoomReceiver = broadcast::Receiver<Envelope>;

/// Fire-and-forget event bus. Never persists events; never blocks a
/// worker on emission (§9 "EventBus abstraction").
pub struct EventBus {
    rooms: DashMap<Room, broadcast::Sender<Envelope>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { rooms: DashMap::new() }
    }

    fn sender_for(&self, room: &Room) -> broadcast::Sender<Envelope> {
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Joins `room`, returning a receiver. Membership is implicit: a room
    /// exists for as long as at least one producer or subscriber has
    /// touched it; an empty room is cheap to keep around (one sender, no
    /// receivers) and is never explicitly torn down.
    pub fn join(&self, room: Room) -> RoomReceiver {
        self.sender_for(&room).subscribe()
    }

    /// Publishes to a room. Non-blocking: `broadcast::Sender::send` never
    /// awaits, so the bounded-send-timeout requirement is satisfied
    /// trivially for local delivery; the timeout budget below exists for
    /// forward compatibility with a remote transport.
    pub async fn publish(&self, room: Room, envelope: Envelope) {
        let sender = self.sender_for(&room);
        if sender.receiver_count() == 0 {
            debug!(%room, event = envelope.event, "publish to empty room, dropped");
            return;
        }
        let send = async { sender.send(envelope.clone()) };
        match tokio::time::timeout(PUBLISH_TIMEOUT, send).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => debug!(%room, "no active receivers at publish time"),
            Err(_) => warn!(%room, event = envelope.event, "publish exceeded bounded send timeout, dropped"),
        }
    }

    pub async fn publish_to(&self, rooms: impl IntoIterator<Item = Room>, envelope: Envelope) {
        for room in rooms {
            self.publish(room, envelope.clone()).await;
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seg_core::events::event_names;
    use seg_core::ProjectId;

    #[tokio::test]
    async fn publish_is_received_by_joined_subscriber() {
        let bus = EventBus::new();
        let project_id = ProjectId::new();
        let room = Room::Project(project_id);
        let mut rx = bus.join(room.clone());

        bus.publish(room, Envelope::new(event_names::QUEUE_STATS, serde_json::json!({}))).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, event_names::QUEUE_STATS);
    }

    #[tokio::test]
    async fn publish_to_room_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Room::Project(ProjectId::new()), Envelope::new(event_names::ERROR, serde_json::json!({})))
            .await;
    }

    #[tokio::test]
    async fn fifo_per_room_ordering_is_preserved() {
        let bus = EventBus::new();
        let room = Room::Batch(uuid::Uuid::new_v4());
        let mut rx = bus.join(room.clone());

        for i in 0..5 {
            bus.publish(room.clone(), Envelope::new(event_names::QUEUE_UPDATE, serde_json::json!({"i": i})))
                .await;
        }

        for i in 0..5 {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.payload["i"], i);
        }
    }

    #[tokio::test]
    async fn independent_rooms_do_not_cross_deliver() {
        let bus = EventBus::new();
        let room_a = Room::Project(ProjectId::new());
        let room_b = Room::Project(ProjectId::new());
        let mut rx_a = bus.join(room_a.clone());
        let rx_b = bus.join(room_b.clone());

        bus.publish(room_a, Envelope::new(event_names::ERROR, serde_json::json!({}))).await;

        assert!(rx_a.try_recv().is_ok());
        drop(rx_b);
    }
}
