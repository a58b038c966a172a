use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use uuid::Uuid;

use super::protocol::{ServerEvent, broadcast_event};

const ROOM_CAPACITY: usize = 256;

/// Per-session broadcast channels. A connection subscribed to a room sees
/// every event published for that session.
#[derive(Default)]
pub struct Rooms {
    rooms: Mutex<HashMap<Uuid, broadcast::Sender<String>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, session_id: Uuid) -> broadcast::Sender<String> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<String> {
        self.sender(session_id).subscribe()
    }

    pub fn publish(&self, session_id: Uuid, event: &ServerEvent) {
        broadcast_event(&self.sender(session_id), event);
    }

    /// Drop the room once nobody listens to it any more.
    pub fn close_if_idle(&self, session_id: Uuid) {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if rooms.get(&session_id).is_some_and(|tx| tx.receiver_count() == 0) {
            rooms.remove(&session_id);
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_stay_in_their_room() {
        let rooms = Rooms::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = rooms.subscribe(a);
        let mut rx_b = rooms.subscribe(b);

        rooms.publish(a, &ServerEvent::Info { message: "for a".into() });
        assert!(rx_a.recv().await.unwrap().contains("for a"));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_idle_room_is_closed() {
        let rooms = Rooms::new();
        let id = Uuid::new_v4();
        let rx = rooms.subscribe(id);
        rooms.close_if_idle(id);
        assert_eq!(rooms.len(), 1);
        drop(rx);
        rooms.close_if_idle(id);
        assert!(rooms.is_empty());
    }
}
