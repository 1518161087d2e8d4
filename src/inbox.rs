use crate::chat::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 100;

/// Event pushed to a user's live inbox subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InboxEvent {
    /// A new message addressed to the subscribed user, together with the
    /// user's total unread count after it landed.
    MessageReceived {
        message: Message,
        unread_count: i64,
    },
}

/// Per-user fan-out registry for live subscribers.
///
/// Each user gets a broadcast channel created on first subscription, so a
/// publish only ever reaches that user's connections. Delivery is
/// best-effort: a user with no live subscriber simply misses the push and
/// catches up through the pull API.
///
/// The registry is process-local; a multi-instance deployment would need a
/// shared pub/sub layer behind the same interface.
pub struct Inbox {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<InboxEvent>>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Open a live subscription for `user_id`. Events published while the
    /// receiver is held arrive in publish order.
    pub fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<InboxEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Push an event to `user_id`'s subscribers. Returns how many received
    /// it; zero means nobody was listening, which is not an error.
    pub fn publish(&self, user_id: Uuid, event: InboxEvent) -> usize {
        let mut channels = self.channels.lock().unwrap();
        let Some(tx) = channels.get(&user_id) else {
            return 0;
        };
        match tx.send(event) {
            Ok(subscribers) => subscribers,
            Err(_) => {
                // The last receiver is gone; drop the channel.
                channels.remove(&user_id);
                0
            }
        }
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(content: &str) -> InboxEvent {
        InboxEvent::MessageReceived {
            message: Message {
                id: Uuid::new_v4(),
                conversation_id: Uuid::new_v4(),
                sender_id: Uuid::new_v4(),
                recipient_id: Uuid::new_v4(),
                content: content.to_string(),
                created_at: Utc::now(),
                read_by_recipient: false,
            },
            unread_count: 1,
        }
    }

    fn content_of(event: &InboxEvent) -> &str {
        let InboxEvent::MessageReceived { message, .. } = event;
        &message.content
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let inbox = Inbox::new();
        assert_eq!(inbox.publish(Uuid::new_v4(), event("hi")), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let inbox = Inbox::new();
        let user = Uuid::new_v4();

        let mut rx = inbox.subscribe(user);
        assert_eq!(inbox.publish(user, event("hi")), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(content_of(&received), "hi");
    }

    #[tokio::test]
    async fn test_events_stay_per_user() {
        let inbox = Inbox::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let mut alice_rx = inbox.subscribe(alice);
        let mut bob_rx = inbox.subscribe(bob);

        inbox.publish(alice, event("for alice"));

        let received = alice_rx.recv().await.unwrap();
        assert_eq!(content_of(&received), "for alice");
        assert!(matches!(
            bob_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let inbox = Inbox::new();
        let user = Uuid::new_v4();

        let mut first = inbox.subscribe(user);
        let mut second = inbox.subscribe(user);

        assert_eq!(inbox.publish(user, event("hi")), 2);
        assert_eq!(content_of(&first.recv().await.unwrap()), "hi");
        assert_eq!(content_of(&second.recv().await.unwrap()), "hi");
    }

    #[tokio::test]
    async fn test_publish_order_preserved() {
        let inbox = Inbox::new();
        let user = Uuid::new_v4();
        let mut rx = inbox.subscribe(user);

        for content in ["one", "two", "three"] {
            inbox.publish(user, event(content));
        }
        for expected in ["one", "two", "three"] {
            assert_eq!(content_of(&rx.recv().await.unwrap()), expected);
        }
    }

    #[tokio::test]
    async fn test_dead_channel_is_pruned() {
        let inbox = Inbox::new();
        let user = Uuid::new_v4();

        drop(inbox.subscribe(user));
        assert_eq!(inbox.publish(user, event("hi")), 0);
        assert!(inbox.channels.lock().unwrap().is_empty());
    }
}
