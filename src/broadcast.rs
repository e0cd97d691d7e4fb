// Cross-context notification plumbing
// Broadcast channel abstraction plus the fan-out shared with the credential store

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Identity of one execution context (one session manager and its store view)
pub type ContextId = Uuid;

/// Buffered notifications per subscriber before it is reported as lagging
const FANOUT_CAPACITY: usize = 64;

/// Kind of session change announced to other contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    Login,
    Logout,
    Refresh,
}

/// Payload posted on the broadcast channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: BroadcastKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
}

impl BroadcastMessage {
    pub fn new(kind: BroadcastKind, subject_id: Option<String>) -> Self {
        Self { kind, subject_id }
    }
}

/// What a subscriber sees on each receive
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    /// A change made by another context
    Event(T),

    /// The subscriber fell behind and this many notifications were dropped
    Missed(u64),
}

#[derive(Debug, Clone)]
struct Envelope<T> {
    origin: ContextId,
    payload: T,
}

/// Fan-out of notifications to every attached context except the sender
#[derive(Debug)]
pub(crate) struct Fanout<T> {
    tx: broadcast::Sender<Envelope<T>>,
}

impl<T: Clone> Fanout<T> {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn publish(&self, origin: ContextId, payload: T) {
        // No receivers is not an error: nobody else is listening yet
        let _ = self.tx.send(Envelope { origin, payload });
    }

    pub(crate) fn subscribe(&self, context: ContextId) -> Subscription<T> {
        Subscription {
            context,
            rx: self.tx.subscribe(),
        }
    }
}

impl<T> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Live subscription; delivery stops on `unsubscribe` or drop
#[derive(Debug)]
pub struct Subscription<T> {
    context: ContextId,
    rx: broadcast::Receiver<Envelope<T>>,
}

impl<T: Clone> Subscription<T> {
    /// Wait for the next notification from another context
    ///
    /// Returns `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Notification<T>> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.origin == self.context => continue,
                Ok(envelope) => return Some(Notification::Event(envelope.payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(Notification::Missed(skipped))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving notifications
    pub fn unsubscribe(self) {}
}

/// Same-origin publish/subscribe used to propagate session changes
pub trait BroadcastChannel: Send + Sync {
    /// Context this endpoint posts as
    fn context_id(&self) -> ContextId;

    /// Announce a change to every other context
    fn post(&self, message: BroadcastMessage);

    /// Receive changes announced by other contexts
    fn subscribe(&self) -> Subscription<BroadcastMessage>;
}

/// In-process broadcast hub; every `channel()` is one context's endpoint
#[derive(Clone)]
pub struct LocalBroadcastHub {
    fanout: Fanout<BroadcastMessage>,
}

impl LocalBroadcastHub {
    pub fn new() -> Self {
        Self {
            fanout: Fanout::new(),
        }
    }

    /// Open an endpoint for a new context
    pub fn channel(&self) -> LocalBroadcastChannel {
        LocalBroadcastChannel {
            context: Uuid::new_v4(),
            fanout: self.fanout.clone(),
        }
    }
}

impl Default for LocalBroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One context's endpoint on a `LocalBroadcastHub`
pub struct LocalBroadcastChannel {
    context: ContextId,
    fanout: Fanout<BroadcastMessage>,
}

impl BroadcastChannel for LocalBroadcastChannel {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn post(&self, message: BroadcastMessage) {
        tracing::debug!(context = %self.context, kind = ?message.kind, "Posting broadcast");
        self.fanout.publish(self.context, message);
    }

    fn subscribe(&self) -> Subscription<BroadcastMessage> {
        self.fanout.subscribe(self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, task};

    #[test]
    fn test_message_wire_format() {
        let msg = BroadcastMessage::new(BroadcastKind::Login, Some("42".to_string()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"type": "login", "subjectId": "42"}));

        let msg = BroadcastMessage::new(BroadcastKind::Logout, None);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"logout"}"#);

        let parsed: BroadcastMessage = serde_json::from_str(r#"{"type":"refresh"}"#).unwrap();
        assert_eq!(parsed.kind, BroadcastKind::Refresh);
        assert_eq!(parsed.subject_id, None);
    }

    #[tokio::test]
    async fn test_delivered_to_other_contexts() {
        let hub = LocalBroadcastHub::new();
        let a = hub.channel();
        let b = hub.channel();
        let mut sub_b = b.subscribe();

        a.post(BroadcastMessage::new(BroadcastKind::Logout, None));

        let received = sub_b.recv().await.unwrap();
        assert_eq!(
            received,
            Notification::Event(BroadcastMessage::new(BroadcastKind::Logout, None))
        );
    }

    #[test]
    fn test_not_echoed_to_sender() {
        let hub = LocalBroadcastHub::new();
        let a = hub.channel();
        let mut sub_a = a.subscribe();

        a.post(BroadcastMessage::new(BroadcastKind::Login, None));

        let mut recv = task::spawn(sub_a.recv());
        assert_pending!(recv.poll());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_reports_missed() {
        let hub = LocalBroadcastHub::new();
        let a = hub.channel();
        let b = hub.channel();
        let mut sub_b = b.subscribe();

        for _ in 0..(FANOUT_CAPACITY + 5) {
            a.post(BroadcastMessage::new(BroadcastKind::Refresh, None));
        }

        assert_eq!(sub_b.recv().await, Some(Notification::Missed(5)));
        assert!(matches!(sub_b.recv().await, Some(Notification::Event(_))));
    }
}
