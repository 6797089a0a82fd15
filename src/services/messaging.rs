use serde_json::Value;
use tokio::sync::broadcast;

/// A message on its way to connected clients.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Login of the addressed participant; `None` for topic-wide broadcasts.
    pub recipient: Option<String>,
    /// Destination topic.
    pub topic: String,
    /// JSON payload.
    pub payload: Value,
}

/// Outbound notification collaborator.
///
/// Delivery is fire-and-forget and at-least-once; the transport behind it
/// (websockets, message broker) is not this crate's concern.
pub trait ClientGateway: Send + Sync {
    /// Deliver a payload to a single participant on a topic.
    fn deliver_to_participant(&self, login: &str, topic: &str, payload: Value);
    /// Deliver a payload to every subscriber of a topic.
    fn broadcast(&self, topic: &str, payload: Value);
}

/// [`ClientGateway`] backed by a tokio broadcast channel.
///
/// The transport layer subscribes and forwards messages to its connections;
/// send errors mean nobody is listening and are deliberately ignored.
pub struct BroadcastGateway {
    sender: broadcast::Sender<OutboundMessage>,
}

impl BroadcastGateway {
    /// Construct a gateway buffering up to `capacity` undelivered messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent messages.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.sender.subscribe()
    }
}

impl ClientGateway for BroadcastGateway {
    fn deliver_to_participant(&self, login: &str, topic: &str, payload: Value) {
        let _ = self.sender.send(OutboundMessage {
            recipient: Some(login.to_string()),
            topic: topic.to_string(),
            payload,
        });
    }

    fn broadcast(&self, topic: &str, payload: Value) {
        let _ = self.sender.send(OutboundMessage {
            recipient: None,
            topic: topic.to_string(),
            payload,
        });
    }
}
