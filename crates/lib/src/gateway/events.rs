//! Push events: topics, typed payloads, and the listener registry that fans them out.
//!
//! Delivery is in subscription order, synchronous, and without replay. A listener that panics
//! is logged and skipped; the rest still receive the event.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::gateway::process::ExitInfo;
use crate::gateway::protocol::{EventFrame, CONNECT_CHALLENGE_EVENT, SHUTDOWN_EVENT, TICK_EVENT};
use crate::gateway::status::GatewayStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Status,
    Message,
    Notification,
    ChannelStatus,
    ChatMessage,
    Exit,
    Error,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::Status,
        Topic::Message,
        Topic::Notification,
        Topic::ChannelStatus,
        Topic::ChatMessage,
        Topic::Exit,
        Topic::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Status => "status",
            Topic::Message => "message",
            Topic::Notification => "notification",
            Topic::ChannelStatus => "channel-status",
            Topic::ChatMessage => "chat-message",
            Topic::Exit => "exit",
            Topic::Error => "error",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| format!("unknown topic: {}", s))
    }
}

/// A chat turn pushed by the gateway (`chat.message` / `session.message`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub session_id: String,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// One event, keyed by topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
pub enum BridgeEvent {
    Status(GatewayStatus),
    Message(Value),
    Notification(Value),
    ChannelStatus(Value),
    ChatMessage(ChatMessage),
    Exit(ExitInfo),
    Error(String),
}

impl BridgeEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BridgeEvent::Status(_) => Topic::Status,
            BridgeEvent::Message(_) => Topic::Message,
            BridgeEvent::Notification(_) => Topic::Notification,
            BridgeEvent::ChannelStatus(_) => Topic::ChannelStatus,
            BridgeEvent::ChatMessage(_) => Topic::ChatMessage,
            BridgeEvent::Exit(_) => Topic::Exit,
            BridgeEvent::Error(_) => Topic::Error,
        }
    }

    /// Classify a gateway event frame. `None` for protocol events, unknown names and
    /// chat payloads that don't parse.
    pub fn from_gateway(frame: EventFrame) -> Option<BridgeEvent> {
        match frame.event.as_str() {
            "message" => Some(BridgeEvent::Message(frame.payload)),
            "notification" => Some(BridgeEvent::Notification(frame.payload)),
            "channel.status" | "channel-status" => Some(BridgeEvent::ChannelStatus(frame.payload)),
            "chat.message" | "chat-message" | "session.message" => {
                match serde_json::from_value::<ChatMessage>(frame.payload) {
                    Ok(msg) => Some(BridgeEvent::ChatMessage(msg)),
                    Err(e) => {
                        log::warn!("dropping malformed {} event: {}", frame.event, e);
                        None
                    }
                }
            }
            CONNECT_CHALLENGE_EVENT | TICK_EVENT => None,
            SHUTDOWN_EVENT => {
                log::info!("gateway announced shutdown");
                None
            }
            other => {
                log::debug!("dropping gateway event with unknown name {}", other);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&BridgeEvent) + Send + Sync>;

#[derive(Clone)]
enum Delivery {
    Callback(Listener),
    Channel(mpsc::UnboundedSender<BridgeEvent>),
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    delivery: Delivery,
}

/// Listener registry keyed by topic.
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, topic: Topic, delivery: Delivery) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(Subscription {
                id,
                topic,
                delivery,
            });
        }
        id
    }

    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> SubscriptionId
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        self.add(topic, Delivery::Callback(Arc::new(listener)))
    }

    /// Events for `topic` as a stream. Dropping the receiver ends the subscription.
    pub fn subscribe_channel(&self, topic: Topic) -> mpsc::UnboundedReceiver<BridgeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(topic, Delivery::Channel(tx));
        rx
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut subs) = self.subscriptions.lock() else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        self.subscriptions
            .lock()
            .map(|subs| subs.iter().filter(|s| s.topic == topic).count())
            .unwrap_or(0)
    }

    /// Deliver `event` to every listener of its topic.
    pub fn publish(&self, event: BridgeEvent) {
        let topic = event.topic();
        // Snapshot so listeners may subscribe/unsubscribe while being called.
        let targets: Vec<Subscription> = match self.subscriptions.lock() {
            Ok(subs) => subs.iter().filter(|s| s.topic == topic).cloned().collect(),
            Err(_) => return,
        };
        let mut gone = Vec::new();
        for sub in targets {
            match sub.delivery {
                Delivery::Callback(listener) => {
                    if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                        log::error!("{} listener {:?} panicked", topic, sub.id);
                    }
                }
                Delivery::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        gone.push(sub.id);
                    }
                }
            }
        }
        for id in gone {
            self.unsubscribe(id);
        }
    }

    /// Classify a gateway event frame and publish it.
    pub fn dispatch(&self, frame: EventFrame) {
        if let Some(event) = BridgeEvent::from_gateway(frame) {
            self.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(bus: &EventBus, topic: Topic) -> Arc<Mutex<Vec<BridgeEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(topic, move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    #[test]
    fn gateway_names_map_to_topics() {
        let cases = [
            ("message", Some(Topic::Message)),
            ("notification", Some(Topic::Notification)),
            ("channel.status", Some(Topic::ChannelStatus)),
            ("channel-status", Some(Topic::ChannelStatus)),
            ("tick", None),
            ("connect.challenge", None),
            ("shutdown", None),
            ("mystery", None),
        ];
        for (name, topic) in cases {
            let event = BridgeEvent::from_gateway(EventFrame::new(name, json!({"x": 1})));
            assert_eq!(event.map(|e| e.topic()), topic, "{}", name);
        }
    }

    #[test]
    fn chat_payloads_are_typed() {
        let frame = EventFrame::new(
            "session.message",
            json!({"sessionId": "s1", "role": "assistant", "content": "hi", "channelId": null}),
        );
        match BridgeEvent::from_gateway(frame) {
            Some(BridgeEvent::ChatMessage(msg)) => {
                assert_eq!(msg.session_id, "s1");
                assert_eq!(msg.content, "hi");
                assert_eq!(msg.channel_id, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        let bad = EventFrame::new("chat.message", json!({"role": "user"}));
        assert!(BridgeEvent::from_gateway(bad).is_none());
    }

    #[test]
    fn subscribe_before_receives_after_does_not() {
        let bus = EventBus::new();
        let early = recorder(&bus, Topic::Message);
        bus.dispatch(EventFrame::new("message", json!({"n": 1})));
        let late = recorder(&bus, Topic::Message);

        assert_eq!(*early.lock().unwrap(), vec![BridgeEvent::Message(json!({"n": 1}))]);
        assert!(late.lock().unwrap().is_empty());
    }

    #[test]
    fn delivery_in_subscription_order_and_topic_filtered() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            bus.subscribe(Topic::Notification, move |_| order.lock().unwrap().push(n));
        }
        let other = recorder(&bus, Topic::Message);
        bus.publish(BridgeEvent::Notification(json!("ding")));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(other.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let bus = EventBus::new();
        bus.subscribe(Topic::Error, |_| panic!("listener bug"));
        let seen = recorder(&bus, Topic::Error);
        bus.publish(BridgeEvent::Error("boom".into()));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let id = bus.subscribe(Topic::Status, move |_| *counter.lock().unwrap() += 1);
        bus.publish(BridgeEvent::Status(GatewayStatus::starting()));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(BridgeEvent::Status(GatewayStatus::stopped()));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn channel_subscription_and_cleanup() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_channel(Topic::Exit);
        let exit = ExitInfo {
            code: Some(3),
            signal: None,
            forced: false,
        };
        bus.publish(BridgeEvent::Exit(exit));
        assert_eq!(rx.recv().await, Some(BridgeEvent::Exit(exit)));

        drop(rx);
        assert_eq!(bus.listener_count(Topic::Exit), 1);
        bus.publish(BridgeEvent::Exit(exit));
        assert_eq!(bus.listener_count(Topic::Exit), 0);
    }

    #[test]
    fn event_json_shape() {
        let v = serde_json::to_value(BridgeEvent::Status(GatewayStatus::running(15151))).unwrap();
        assert_eq!(
            v,
            json!({"topic": "status", "payload": {"state": "running", "port": 15151}})
        );
        assert_eq!("chat-message".parse::<Topic>(), Ok(Topic::ChatMessage));
        assert!("bogus".parse::<Topic>().is_err());
    }
}
