use crate::topics::topic_matches;
use futures::{Stream, StreamExt as _};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self { topic: topic.into(), payload: payload.into() }
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not subscribe to `{1}`")]
    Subscribe(#[source] rumqttc::v5::ClientError, String),
    #[error("could not publish to `{1}`")]
    Publish(#[source] rumqttc::v5::ClientError, String),
    #[error("the connection to the broker is gone")]
    Closed,
}

#[allow(async_fn_in_trait)]
pub trait Bus {
    /// Start receiving messages matching `filter` until the returned guard is dropped.
    async fn subscribe(&self, filter: &str) -> Result<Subscription, Error>;
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), Error>;
}

impl<B: Bus> Bus for &B {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, Error> {
        (**self).subscribe(filter).await
    }
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), Error> {
        (**self).publish(topic, payload).await
    }
}

impl<B: Bus> Bus for Arc<B> {
    async fn subscribe(&self, filter: &str) -> Result<Subscription, Error> {
        (**self).subscribe(filter).await
    }
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), Error> {
        (**self).publish(topic, payload).await
    }
}

struct Route {
    filter: String,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct RouterState {
    next_id: u64,
    routes: BTreeMap<u64, Route>,
}

/// Fans incoming messages out to the subscriptions whose filter matches.
#[derive(Default)]
pub struct Router {
    state: Mutex<RouterState>,
    /// Receives a filter once its last subscription goes away.
    released: Option<mpsc::UnboundedSender<String>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A router that reports filters left without any subscription.
    pub fn with_release_notifications() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { state: Default::default(), released: Some(sender) }), receiver)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn route(self: &Arc<Self>, filter: &str) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.routes.insert(id, Route { filter: filter.to_string(), sender });
        drop(state);
        tracing::debug!(filter, id, "subscription routed");
        Subscription {
            id,
            filter: filter.to_string(),
            router: Arc::clone(self),
            messages: UnboundedReceiverStream::new(receiver),
        }
    }

    /// Deliver `message` to every matching subscription, returning how many received it.
    pub fn dispatch(&self, message: &Message) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for route in state.routes.values() {
            if topic_matches(&route.filter, &message.topic) && route.sender.send(message.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver `message` to a single subscription only.
    pub fn deliver_to(&self, subscription: &Subscription, message: Message) {
        let state = self.lock();
        if let Some(route) = state.routes.get(&subscription.id) {
            let _ = route.sender.send(message);
        }
    }

    pub fn has_filter(&self, filter: &str) -> bool {
        self.lock().routes.values().any(|r| r.filter == filter)
    }

    /// Distinct filters that have at least one subscription.
    pub fn filters(&self) -> Vec<String> {
        let mut filters = self.lock().routes.values().map(|r| r.filter.clone()).collect::<Vec<_>>();
        filters.sort();
        filters.dedup();
        filters
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().routes.len()
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        let Some(route) = state.routes.remove(&id) else {
            return;
        };
        let last = !state.routes.values().any(|r| r.filter == route.filter);
        drop(state);
        tracing::debug!(filter = %route.filter, id, last, "subscription released");
        if let (true, Some(released)) = (last, &self.released) {
            let _ = released.send(route.filter);
        }
    }
}

pub struct Subscription {
    id: u64,
    filter: String,
    router: Arc<Router>,
    messages: UnboundedReceiverStream<Message>,
}

impl Subscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait for the next message. `None` once the bus has gone away.
    pub async fn recv(&mut self) -> Option<Message> {
        self.messages.next().await
    }
}

impl Stream for Subscription {
    type Item = Message;
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        Pin::new(&mut self.messages).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.release(self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).field("filter", &self.filter).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryBus;
    use super::*;

    #[tokio::test]
    async fn routes_by_filter() {
        let router = Router::new();
        let mut all = router.route("tele/+/SENSOR");
        let mut one = router.route("tele/pool/LWT");
        assert_eq!(router.dispatch(&Message::new("tele/pool/SENSOR", "{}")), 1);
        assert_eq!(router.dispatch(&Message::new("tele/pool/LWT", "Online")), 1);
        assert_eq!(all.recv().await.unwrap().topic, "tele/pool/SENSOR");
        assert_eq!(one.recv().await.unwrap().payload, b"Online");
        assert_eq!(router.active_subscriptions(), 2);
        drop(all);
        drop(one);
        assert_eq!(router.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn reports_last_release() {
        let (router, mut released) = Router::with_release_notifications();
        let first = router.route("tele/pool/LWT");
        let second = router.route("tele/pool/LWT");
        drop(first);
        assert!(released.try_recv().is_err());
        assert!(router.has_filter("tele/pool/LWT"));
        drop(second);
        assert_eq!(released.recv().await.as_deref(), Some("tele/pool/LWT"));
        assert!(router.filters().is_empty());
    }

    #[tokio::test]
    async fn memory_bus_retains_and_replies() {
        let bus = MemoryBus::new();
        bus.retain("tele/pool/LWT", "Online");
        bus.reply_with("cmnd/pool/Status", "stat/pool/RESULT", "done");
        let mut lwt = bus.subscribe("tele/pool/LWT").await.unwrap();
        assert_eq!(lwt.recv().await.unwrap().payload_str(), Some("Online"));
        let mut result = bus.subscribe("stat/pool/RESULT").await.unwrap();
        bus.publish("cmnd/pool/Status", "0").await.unwrap();
        assert_eq!(result.recv().await.unwrap().payload_str(), Some("done"));
        assert_eq!(bus.published(), vec![Message::new("cmnd/pool/Status", "0")]);
        drop((lwt, result));
        assert_eq!(bus.active_subscriptions(), 0);
    }
}
