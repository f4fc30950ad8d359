// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! In-process broker with the same observable semantics as the NATS backend:
//! fan-out copies, queue-group one-of delivery with round-robin balancing,
//! request/reply through a synthesized inbox, and `NoResponders` when a
//! request subject has no subscribers.
//!
//! Delivery is synchronous in the caller, so per-publisher FIFO within a
//! subject holds trivially and tests observe effects as soon as a publish
//! returns. Handlers must not hold locks across bus calls (they must not
//! anyway, see the concurrency contract).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::{BusError, Handler, MessageBus};

struct BrokerSubscription {
    client_id: u64,
    queued: bool,
    handler: Handler,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: HashMap<String, Vec<BrokerSubscription>>,
    /// Round-robin cursor per queue group; group name == subject.
    cursors: HashMap<String, usize>,
    next_client_id: u64,
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
        })
    }

    /// A fresh logical client with its own subscription namespace.
    pub fn client(self: &Arc<Self>) -> Arc<InMemoryBus> {
        let client_id = {
            let mut state = self.state.lock().unwrap();
            state.next_client_id += 1;
            state.next_client_id
        };
        Arc::new(InMemoryBus {
            broker: self.clone(),
            client_id,
            subjects: Mutex::new(Vec::new()),
        })
    }

    /// Number of live subscriptions on `subject`, all clients included.
    pub fn subscription_count(&self, subject: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.subscriptions.get(subject).map_or(0, Vec::len)
    }

    fn add(&self, client_id: u64, subject: &str, handler: Handler, queued: bool) {
        let mut state = self.state.lock().unwrap();
        state
            .subscriptions
            .entry(subject.to_string())
            .or_default()
            .push(BrokerSubscription {
                client_id,
                queued,
                handler,
            });
    }

    fn remove(&self, client_id: u64, subject: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(subscriptions) = state.subscriptions.get_mut(subject) {
            subscriptions.retain(|s| s.client_id != client_id);
            if subscriptions.is_empty() {
                state.subscriptions.remove(subject);
                state.cursors.remove(subject);
            }
        }
    }

    /// Snapshot the handlers a message on `subject` reaches: every fan-out
    /// subscriber plus one member of the queue group, advancing the
    /// round-robin cursor. The lock is released before any handler runs.
    fn route(&self, subject: &str) -> Vec<Handler> {
        let mut state = self.state.lock().unwrap();
        let BrokerState {
            subscriptions,
            cursors,
            ..
        } = &mut *state;
        let Some(subscribers) = subscriptions.get(subject) else {
            return Vec::new();
        };

        let mut targets: Vec<Handler> = subscribers
            .iter()
            .filter(|s| !s.queued)
            .map(|s| s.handler.clone())
            .collect();

        let group: Vec<&BrokerSubscription> = subscribers.iter().filter(|s| s.queued).collect();
        if !group.is_empty() {
            let cursor = cursors.entry(subject.to_string()).or_insert(0);
            targets.push(group[*cursor % group.len()].handler.clone());
            *cursor = cursor.wrapping_add(1);
        }
        targets
    }

    async fn deliver(&self, subject: &str, payload: Bytes) -> Option<Bytes> {
        let targets = self.route(subject);
        let mut reply = None;
        for handler in targets {
            let produced = handler(subject.to_string(), payload.clone()).await;
            if reply.is_none() {
                reply = produced;
            }
        }
        reply
    }
}

pub struct InMemoryBus {
    broker: Arc<InMemoryBroker>,
    client_id: u64,
    subjects: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(
        &self,
        subject: &str,
        handler: Handler,
        queued: bool,
    ) -> Result<bool, BusError> {
        {
            let mut subjects = self.subjects.lock().unwrap();
            if subjects.iter().any(|s| s == subject) {
                return Ok(false);
            }
            subjects.push(subject.to_string());
        }
        self.broker.add(self.client_id, subject, handler, queued);
        debug!(subject, queued, "subscribed");
        Ok(true)
    }

    async fn unsubscribe(&self, subject: &str) -> Result<bool, BusError> {
        let removed = {
            let mut subjects = self.subjects.lock().unwrap();
            let before = subjects.len();
            subjects.retain(|s| s != subject);
            subjects.len() != before
        };
        if removed {
            self.broker.remove(self.client_id, subject);
            debug!(subject, "unsubscribed");
        }
        Ok(removed)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.broker.deliver(subject, payload).await;
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        if self.broker.subscription_count(subject) == 0 {
            return Err(BusError::NoResponders(subject.to_string()));
        }
        match tokio::time::timeout(timeout, self.broker.deliver(subject, payload)).await {
            // A subscriber that produces no reply leaves the inbox empty;
            // the requester observes a timeout, as over the real bus.
            Err(_) | Ok(None) => Err(BusError::Timeout(subject.to_string())),
            Ok(Some(reply)) => Ok(reply),
        }
    }

    async fn stop(&self) {
        let subjects: Vec<String> = self.subjects.lock().unwrap().drain(..).collect();
        for subject in subjects {
            self.broker.remove(self.client_id, &subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_subject, _payload| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            })
        })
    }

    fn echo_handler(tag: &'static str) -> Handler {
        Arc::new(move |_subject, _payload| Box::pin(async move { Some(Bytes::from(tag)) }))
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let broker = InMemoryBroker::new();
        let (a, b) = (broker.client(), broker.client());
        let (count_a, count_b) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        a.subscribe("PUB.X", counting_handler(count_a.clone()), false)
            .await
            .unwrap();
        b.subscribe("PUB.X", counting_handler(count_b.clone()), false)
            .await
            .unwrap();

        a.publish("PUB.X", Bytes::new()).await.unwrap();
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_group_delivers_to_exactly_one() {
        let broker = InMemoryBroker::new();
        let (a, b) = (broker.client(), broker.client());
        let (count_a, count_b) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        a.subscribe("REQ.X", counting_handler(count_a.clone()), true)
            .await
            .unwrap();
        b.subscribe("REQ.X", counting_handler(count_b.clone()), true)
            .await
            .unwrap();

        let publisher = broker.client();
        for _ in 0..4 {
            publisher.publish("REQ.X", Bytes::new()).await.unwrap();
        }
        // Round-robin across the group, never a duplicate.
        assert_eq!(count_a.load(Ordering::SeqCst), 2);
        assert_eq!(count_b.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn request_returns_first_reply() {
        let broker = InMemoryBroker::new();
        let responder = broker.client();
        responder
            .subscribe("REQ.ECHO", echo_handler("pong"), true)
            .await
            .unwrap();

        let requester = broker.client();
        let reply = requester
            .request("REQ.ECHO", Bytes::from("ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from("pong"));
    }

    #[tokio::test]
    async fn request_without_subscribers_is_no_responders() {
        let broker = InMemoryBroker::new();
        let requester = broker.client();
        let result = requester
            .request("REQ.NOBODY", Bytes::new(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(BusError::NoResponders(_))));
    }

    #[tokio::test]
    async fn silent_subscriber_surfaces_as_timeout() {
        let broker = InMemoryBroker::new();
        let responder = broker.client();
        responder
            .subscribe(
                "REQ.MUTE",
                Arc::new(|_, _| Box::pin(async { None })),
                true,
            )
            .await
            .unwrap();

        let requester = broker.client();
        let result = requester
            .request("REQ.MUTE", Bytes::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(BusError::Timeout(_))));
    }

    #[tokio::test]
    async fn double_subscribe_is_rejected() {
        let broker = InMemoryBroker::new();
        let client = broker.client();
        assert!(
            client
                .subscribe("PUB.X", echo_handler("one"), false)
                .await
                .unwrap()
        );
        assert!(
            !client
                .subscribe("PUB.X", echo_handler("two"), false)
                .await
                .unwrap()
        );
        // A different client may still bind the same subject.
        assert!(
            broker
                .client()
                .subscribe("PUB.X", echo_handler("three"), false)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_binding() {
        let broker = InMemoryBroker::new();
        let client = broker.client();
        client
            .subscribe("PUB.X", echo_handler("x"), false)
            .await
            .unwrap();
        assert_eq!(broker.subscription_count("PUB.X"), 1);
        assert!(client.unsubscribe("PUB.X").await.unwrap());
        assert!(!client.unsubscribe("PUB.X").await.unwrap());
        assert_eq!(broker.subscription_count("PUB.X"), 0);
    }

    #[tokio::test]
    async fn stop_clears_every_recorded_subscription() {
        let broker = InMemoryBroker::new();
        let client = broker.client();
        let other = broker.client();
        client
            .subscribe("REQ.A", echo_handler("a"), true)
            .await
            .unwrap();
        client
            .subscribe("PUB.B", echo_handler("b"), false)
            .await
            .unwrap();
        other
            .subscribe("PUB.B", echo_handler("b2"), false)
            .await
            .unwrap();

        client.stop().await;
        assert_eq!(broker.subscription_count("REQ.A"), 0);
        // The other client's binding survives.
        assert_eq!(broker.subscription_count("PUB.B"), 1);
    }

    #[tokio::test]
    async fn a_handler_may_publish_from_within() {
        let broker = InMemoryBroker::new();
        let relay = broker.client();
        let relay_bus = relay.clone();
        relay
            .subscribe(
                "PUB.IN",
                Arc::new(move |_, payload| {
                    let relay_bus = relay_bus.clone();
                    Box::pin(async move {
                        let _ = relay_bus.publish("PUB.OUT", payload).await;
                        None
                    })
                }),
                false,
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = broker.client();
        listener
            .subscribe(
                "PUB.OUT",
                Arc::new(move |_, payload| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(payload);
                        None
                    })
                }),
                false,
            )
            .await
            .unwrap();

        broker
            .client()
            .publish("PUB.IN", Bytes::from("hello"))
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from("hello"));
    }
}
