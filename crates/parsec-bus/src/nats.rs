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

//! NATS-backed bus client. One `NatsBus` is one logical client with its own
//! subscription registry; many can share a single NATS connection via
//! [`NatsBus::attach`], which is how the gateway gives every client
//! connection its own subscription namespace.
//!
//! Reconnects are handled inside the protocol client: recorded
//! subscriptions are re-issued on the new connection with their queue-group
//! flavour preserved, and services never observe the gap. Publishes while
//! disconnected are dropped by the broker; the presence protocol
//! self-corrects on the next delta.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::RequestErrorKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::{BusError, CORRELATION_HEADER, Handler, MessageBus};

struct SubscriptionEntry {
    queued: bool,
    task: tokio::task::JoinHandle<()>,
}

pub struct NatsBus {
    client: async_nats::Client,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    owns_connection: bool,
}

/// Connect a NATS client with parsec's connection event logging.
async fn connect_client(endpoint: &str) -> Result<async_nats::Client, BusError> {
    async_nats::ConnectOptions::new()
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Connected => info!("bus connected"),
                async_nats::Event::Disconnected => warn!("bus disconnected"),
                other => debug!(event = %other, "bus event"),
            }
        })
        .connect(endpoint)
        .await
        .map_err(|e| BusError::Connection(e.to_string()))
}

impl NatsBus {
    /// Connect to the bus server named by `endpoint`. The returned client
    /// owns the connection and closes it on `stop()`.
    pub async fn connect(endpoint: &str) -> Result<Self, BusError> {
        let client = connect_client(endpoint).await?;
        Ok(Self {
            client,
            subscriptions: Mutex::new(HashMap::new()),
            owns_connection: true,
        })
    }

    /// A fresh logical client over an existing connection. `stop()` tears
    /// down this client's subscriptions but leaves the connection open.
    pub fn attach(client: async_nats::Client) -> Self {
        Self {
            client,
            subscriptions: Mutex::new(HashMap::new()),
            owns_connection: false,
        }
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn subscribe(
        &self,
        subject: &str,
        handler: Handler,
        queued: bool,
    ) -> Result<bool, BusError> {
        {
            let subscriptions = self.subscriptions.lock().unwrap();
            if subscriptions.contains_key(subject) {
                return Ok(false);
            }
        }

        let mut subscriber = if queued {
            // Queue group named identically to the subject.
            self.client
                .queue_subscribe(subject.to_string(), subject.to_string())
                .await
        } else {
            self.client.subscribe(subject.to_string()).await
        }
        .map_err(|e| BusError::Connection(e.to_string()))?;

        let client = self.client.clone();
        let subject_name = subject.to_string();
        let task = tokio::spawn(async move {
            // One message at a time per subject; distinct subjects interleave.
            while let Some(message) = subscriber.next().await {
                let correlation = message
                    .headers
                    .as_ref()
                    .and_then(|headers| headers.get(CORRELATION_HEADER))
                    .map(|value| value.as_str().to_string());
                let span = tracing::debug_span!(
                    "bus_message",
                    subject = %subject_name,
                    correlation = correlation.as_deref().unwrap_or(""),
                );
                let reply = handler(subject_name.clone(), message.payload)
                    .instrument(span)
                    .await;
                match (message.reply, reply) {
                    (Some(inbox), reply) => {
                        let payload = reply.unwrap_or_default();
                        if let Err(e) = client.publish(inbox, payload).await {
                            error!(subject = %subject_name, error = %e, "could not publish reply");
                        }
                    }
                    (None, Some(_)) => {
                        debug!(subject = %subject_name, "reply produced but none requested");
                    }
                    (None, None) => {}
                }
            }
        });

        self.subscriptions
            .lock()
            .unwrap()
            .insert(subject.to_string(), SubscriptionEntry { queued, task });
        debug!(subject, queued, "subscribed");
        Ok(true)
    }

    async fn unsubscribe(&self, subject: &str) -> Result<bool, BusError> {
        let Some(entry) = self.subscriptions.lock().unwrap().remove(subject) else {
            return Ok(false);
        };
        // Aborting the dispatch task drops the subscriber, which removes the
        // subscription from the connection.
        entry.task.abort();
        debug!(subject, queued = entry.queued, "unsubscribed");
        Ok(true)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(CORRELATION_HEADER, Uuid::new_v4().to_string().as_str());
        let request = self
            .client
            .request_with_headers(subject.to_string(), headers, payload);
        match tokio::time::timeout(timeout, request).await {
            Err(_) => Err(BusError::Timeout(subject.to_string())),
            Ok(Err(e)) => match e.kind() {
                RequestErrorKind::NoResponders => Err(BusError::NoResponders(subject.to_string())),
                RequestErrorKind::TimedOut => Err(BusError::Timeout(subject.to_string())),
                RequestErrorKind::Other => Err(BusError::Connection(e.to_string())),
            },
            Ok(Ok(message)) => Ok(message.payload),
        }
    }

    async fn stop(&self) {
        let entries: Vec<(String, SubscriptionEntry)> =
            self.subscriptions.lock().unwrap().drain().collect();
        for (subject, entry) in entries {
            entry.task.abort();
            debug!(subject, queued = entry.queued, "unsubscribed");
        }
        if self.owns_connection {
            if let Err(e) = self.client.drain().await {
                warn!(error = %e, "error draining bus connection");
            }
        }
    }
}

/// Shared NATS connection from which per-client-connection bus handles are
/// minted. The gateway holds one of these and calls `client()` for every
/// accepted stream.
pub struct NatsProvider {
    client: async_nats::Client,
}

impl NatsProvider {
    pub async fn connect(endpoint: &str) -> Result<Self, BusError> {
        let client = connect_client(endpoint).await?;
        Ok(Self { client })
    }

    pub fn client(&self) -> Arc<dyn MessageBus> {
        Arc::new(NatsBus::attach(self.client.clone()))
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.client.drain().await {
            warn!(error = %e, "error draining bus connection");
        }
    }
}
