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

//! Thin subject-based publish/subscribe abstraction over which all parsec
//! services coordinate. Delivery is best-effort and at-most-once: per-publisher
//! FIFO within a subject, no ordering across subjects, nothing replayed.
//!
//! Two implementations: [`nats::NatsBus`] over a NATS server, and
//! [`in_memory::InMemoryBroker`] with identical observable semantics for
//! hermetic tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::Instrument;

pub mod in_memory;
pub mod nats;

pub use in_memory::{InMemoryBroker, InMemoryBus};
pub use nats::{NatsBus, NatsProvider};

/// Request/reply calls that do not specify otherwise wait this long.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the correlation id injected on every request.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Errors at the bus transport layer. `Timeout` and `NoResponders` are
/// recoverable: handlers log them and answer their own caller with a
/// failure record.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("request timed out on {0}")]
    Timeout(String),
    #[error("no responders on {0}")]
    NoResponders(String),
    #[error("bus connection lost")]
    Disconnected,
    #[error("could not reach bus server: {0}")]
    Connection(String),
}

pub type HandlerFuture = BoxFuture<'static, Option<Bytes>>;

/// A subscription handler: takes the subject and payload, returns the reply
/// payload, or `None` when no reply is warranted. A handler must never
/// panic; malformed payloads are logged and dropped, leaving the requester
/// to observe a timeout.
pub type Handler = Arc<dyn Fn(String, Bytes) -> HandlerFuture + Send + Sync>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Bind `handler` to `subject`. With `queued`, joins a bus-level queue
    /// group named identically to the subject, so competing subscribers
    /// share the load and each message reaches exactly one of them; without
    /// it, every subscriber receives a copy. Returns `false` if the subject
    /// is already bound in this client.
    async fn subscribe(
        &self,
        subject: &str,
        handler: Handler,
        queued: bool,
    ) -> Result<bool, BusError>;

    /// Drop the binding for `subject`. Returns `false` if it was not bound.
    async fn unsubscribe(&self, subject: &str) -> Result<bool, BusError>;

    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Request/reply through a synthesized inbox: resolves to the first
    /// reply, or `Timeout` / `NoResponders`.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BusError>;

    /// Tear down every recorded subscription. Clients that own their
    /// connection also drain and close it.
    async fn stop(&self);
}

/// Wrap a handler in a named tracing span, installed at
/// subscription-registration time.
pub fn traced(name: &'static str, handler: Handler) -> Handler {
    Arc::new(move |subject: String, payload: Bytes| {
        let span = tracing::info_span!("bus_handler", handler = name, subject = %subject);
        Box::pin(handler(subject, payload).instrument(span)) as HandlerFuture
    })
}
