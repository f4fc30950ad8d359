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

//! Session lifecycle: one live session per character, enforced by
//! displacement. A newer login evicts the older session, whose stop path
//! publishes a `Stop` frame so the displaced client can observe its logout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Utc;
use parsec_bus::{BusError, Handler, MessageBus, traced};
use parsec_common::CharacterId;
use parsec_rpc::topics::{REQ_CHARACTER_LOGOUT, REQ_SESSION_START, REQ_SESSION_STOP};
use parsec_rpc::{
    CharacterLogoutRequest, SessionMessageRequest, SessionMessageResponse, SessionStartRequest,
    SessionStartResponse, SessionStopRequest, SessionStopResponse, TopicSet, decode, topics,
};
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};

use crate::encode_reply;
use crate::service::ServiceManager;

/// One connected client's server-side half.
pub struct SessionInstance {
    bus: Arc<dyn MessageBus>,
    pub session_id: String,
    pub character_id: CharacterId,
    /// `PUB.SESSION.OUT.{sid}`: frames destined for the client.
    publish_topic: String,
    /// `PUB.SESSION.IN.{sid}`: frames arriving from the client.
    subscribe_topic: String,
}

fn new_session_id(character_id: CharacterId) -> String {
    let mut hasher = Sha1::new();
    hasher.update(Utc::now().to_rfc3339().as_bytes());
    hasher.update(character_id.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl SessionInstance {
    fn new(bus: Arc<dyn MessageBus>, character_id: CharacterId) -> Self {
        let session_id = new_session_id(character_id);
        let publish_topic = topics::session_out(&session_id);
        let subscribe_topic = topics::session_in(&session_id);
        Self {
            bus,
            session_id,
            character_id,
            publish_topic,
            subscribe_topic,
        }
    }

    /// Topics from the client's point of view.
    pub fn topics(&self) -> TopicSet {
        TopicSet {
            subscribe_topic: self.publish_topic.clone(),
            publish_topic: self.subscribe_topic.clone(),
            request_topic: None,
        }
    }

    async fn publish_frame(&self, frame: &SessionMessageResponse) {
        let Some(payload) = encode_reply(frame) else {
            return;
        };
        if let Err(e) = self.bus.publish(&self.publish_topic, payload).await {
            warn!(session_id = %self.session_id, error = %e, "could not publish session frame");
        }
    }

    async fn start(&self) {
        let session_id = self.session_id.clone();
        let handler: Handler = Arc::new(move |_subject, payload| {
            let session_id = session_id.clone();
            Box::pin(async move {
                match decode::<SessionMessageRequest>(&payload) {
                    Ok(message) => {
                        debug!(session_id = %session_id, ?message, "session inbound")
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "dropping malformed session frame")
                    }
                }
                None
            })
        });
        if let Err(e) = self
            .bus
            .subscribe(
                &self.subscribe_topic,
                traced("session_inbound", handler),
                false,
            )
            .await
        {
            error!(session_id = %self.session_id, error = %e, "could not subscribe session in-topic");
        }

        self.publish_frame(&SessionMessageResponse::Start).await;
        info!(session_id = %self.session_id, character_id = self.character_id, "session started");
    }

    async fn stop(&self) {
        self.publish_frame(&SessionMessageResponse::Stop).await;
        if let Err(e) = self.bus.unsubscribe(&self.subscribe_topic).await {
            warn!(session_id = %self.session_id, error = %e, "could not unsubscribe session in-topic");
        }

        // Fallback logout: even if the client vanished without a clean
        // LOGOUT, the character is torn down.
        let logout = CharacterLogoutRequest {
            character_id: self.character_id,
        };
        if let Some(payload) = encode_reply(&logout) {
            if let Err(e) = self.bus.publish(REQ_CHARACTER_LOGOUT, payload).await {
                warn!(session_id = %self.session_id, error = %e, "could not publish fallback logout");
            }
        }
        info!(session_id = %self.session_id, character_id = self.character_id, "session stopped");
    }
}

#[derive(Default)]
struct SessionIndex {
    by_session: HashMap<String, Arc<SessionInstance>>,
    by_character: HashMap<CharacterId, String>,
}

pub struct SessionService {
    bus: Arc<dyn MessageBus>,
    manager: ServiceManager,
    accounts: HashMap<String, CharacterId>,
    index: Mutex<SessionIndex>,
}

impl SessionService {
    pub fn new(bus: Arc<dyn MessageBus>, accounts: HashMap<String, CharacterId>) -> Arc<Self> {
        let manager = ServiceManager::new(bus.clone(), parsec_rpc::ServiceKind::Session);
        Arc::new(Self {
            bus,
            manager,
            accounts,
            index: Mutex::new(SessionIndex::default()),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        self.manager.start().await?;

        let this = self.clone();
        let start_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.session_start_cb(payload).await })
        });
        self.bus
            .subscribe(
                REQ_SESSION_START,
                traced("session_start", start_handler),
                true,
            )
            .await?;

        let this = self.clone();
        let stop_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.session_stop_cb(payload).await })
        });
        self.bus
            .subscribe(REQ_SESSION_STOP, traced("session_stop", stop_handler), true)
            .await?;

        info!("session service started");
        Ok(())
    }

    pub async fn stop(&self) {
        for subject in [REQ_SESSION_STOP, REQ_SESSION_START] {
            if let Err(e) = self.bus.unsubscribe(subject).await {
                warn!(subject, error = %e, "could not unsubscribe");
            }
        }

        let sessions: Vec<Arc<SessionInstance>> = {
            let mut index = self.index.lock().unwrap();
            index.by_character.clear();
            index.by_session.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.stop().await;
        }

        self.manager.stop().await;
        info!("session service stopped");
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.index.lock().unwrap().by_session.len()
    }

    /// The live session for a character, if any.
    pub fn session_id_for(&self, character_id: CharacterId) -> Option<String> {
        self.index
            .lock()
            .unwrap()
            .by_character
            .get(&character_id)
            .cloned()
    }

    fn take_by_character(&self, character_id: CharacterId) -> Option<Arc<SessionInstance>> {
        let mut index = self.index.lock().unwrap();
        let session_id = index.by_character.remove(&character_id)?;
        index.by_session.remove(&session_id)
    }

    fn take_by_session(&self, session_id: &str) -> Option<Arc<SessionInstance>> {
        let mut index = self.index.lock().unwrap();
        let session = index.by_session.remove(session_id)?;
        index.by_character.remove(&session.character_id);
        Some(session)
    }

    async fn session_start_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: SessionStartRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed session start request");
                return None;
            }
        };

        let Some(&character_id) = self.accounts.get(&request.username) else {
            info!(username = %request.username, "unknown account");
            return encode_reply(&SessionStartResponse::failed());
        };

        // Only one active session per character: evict any prior one. The
        // index entries are removed under the lock, the stop (which does bus
        // I/O) runs outside it; loop in case a concurrent handler installed
        // another in between.
        while let Some(previous) = self.take_by_character(character_id) {
            info!(
                session_id = %previous.session_id,
                character_id,
                "displacing prior session"
            );
            previous.stop().await;
        }

        let session = Arc::new(SessionInstance::new(self.bus.clone(), character_id));
        {
            let mut index = self.index.lock().unwrap();
            index
                .by_session
                .insert(session.session_id.clone(), session.clone());
            index
                .by_character
                .insert(character_id, session.session_id.clone());
        }
        session.start().await;

        encode_reply(&SessionStartResponse {
            ok: true,
            character_id: Some(character_id),
            session_id: Some(session.session_id.clone()),
            session_topics: Some(session.topics()),
        })
    }

    async fn session_stop_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: SessionStopRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed session stop request");
                return None;
            }
        };

        let ok = match self.take_by_session(&request.session_id) {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        };
        info!(session_id = %request.session_id, ok, "session stop");
        encode_reply(&SessionStopResponse { ok })
    }
}
