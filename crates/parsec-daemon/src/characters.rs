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

//! Character lifecycle: instances created on login, destroyed on logout or
//! displacement by a re-login. An instance announces itself on its out-topic
//! and keeps its system's presence set current; the ordering on teardown is
//! fixed so a system never retains a character already reported inactive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use parsec_bus::{BusError, DEFAULT_REQUEST_TIMEOUT, Handler, MessageBus, traced};
use parsec_common::{Character, CharacterId, SPAWN_SYSTEM_ID, SystemId};
use parsec_rpc::topics::{
    REQ_CHARACTER_LOGIN, REQ_CHARACTER_LOGOUT, REQ_CHARACTER_STATIC, REQ_CHARACTER_TOPIC,
    REQ_SYSTEM_TOPIC,
};
use parsec_rpc::{
    CharacterLiveInfoMessage, CharacterLiveInfoRequest, CharacterLiveInfoResponse,
    CharacterLoginRequest, CharacterLoginResponse, CharacterLogoutRequest,
    CharacterLogoutResponse, CharacterStaticInfoMessage, CharacterStaticInfoRequest,
    CharacterStaticInfoResponse, CharacterTopicRequest, CharacterTopicResponse,
    SessionMessageRequest, SystemSetLiveCharacterRequest, SystemTopicRequest, SystemTopicResponse,
    TopicSet, decode, encode, topics,
};
use tracing::{debug, error, info, warn};

use crate::encode_reply;
use crate::service::ServiceManager;

pub struct CharacterInstance {
    bus: Arc<dyn MessageBus>,
    pub character_id: CharacterId,
    pub name: String,
    pub system_id: SystemId,
    /// `PUB.CHARACTER.OUT.{cid}`: live info announcements.
    publish_topic: String,
    /// `PUB.CHARACTER.IN.{cid}`: session-relayed commands.
    subscribe_topic: String,
    /// `REQ.CHARACTER.LIVE.{cid}`: authoritative live info queries.
    request_topic: String,
}

impl CharacterInstance {
    fn new(bus: Arc<dyn MessageBus>, character_id: CharacterId, name: String) -> Self {
        Self {
            bus,
            character_id,
            name,
            system_id: SPAWN_SYSTEM_ID,
            publish_topic: topics::character_out(character_id),
            subscribe_topic: topics::character_in(character_id),
            request_topic: topics::character_live(character_id),
        }
    }

    pub fn live_info(&self, active: bool) -> CharacterLiveInfoMessage {
        CharacterLiveInfoMessage {
            character_id: self.character_id,
            system_id: self.system_id,
            active,
        }
    }

    /// Topics from the consumer's point of view.
    pub fn topics(&self) -> TopicSet {
        TopicSet {
            subscribe_topic: self.publish_topic.clone(),
            publish_topic: self.subscribe_topic.clone(),
            request_topic: Some(self.request_topic.clone()),
        }
    }

    async fn publish_live_info(&self, active: bool) {
        let Some(payload) = encode_reply(&self.live_info(active)) else {
            return;
        };
        if let Err(e) = self.bus.publish(&self.publish_topic, payload).await {
            warn!(character_id = self.character_id, error = %e, "could not publish live info");
        }
    }

    /// Tell the character's system it is (or is no longer) here: resolve the
    /// system's publish topic, then send the presence delta. Failures are
    /// transient; the presence set self-corrects on the next login/logout.
    async fn update_system_presence(&self, present: bool) {
        let request = SystemTopicRequest {
            system_id: self.system_id,
        };
        let Ok(payload) = encode(&request) else {
            return;
        };
        let reply = match self
            .bus
            .request(REQ_SYSTEM_TOPIC, payload.into(), DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(system_id = self.system_id, error = %e, "could not resolve system topic");
                return;
            }
        };
        let response: SystemTopicResponse = match decode(&reply) {
            Ok(response) => response,
            Err(e) => {
                warn!(system_id = self.system_id, error = %e, "dropping malformed system topic reply");
                return;
            }
        };
        let Some(system_topics) = response.topics.filter(|_| response.ok) else {
            warn!(system_id = self.system_id, "system topic lookup failed");
            return;
        };

        let delta = SystemSetLiveCharacterRequest {
            character_id: self.character_id,
            system_id: self.system_id,
            present,
        };
        if let Some(payload) = encode_reply(&delta) {
            if let Err(e) = self.bus.publish(&system_topics.publish_topic, payload).await {
                warn!(system_id = self.system_id, error = %e, "could not publish presence delta");
            }
        }
    }

    async fn start(self: &Arc<Self>) {
        let this = self.clone();
        let live_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.live_info_cb(payload).await })
        });
        if let Err(e) = self
            .bus
            .subscribe(
                &self.request_topic,
                traced("character_live", live_handler),
                true,
            )
            .await
        {
            error!(character_id = self.character_id, error = %e, "could not subscribe live topic");
        }

        let character_id = self.character_id;
        let inbound_handler: Handler = Arc::new(move |_subject, payload| {
            Box::pin(async move {
                match decode::<SessionMessageRequest>(&payload) {
                    Ok(message) => debug!(character_id, ?message, "character inbound"),
                    Err(e) => {
                        warn!(character_id, error = %e, "dropping malformed character frame")
                    }
                }
                None
            })
        });
        if let Err(e) = self
            .bus
            .subscribe(
                &self.subscribe_topic,
                traced("character_inbound", inbound_handler),
                false,
            )
            .await
        {
            error!(character_id = self.character_id, error = %e, "could not subscribe in-topic");
        }

        self.publish_live_info(true).await;
        self.update_system_presence(true).await;
        info!(
            character_id = self.character_id,
            system_id = self.system_id,
            "character started"
        );
    }

    async fn stop(&self) {
        // Presence first, then the inactive announcement: the system must
        // never retain a character already reported inactive.
        self.update_system_presence(false).await;
        self.publish_live_info(false).await;

        for subject in [&self.request_topic, &self.subscribe_topic] {
            if let Err(e) = self.bus.unsubscribe(subject).await {
                warn!(character_id = self.character_id, subject, error = %e, "could not unsubscribe");
            }
        }
        info!(character_id = self.character_id, "character stopped");
    }

    async fn live_info_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: CharacterLiveInfoRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed live info request");
                return None;
            }
        };
        if request.character_id != self.character_id {
            warn!(
                character_id = self.character_id,
                requested = request.character_id,
                "live info request for another character"
            );
            return None;
        }
        encode_reply(&CharacterLiveInfoResponse {
            ok: true,
            character_live_info: Some(self.live_info(true)),
            topics: Some(self.topics()),
        })
    }
}

pub struct CharacterService {
    bus: Arc<dyn MessageBus>,
    manager: ServiceManager,
    characters: HashMap<CharacterId, Character>,
    active: Mutex<HashMap<CharacterId, Arc<CharacterInstance>>>,
}

impl CharacterService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        characters: HashMap<CharacterId, Character>,
    ) -> Arc<Self> {
        let manager = ServiceManager::new(bus.clone(), parsec_rpc::ServiceKind::Character);
        Arc::new(Self {
            bus,
            manager,
            characters,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        self.manager.start().await?;

        let this = self.clone();
        let static_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.static_info_cb(payload).await })
        });
        self.bus
            .subscribe(
                REQ_CHARACTER_STATIC,
                traced("character_static", static_handler),
                true,
            )
            .await?;

        let this = self.clone();
        let login_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.login_cb(payload).await })
        });
        self.bus
            .subscribe(
                REQ_CHARACTER_LOGIN,
                traced("character_login", login_handler),
                true,
            )
            .await?;

        let this = self.clone();
        let logout_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.logout_cb(payload).await })
        });
        self.bus
            .subscribe(
                REQ_CHARACTER_LOGOUT,
                traced("character_logout", logout_handler),
                true,
            )
            .await?;

        let this = self.clone();
        let topic_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.topic_cb(payload).await })
        });
        self.bus
            .subscribe(
                REQ_CHARACTER_TOPIC,
                traced("character_topic", topic_handler),
                true,
            )
            .await?;

        info!("character service started");
        Ok(())
    }

    pub async fn stop(&self) {
        for subject in [
            REQ_CHARACTER_TOPIC,
            REQ_CHARACTER_LOGOUT,
            REQ_CHARACTER_LOGIN,
            REQ_CHARACTER_STATIC,
        ] {
            if let Err(e) = self.bus.unsubscribe(subject).await {
                warn!(subject, error = %e, "could not unsubscribe");
            }
        }

        let instances: Vec<Arc<CharacterInstance>> =
            self.active.lock().unwrap().drain().map(|(_, c)| c).collect();
        for instance in instances {
            instance.stop().await;
        }

        self.manager.stop().await;
        info!("character service stopped");
    }

    /// Number of active character instances.
    pub fn active_characters(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn is_active(&self, character_id: CharacterId) -> bool {
        self.active.lock().unwrap().contains_key(&character_id)
    }

    async fn static_info_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: CharacterStaticInfoRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed static info request");
                return None;
            }
        };
        let response = match self.characters.get(&request.character_id) {
            Some(character) => CharacterStaticInfoResponse {
                ok: true,
                character_static_info: Some(CharacterStaticInfoMessage {
                    character_id: character.character_id,
                    name: character.name.clone(),
                }),
            },
            None => CharacterStaticInfoResponse {
                ok: false,
                character_static_info: None,
            },
        };
        encode_reply(&response)
    }

    async fn login_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: CharacterLoginRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed login request");
                return None;
            }
        };
        let character_id = request.character_id;

        // A character is present at most once: a re-login displaces the
        // prior instance. Same lock discipline as session displacement.
        while let Some(previous) = self.take_active(character_id) {
            info!(character_id, "displacing prior character instance");
            previous.stop().await;
        }

        let Some(character) = self.characters.get(&character_id) else {
            info!(character_id, "unknown character");
            return encode_reply(&CharacterLoginResponse {
                ok: false,
                character_id,
                character_live_info: None,
            });
        };

        let instance = Arc::new(CharacterInstance::new(
            self.bus.clone(),
            character_id,
            character.name.clone(),
        ));
        self.active
            .lock()
            .unwrap()
            .insert(character_id, instance.clone());
        instance.start().await;

        encode_reply(&CharacterLoginResponse {
            ok: true,
            character_id,
            character_live_info: Some(instance.live_info(true)),
        })
    }

    async fn logout_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: CharacterLogoutRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed logout request");
                return None;
            }
        };
        let character_id = request.character_id;

        let ok = match self.take_active(character_id) {
            Some(instance) => {
                instance.stop().await;
                true
            }
            None => false,
        };
        info!(character_id, ok, "character logout");
        encode_reply(&CharacterLogoutResponse { ok, character_id })
    }

    async fn topic_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: CharacterTopicRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed character topic request");
                return None;
            }
        };
        let instance = self
            .active
            .lock()
            .unwrap()
            .get(&request.character_id)
            .cloned();
        let response = CharacterTopicResponse {
            ok: instance.is_some(),
            character_id: request.character_id,
            topics: instance.map(|i| i.topics()),
        };
        encode_reply(&response)
    }

    fn take_active(&self, character_id: CharacterId) -> Option<Arc<CharacterInstance>> {
        self.active.lock().unwrap().remove(&character_id)
    }
}
