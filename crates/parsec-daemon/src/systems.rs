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

//! Per-system presence: one eagerly-created instance per catalog entry, each
//! owning the authoritative presence set for its system. Deltas arrive on
//! the in-topic; any delta that actually changes the set republishes the
//! full membership vector, so replays are harmless and subscribers diff.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use parsec_bus::{BusError, Handler, MessageBus, traced};
use parsec_common::{CharacterId, System, SystemId};
use parsec_rpc::topics::{REQ_SYSTEM_STATIC, REQ_SYSTEM_TOPIC, REQ_UNIVERSE_STATIC};
use parsec_rpc::{
    SystemLiveInfoMessage, SystemLiveInfoRequest, SystemLiveInfoResponse,
    SystemSetLiveCharacterRequest, SystemStaticInfoMessage, SystemStaticInfoRequest,
    SystemStaticInfoResponse, SystemTopicRequest, SystemTopicResponse, TopicSet, UniverseRequest,
    UniverseResponse, decode, topics,
};
use tracing::{error, info, warn};

use crate::encode_reply;
use crate::service::ServiceManager;

fn static_info(system: &System) -> SystemStaticInfoMessage {
    SystemStaticInfoMessage {
        system_id: system.system_id,
        name: system.name.clone(),
        neighbours: system.neighbours.iter().copied().collect(),
    }
}

pub struct SystemInstance {
    bus: Arc<dyn MessageBus>,
    pub system: System,
    presence: Mutex<BTreeSet<CharacterId>>,
    /// `PUB.SYSTEM.OUT.{sid}`: membership vectors.
    publish_topic: String,
    /// `PUB.SYSTEM.IN.{sid}`: presence deltas.
    subscribe_topic: String,
    /// `REQ.SYSTEM.LIVE.{sid}`: presence snapshot queries.
    request_topic: String,
}

impl SystemInstance {
    fn new(bus: Arc<dyn MessageBus>, system: System) -> Self {
        let system_id = system.system_id;
        Self {
            bus,
            system,
            presence: Mutex::new(BTreeSet::new()),
            publish_topic: topics::system_out(system_id),
            subscribe_topic: topics::system_in(system_id),
            request_topic: topics::system_live(system_id),
        }
    }

    pub fn live_info(&self) -> SystemLiveInfoMessage {
        SystemLiveInfoMessage {
            system_id: self.system.system_id,
            character_ids: self.presence.lock().unwrap().iter().copied().collect(),
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

    async fn start(self: &Arc<Self>) {
        let this = self.clone();
        let live_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.live_info_cb(payload).await })
        });
        if let Err(e) = self
            .bus
            .subscribe(&self.request_topic, traced("system_live", live_handler), true)
            .await
        {
            error!(system_id = self.system.system_id, error = %e, "could not subscribe live topic");
        }

        let this = self.clone();
        let delta_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move {
                this.presence_delta_cb(payload).await;
                None
            })
        });
        if let Err(e) = self
            .bus
            .subscribe(
                &self.subscribe_topic,
                traced("system_presence", delta_handler),
                false,
            )
            .await
        {
            error!(system_id = self.system.system_id, error = %e, "could not subscribe in-topic");
        }

        info!(system_id = self.system.system_id, name = %self.system.name, "system started");
    }

    async fn stop(&self) {
        for subject in [&self.request_topic, &self.subscribe_topic] {
            if let Err(e) = self.bus.unsubscribe(subject).await {
                warn!(system_id = self.system.system_id, subject, error = %e, "could not unsubscribe");
            }
        }
        info!(system_id = self.system.system_id, "system stopped");
    }

    async fn live_info_cb(&self, payload: Bytes) -> Option<Bytes> {
        if let Err(e) = decode::<SystemLiveInfoRequest>(&payload) {
            warn!(error = %e, "dropping malformed live info request");
            return None;
        }
        encode_reply(&SystemLiveInfoResponse {
            ok: true,
            system_id: self.system.system_id,
            system_live_info: Some(self.live_info()),
        })
    }

    async fn presence_delta_cb(&self, payload: Bytes) {
        let delta: SystemSetLiveCharacterRequest = match decode(&payload) {
            Ok(delta) => delta,
            Err(e) => {
                warn!(system_id = self.system.system_id, error = %e, "dropping malformed presence delta");
                return;
            }
        };
        if delta.system_id != self.system.system_id {
            error!(
                system_id = self.system.system_id,
                delta_system_id = delta.system_id,
                "presence delta for another system"
            );
            return;
        }

        // No-op deltas neither mutate nor republish; replays are safe.
        let changed = {
            let mut presence = self.presence.lock().unwrap();
            if delta.present {
                presence.insert(delta.character_id)
            } else {
                presence.remove(&delta.character_id)
            }
        };
        if !changed {
            return;
        }

        let live = self.live_info();
        info!(
            system_id = self.system.system_id,
            character_id = delta.character_id,
            present = delta.present,
            population = live.character_ids.len(),
            "presence changed"
        );
        if let Some(payload) = encode_reply(&live) {
            if let Err(e) = self.bus.publish(&self.publish_topic, payload).await {
                warn!(system_id = self.system.system_id, error = %e, "could not publish membership vector");
            }
        }
    }
}

pub struct SystemService {
    bus: Arc<dyn MessageBus>,
    manager: ServiceManager,
    universe: BTreeMap<SystemId, System>,
    instances: Mutex<BTreeMap<SystemId, Arc<SystemInstance>>>,
}

impl SystemService {
    pub fn new(bus: Arc<dyn MessageBus>, universe: BTreeMap<SystemId, System>) -> Arc<Self> {
        let manager = ServiceManager::new(bus.clone(), parsec_rpc::ServiceKind::System);
        Arc::new(Self {
            bus,
            manager,
            universe,
            instances: Mutex::new(BTreeMap::new()),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        self.manager.start().await?;

        // Eagerly bring up one instance per catalog entry.
        for system in self.universe.values() {
            let instance = Arc::new(SystemInstance::new(self.bus.clone(), system.clone()));
            instance.start().await;
            self.instances
                .lock()
                .unwrap()
                .insert(system.system_id, instance);
        }

        let this = self.clone();
        let static_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.static_info_cb(payload).await })
        });
        self.bus
            .subscribe(
                REQ_SYSTEM_STATIC,
                traced("system_static", static_handler),
                true,
            )
            .await?;

        let this = self.clone();
        let topic_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.topic_cb(payload).await })
        });
        self.bus
            .subscribe(REQ_SYSTEM_TOPIC, traced("system_topic", topic_handler), true)
            .await?;

        let this = self.clone();
        let universe_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.universe_cb(payload).await })
        });
        self.bus
            .subscribe(
                REQ_UNIVERSE_STATIC,
                traced("universe_static", universe_handler),
                true,
            )
            .await?;

        info!(systems = self.universe.len(), "system service started");
        Ok(())
    }

    pub async fn stop(&self) {
        for subject in [REQ_UNIVERSE_STATIC, REQ_SYSTEM_TOPIC, REQ_SYSTEM_STATIC] {
            if let Err(e) = self.bus.unsubscribe(subject).await {
                warn!(subject, error = %e, "could not unsubscribe");
            }
        }

        let instances: Vec<Arc<SystemInstance>> = {
            let mut instances = self.instances.lock().unwrap();
            std::mem::take(&mut *instances).into_values().collect()
        };
        for instance in instances {
            instance.stop().await;
        }

        self.manager.stop().await;
        info!("system service stopped");
    }

    /// Presence snapshot of a system, sorted ascending.
    pub fn presence(&self, system_id: SystemId) -> Vec<CharacterId> {
        self.instances
            .lock()
            .unwrap()
            .get(&system_id)
            .map(|i| i.live_info().character_ids)
            .unwrap_or_default()
    }

    async fn static_info_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: SystemStaticInfoRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed static info request");
                return None;
            }
        };
        let response = match self.universe.get(&request.system_id) {
            Some(system) => SystemStaticInfoResponse {
                ok: true,
                system_id: request.system_id,
                system_static_info: Some(static_info(system)),
            },
            None => SystemStaticInfoResponse {
                ok: false,
                system_id: request.system_id,
                system_static_info: None,
            },
        };
        encode_reply(&response)
    }

    async fn topic_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: SystemTopicRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed system topic request");
                return None;
            }
        };
        let instance = self
            .instances
            .lock()
            .unwrap()
            .get(&request.system_id)
            .cloned();
        let response = SystemTopicResponse {
            ok: instance.is_some(),
            system_id: request.system_id,
            topics: instance.map(|i| i.topics()),
        };
        encode_reply(&response)
    }

    async fn universe_cb(&self, payload: Bytes) -> Option<Bytes> {
        if let Err(e) = decode::<UniverseRequest>(&payload) {
            warn!(error = %e, "dropping malformed universe request");
            return None;
        }
        let systems: Vec<SystemStaticInfoMessage> =
            self.universe.values().map(static_info).collect();
        encode_reply(&UniverseResponse { ok: true, systems })
    }
}
