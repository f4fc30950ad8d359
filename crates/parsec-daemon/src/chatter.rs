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

//! Per-system chat relay. Instances are created lazily on the first topic
//! request for a system and live until the service stops. The relay is
//! stateless: each inbound `ChatterMessage` is validated and republished
//! verbatim; co-presence filtering is the gateway's job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use parsec_bus::{BusError, Handler, MessageBus, traced};
use parsec_common::SystemId;
use parsec_rpc::topics::REQ_CHATTER_TOPIC;
use parsec_rpc::{
    ChatterMessage, SystemTopicRequest, SystemTopicResponse, TopicSet, decode, topics,
};
use tracing::{debug, error, info, warn};

use crate::encode_reply;
use crate::service::ServiceManager;

pub struct ChatterInstance {
    bus: Arc<dyn MessageBus>,
    pub system_id: SystemId,
    /// `PUB.CHATTER.OUT.{sid}`: relayed chatter.
    publish_topic: String,
    /// `PUB.CHATTER.IN.{sid}`: chatter from clients.
    subscribe_topic: String,
}

impl ChatterInstance {
    fn new(bus: Arc<dyn MessageBus>, system_id: SystemId) -> Self {
        Self {
            bus,
            system_id,
            publish_topic: topics::chatter_out(system_id),
            subscribe_topic: topics::chatter_in(system_id),
        }
    }

    /// Topics from the consumer's point of view.
    pub fn topics(&self) -> TopicSet {
        TopicSet {
            subscribe_topic: self.publish_topic.clone(),
            publish_topic: self.subscribe_topic.clone(),
            request_topic: None,
        }
    }

    async fn start(self: &Arc<Self>) {
        let this = self.clone();
        let relay_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move {
                this.relay_cb(payload).await;
                None
            })
        });
        if let Err(e) = self
            .bus
            .subscribe(
                &self.subscribe_topic,
                traced("chatter_relay", relay_handler),
                false,
            )
            .await
        {
            error!(system_id = self.system_id, error = %e, "could not subscribe chatter in-topic");
        }
        info!(system_id = self.system_id, "chatter relay started");
    }

    async fn stop(&self) {
        if let Err(e) = self.bus.unsubscribe(&self.subscribe_topic).await {
            warn!(system_id = self.system_id, error = %e, "could not unsubscribe chatter in-topic");
        }
        info!(system_id = self.system_id, "chatter relay stopped");
    }

    async fn relay_cb(&self, payload: Bytes) {
        // Validate before relaying; the payload itself goes out untouched.
        match decode::<ChatterMessage>(&payload) {
            Ok(message) => {
                debug!(
                    system_id = self.system_id,
                    character_id = message.character_id,
                    "relaying chatter"
                );
            }
            Err(e) => {
                warn!(system_id = self.system_id, error = %e, "dropping malformed chatter");
                return;
            }
        }
        if let Err(e) = self.bus.publish(&self.publish_topic, payload).await {
            warn!(system_id = self.system_id, error = %e, "could not relay chatter");
        }
    }
}

pub struct ChatterService {
    bus: Arc<dyn MessageBus>,
    manager: ServiceManager,
    active: Mutex<HashMap<SystemId, Arc<ChatterInstance>>>,
}

impl ChatterService {
    pub fn new(bus: Arc<dyn MessageBus>) -> Arc<Self> {
        let manager = ServiceManager::new(bus.clone(), parsec_rpc::ServiceKind::Chatter);
        Arc::new(Self {
            bus,
            manager,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        self.manager.start().await?;

        let this = self.clone();
        let topic_handler: Handler = Arc::new(move |_subject, payload| {
            let this = this.clone();
            Box::pin(async move { this.topic_cb(payload).await })
        });
        self.bus
            .subscribe(REQ_CHATTER_TOPIC, traced("chatter_topic", topic_handler), true)
            .await?;

        info!("chatter service started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Err(e) = self.bus.unsubscribe(REQ_CHATTER_TOPIC).await {
            warn!(error = %e, "could not unsubscribe");
        }

        let instances: Vec<Arc<ChatterInstance>> =
            self.active.lock().unwrap().drain().map(|(_, i)| i).collect();
        for instance in instances {
            instance.stop().await;
        }

        self.manager.stop().await;
        info!("chatter service stopped");
    }

    /// Number of live chatter relays.
    pub fn active_relays(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    async fn topic_cb(&self, payload: Bytes) -> Option<Bytes> {
        let request: SystemTopicRequest = match decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed chatter topic request");
                return None;
            }
        };

        // Lazily create the relay for this system. Requests for one subject
        // are handled one at a time, so the check-then-install is safe.
        let existing = self.active.lock().unwrap().get(&request.system_id).cloned();
        let instance = match existing {
            Some(instance) => instance,
            None => {
                let instance = Arc::new(ChatterInstance::new(self.bus.clone(), request.system_id));
                self.active
                    .lock()
                    .unwrap()
                    .insert(request.system_id, instance.clone());
                instance.start().await;
                instance
            }
        };

        encode_reply(&SystemTopicResponse {
            ok: true,
            system_id: request.system_id,
            topics: Some(instance.topics()),
        })
    }
}
