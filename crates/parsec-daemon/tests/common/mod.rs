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

//! A whole fabric on the in-memory broker: every service on its own logical
//! client, the way the real deployment gives every process its own
//! connection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parsec_bus::{InMemoryBroker, InMemoryBus, MessageBus};
use parsec_common::{Character, CharacterId, System, SystemId};
use parsec_daemon::characters::CharacterService;
use parsec_daemon::chatter::ChatterService;
use parsec_daemon::sessions::SessionService;
use parsec_daemon::systems::SystemService;
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(1);

pub struct Fabric {
    pub broker: Arc<InMemoryBroker>,
    pub sessions: Arc<SessionService>,
    pub characters: Arc<CharacterService>,
    pub systems: Arc<SystemService>,
    pub chatter: Arc<ChatterService>,
}

pub fn test_accounts() -> HashMap<String, CharacterId> {
    HashMap::from([("userone".to_string(), 1001), ("usertwo".to_string(), 1002)])
}

pub fn test_characters() -> HashMap<CharacterId, Character> {
    HashMap::from([
        (
            1001,
            Character {
                character_id: 1001,
                name: "Pilot1".to_string(),
            },
        ),
        (
            1002,
            Character {
                character_id: 1002,
                name: "Pilot2".to_string(),
            },
        ),
    ])
}

pub fn test_universe() -> BTreeMap<SystemId, System> {
    BTreeMap::from([
        (
            1,
            System {
                system_id: 1,
                name: "Alpha".to_string(),
                neighbours: BTreeSet::from([2]),
            },
        ),
        (
            2,
            System {
                system_id: 2,
                name: "Beta".to_string(),
                neighbours: BTreeSet::from([1]),
            },
        ),
    ])
}

pub async fn start_fabric() -> Fabric {
    let broker = InMemoryBroker::new();

    let systems = SystemService::new(broker.client(), test_universe());
    systems.start().await.unwrap();

    let characters = CharacterService::new(broker.client(), test_characters());
    characters.start().await.unwrap();

    let sessions = SessionService::new(broker.client(), test_accounts());
    sessions.start().await.unwrap();

    let chatter = ChatterService::new(broker.client());
    chatter.start().await.unwrap();

    Fabric {
        broker,
        sessions,
        characters,
        systems,
        chatter,
    }
}

/// Fan-out listener recording every payload on a subject. Fan-out spies see
/// queue-grouped traffic too, without stealing it from the group.
pub async fn spy(broker: &Arc<InMemoryBroker>, subject: &str) -> mpsc::UnboundedReceiver<Bytes> {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = broker.client();
    client
        .subscribe(
            subject,
            Arc::new(move |_subject, payload| {
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
    rx
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Bytes> {
    let mut payloads = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        payloads.push(payload);
    }
    payloads
}

/// Request/reply with test-friendly decoding.
pub async fn request<Req, Resp>(client: &Arc<InMemoryBus>, subject: &str, request: &Req) -> Resp
where
    Req: bincode::Encode,
    Resp: bincode::Decode<()>,
{
    let payload = parsec_rpc::encode(request).unwrap();
    let reply = client
        .request(subject, Bytes::from(payload), TIMEOUT)
        .await
        .unwrap();
    parsec_rpc::decode(&reply).unwrap()
}

pub async fn publish<Msg: bincode::Encode>(client: &Arc<InMemoryBus>, subject: &str, message: &Msg) {
    let payload = parsec_rpc::encode(message).unwrap();
    client
        .publish(subject, Bytes::from(payload))
        .await
        .unwrap();
}
