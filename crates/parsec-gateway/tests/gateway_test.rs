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

//! End-to-end protocol tests: a whole fabric on the in-memory broker, with
//! client streams driven through a duplex pipe into the same connection
//! code path the TCP listener uses.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parsec_bus::InMemoryBroker;
use parsec_common::{Character, System};
use parsec_daemon::characters::CharacterService;
use parsec_daemon::chatter::ChatterService;
use parsec_daemon::sessions::SessionService;
use parsec_daemon::systems::SystemService;
use parsec_gateway::Connection;
use parsec_rpc::{
    ChatterMessage, GatewayRequest, GatewayResponse, SessionMessageRequest, SessionMessageResponse,
    SessionStartRequest, UniverseRequest, decode, encode,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

struct Fabric {
    broker: Arc<InMemoryBroker>,
    sessions: Arc<SessionService>,
    characters: Arc<CharacterService>,
    systems: Arc<SystemService>,
    #[allow(dead_code)]
    chatter: Arc<ChatterService>,
}

async fn start_fabric() -> Fabric {
    let broker = InMemoryBroker::new();

    let systems = SystemService::new(
        broker.client(),
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
        ]),
    );
    systems.start().await.unwrap();

    let characters = CharacterService::new(
        broker.client(),
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
        ]),
    );
    characters.start().await.unwrap();

    let sessions = SessionService::new(
        broker.client(),
        HashMap::from([("userone".to_string(), 1001), ("usertwo".to_string(), 1002)]),
    );
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

struct Client {
    framed: Framed<DuplexStream, LengthDelimitedCodec>,
}

impl Client {
    /// Open a stream into a spawned gateway connection.
    async fn connect(fabric: &Fabric) -> Self {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let connection = Connection::new(server_io, fabric.broker.client(), "test-peer".to_string());
        tokio::spawn(connection.run());
        Self {
            framed: Framed::new(client_io, LengthDelimitedCodec::new()),
        }
    }

    async fn send(&mut self, request: GatewayRequest) {
        let payload = encode(&request).unwrap();
        self.framed.send(Bytes::from(payload)).await.unwrap();
    }

    async fn next(&mut self) -> GatewayResponse {
        let frame = tokio::time::timeout(FRAME_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream closed")
            .expect("stream error");
        decode(&frame).unwrap()
    }

    /// StartSession + Attach, returning the session id.
    async fn attach(&mut self, username: &str) -> String {
        self.send(GatewayRequest::StartSession(SessionStartRequest {
            username: username.to_string(),
        }))
        .await;
        let GatewayResponse::SessionStarted(response) = self.next().await else {
            panic!("expected SessionStarted");
        };
        assert!(response.ok);
        let session_id = response.session_id.unwrap();
        self.send(GatewayRequest::Attach {
            session_id: session_id.clone(),
        })
        .await;
        session_id
    }

    /// LOGIN, asserting the result and the initial membership vector.
    async fn login(&mut self, expect_members: Vec<u32>) {
        self.send(GatewayRequest::Session(SessionMessageRequest::Login))
            .await;
        let GatewayResponse::Session(SessionMessageResponse::Login {
            ok,
            character_live_info,
        }) = self.next().await
        else {
            panic!("expected Login result");
        };
        assert!(ok);
        assert!(character_live_info.unwrap().active);

        let GatewayResponse::Session(SessionMessageResponse::SystemLiveInfo(live)) =
            self.next().await
        else {
            panic!("expected membership vector");
        };
        assert_eq!(live.system_id, 1);
        assert_eq!(live.character_ids, expect_members);
    }
}

#[tokio::test]
async fn start_session_and_universe_query() {
    let fabric = start_fabric().await;
    let mut client = Client::connect(&fabric).await;

    client
        .send(GatewayRequest::StartSession(SessionStartRequest {
            username: "userone".to_string(),
        }))
        .await;
    let GatewayResponse::SessionStarted(response) = client.next().await else {
        panic!("expected SessionStarted");
    };
    assert!(response.ok);
    assert_eq!(response.character_id, Some(1001));

    client
        .send(GatewayRequest::GetUniverse(UniverseRequest {}))
        .await;
    let GatewayResponse::Universe(universe) = client.next().await else {
        panic!("expected Universe");
    };
    assert!(universe.ok);
    let mut systems = universe.systems;
    systems.sort_by_key(|s| s.system_id);
    assert_eq!(systems.len(), 2);
    assert_eq!(systems[0].name, "Alpha");
    assert_eq!(systems[0].neighbours, vec![2]);
    assert_eq!(systems[1].name, "Beta");
}

#[tokio::test]
async fn unknown_username_is_rejected() {
    let fabric = start_fabric().await;
    let mut client = Client::connect(&fabric).await;

    client
        .send(GatewayRequest::StartSession(SessionStartRequest {
            username: "nobody".to_string(),
        }))
        .await;
    let GatewayResponse::SessionStarted(response) = client.next().await else {
        panic!("expected SessionStarted");
    };
    assert!(!response.ok);
    assert_eq!(fabric.sessions.active_sessions(), 0);
}

#[tokio::test]
async fn login_observes_own_arrival() {
    let fabric = start_fabric().await;
    let mut client = Client::connect(&fabric).await;

    client.attach("userone").await;
    client.login(vec![1001]).await;

    assert!(fabric.characters.is_active(1001));
    assert_eq!(fabric.systems.presence(1), vec![1001]);
}

#[tokio::test]
async fn chatter_reaches_both_co_present_clients() {
    let fabric = start_fabric().await;

    let mut one = Client::connect(&fabric).await;
    one.attach("userone").await;
    one.login(vec![1001]).await;

    let mut two = Client::connect(&fabric).await;
    two.attach("usertwo").await;
    two.login(vec![1001, 1002]).await;

    // The first client watches the second arrive.
    let GatewayResponse::Session(SessionMessageResponse::SystemLiveInfo(live)) = one.next().await
    else {
        panic!("expected membership vector");
    };
    assert_eq!(live.character_ids, vec![1001, 1002]);

    let message = ChatterMessage {
        character_id: 1001,
        system_id: 1,
        text: "hi".to_string(),
    };
    one.send(GatewayRequest::Session(SessionMessageRequest::Chatter(
        message.clone(),
    )))
    .await;

    // Both observe the relay, the sender included; filtering is client-side.
    for client in [&mut one, &mut two] {
        let GatewayResponse::Session(SessionMessageResponse::Chatter(received)) =
            client.next().await
        else {
            panic!("expected chatter");
        };
        assert_eq!(received, message);
    }
}

#[tokio::test]
async fn logout_unwinds_session_and_presence() {
    let fabric = start_fabric().await;
    let mut client = Client::connect(&fabric).await;

    let session_id = client.attach("userone").await;
    client.login(vec![1001]).await;
    assert_eq!(fabric.sessions.session_id_for(1001), Some(session_id));

    client
        .send(GatewayRequest::Session(SessionMessageRequest::Logout))
        .await;

    // The stream closes once the gateway has unwound the session.
    let closed = tokio::time::timeout(FRAME_TIMEOUT, async {
        loop {
            match client.framed.next().await {
                None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    assert_eq!(fabric.sessions.active_sessions(), 0);
    assert!(!fabric.characters.is_active(1001));
    assert_eq!(fabric.systems.presence(1), Vec::<u32>::new());
}

#[tokio::test]
async fn vanished_client_is_torn_down() {
    let fabric = start_fabric().await;
    let mut client = Client::connect(&fabric).await;

    client.attach("userone").await;
    client.login(vec![1001]).await;

    // The client drops without a LOGOUT; the gateway tears everything down.
    drop(client);

    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    while fabric.sessions.active_sessions() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "session never unwound");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!fabric.characters.is_active(1001));
    assert_eq!(fabric.systems.presence(1), Vec::<u32>::new());
}

#[tokio::test]
async fn displaced_client_observes_stop() {
    let fabric = start_fabric().await;

    let mut first = Client::connect(&fabric).await;
    first.attach("userone").await;
    first.login(vec![1001]).await;

    // A second login for the same account from another connection.
    let mut second = Client::connect(&fabric).await;
    second.attach("userone").await;

    // The first connection sees the Stop frame for its displaced session.
    loop {
        match first.next().await {
            GatewayResponse::Session(SessionMessageResponse::Stop) => break,
            GatewayResponse::Session(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    assert_eq!(fabric.sessions.active_sessions(), 1);

    // And the newcomer can still log in cleanly.
    second.login(vec![1001]).await;
    assert!(fabric.characters.is_active(1001));
}
