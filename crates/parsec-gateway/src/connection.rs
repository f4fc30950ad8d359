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

//! One client connection: a handshake phase answering the unary calls
//! (`StartSession`, `GetUniverse`), then, once the client attaches its
//! session, a streaming phase bridged by two unbounded channels and two
//! cooperating tasks. The writer task drains bus events into the client
//! stream; the reader loop decodes client frames onto the bus. A close on
//! either side terminates the other, so a stalled client write never holds
//! up frame handling.

use std::sync::Arc;

use bytes::Bytes;
use eyre::WrapErr;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parsec_bus::{DEFAULT_REQUEST_TIMEOUT, Handler, MessageBus, traced};
use parsec_common::CharacterId;
use parsec_rpc::topics::{
    REQ_CHARACTER_LOGIN, REQ_CHARACTER_LOGOUT, REQ_CHARACTER_TOPIC, REQ_CHATTER_TOPIC,
    REQ_SESSION_START, REQ_SESSION_STOP, REQ_SYSTEM_TOPIC, REQ_UNIVERSE_STATIC,
};
use parsec_rpc::{
    CharacterLiveInfoMessage, CharacterLoginRequest, CharacterLoginResponse,
    CharacterLogoutRequest, CharacterLogoutResponse, CharacterTopicRequest,
    CharacterTopicResponse, ChatterMessage, GatewayRequest, GatewayResponse,
    SessionMessageRequest, SessionMessageResponse, SessionStartRequest, SessionStartResponse,
    SessionStopRequest, SessionStopResponse, SystemLiveInfoMessage, SystemLiveInfoRequest,
    SystemLiveInfoResponse, SystemTopicRequest, SystemTopicResponse, TopicSet, UniverseRequest,
    UniverseResponse, decode, encode,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

type FrameWriter<S> = SplitSink<Framed<S, LengthDelimitedCodec>, Bytes>;
type FrameReader<S> = SplitStream<Framed<S, LengthDelimitedCodec>>;

/// The session this connection attached, as returned by `StartSession`.
struct SessionAuth {
    session_id: String,
    character_id: CharacterId,
    session_topics: TopicSet,
}

/// Established after a successful LOGIN frame.
struct LoginState {
    /// Where this client's chatter goes, when the relay was resolvable.
    chatter_in: Option<String>,
}

/// Why the streaming phase ended. On a server-initiated stop the session
/// and character are already torn down (displacement or shutdown); tearing
/// them down again would sabotage the displacing session.
enum Departure {
    Client,
    Server,
}

pub struct Connection<S> {
    write: FrameWriter<S>,
    read: FrameReader<S>,
    link: BusLink,
}

async fn send_frame<S>(
    write: &mut FrameWriter<S>,
    response: &GatewayResponse,
) -> Result<(), eyre::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = encode(response).wrap_err("could not encode frame")?;
    write
        .send(Bytes::from(payload))
        .await
        .wrap_err("could not write frame")?;
    Ok(())
}

/// The writer half of the stream bridge: drains bus events into the client
/// stream until the channel closes, a write fails, or the session is
/// stopped server-side.
async fn write_loop<S>(
    mut write: FrameWriter<S>,
    mut client_rx: UnboundedReceiver<GatewayResponse>,
    peer: String,
) -> Departure
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(event) = client_rx.recv().await {
        let stopped = matches!(
            &event,
            GatewayResponse::Session(SessionMessageResponse::Stop)
        );
        let payload = match encode(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %peer, error = %e, "could not encode frame");
                continue;
            }
        };
        if let Err(e) = write.send(Bytes::from(payload)).await {
            debug!(peer = %peer, error = %e, "client write failed");
            return Departure::Client;
        }
        if stopped {
            // Displaced or shut down server-side; the stream is done once
            // the client has seen the Stop.
            return Departure::Server;
        }
    }
    Departure::Server
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Connection<S> {
    pub fn new(stream: S, bus: Arc<dyn MessageBus>, peer: String) -> Self {
        let (write, read) = Framed::new(stream, LengthDelimitedCodec::new()).split();
        Self {
            write,
            read,
            link: BusLink { bus, peer },
        }
    }

    pub async fn run(mut self) -> Result<(), eyre::Error> {
        let auth = match self.handshake().await? {
            Some(auth) => auth,
            None => {
                debug!(peer = %self.link.peer, "connection closed before attach");
                self.link.bus.stop().await;
                return Ok(());
            }
        };
        info!(peer = %self.link.peer, session_id = %auth.session_id, "session attached");

        let bus = self.link.bus.clone();
        let result = self.stream_phase(auth).await;
        bus.stop().await;
        result
    }

    /// Answer unary calls until the client attaches the session it started
    /// on this connection. Returns `None` when the stream closes first.
    async fn handshake(&mut self) -> Result<Option<SessionAuth>, eyre::Error> {
        let mut started: Option<SessionAuth> = None;
        while let Some(frame) = self.read.next().await {
            let frame = frame.wrap_err("could not read client frame")?;
            let request: GatewayRequest = match decode(&frame) {
                Ok(request) => request,
                Err(e) => {
                    warn!(peer = %self.link.peer, error = %e, "dropping malformed frame");
                    continue;
                }
            };
            match request {
                GatewayRequest::StartSession(start) => {
                    let response = self.link.start_session(start).await;
                    if response.ok {
                        if let (Some(character_id), Some(session_id), Some(session_topics)) = (
                            response.character_id,
                            response.session_id.clone(),
                            response.session_topics.clone(),
                        ) {
                            started = Some(SessionAuth {
                                session_id,
                                character_id,
                                session_topics,
                            });
                        }
                    }
                    send_frame(&mut self.write, &GatewayResponse::SessionStarted(response))
                        .await?;
                }
                GatewayRequest::GetUniverse(_) => {
                    let response = self.link.get_universe().await;
                    send_frame(&mut self.write, &GatewayResponse::Universe(response)).await?;
                }
                GatewayRequest::Attach { session_id } => {
                    match started.take() {
                        Some(auth) if auth.session_id == session_id => return Ok(Some(auth)),
                        _ => {
                            warn!(peer = %self.link.peer, session_id, "attach for a session not started here");
                            return Ok(None);
                        }
                    }
                }
                GatewayRequest::Session(_) => {
                    warn!(peer = %self.link.peer, "session frame before attach");
                }
            }
        }
        Ok(None)
    }

    /// The streaming phase: two unbounded channels, two tasks. Bus events
    /// funnel through `to_client` into the spawned writer task; this loop
    /// is the reader, decoding client frames onto the bus. Whichever side
    /// finishes first takes the other down with it.
    async fn stream_phase(self, auth: SessionAuth) -> Result<(), eyre::Error> {
        let Connection { write, mut read, link } = self;
        let (to_client, client_rx) = unbounded_channel::<GatewayResponse>();

        // Frames from the session instance pass through verbatim.
        link.forward_subscription(
            &auth.session_topics.subscribe_topic,
            to_client.clone(),
            |payload| match decode::<SessionMessageResponse>(&payload) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!(error = %e, "dropping malformed session frame");
                    None
                }
            },
        )
        .await;

        let mut writer = tokio::spawn(write_loop(write, client_rx, link.peer.clone()));

        let mut login_state: Option<LoginState> = None;
        let departure = loop {
            select! {
                finished = &mut writer => {
                    break finished.unwrap_or(Departure::Client);
                }
                frame = read.next() => {
                    let frame = match frame {
                        None => break Departure::Client,
                        Some(Err(e)) => {
                            warn!(peer = %link.peer, error = %e, "stream error");
                            break Departure::Client;
                        }
                        Some(Ok(frame)) => frame,
                    };
                    let request: GatewayRequest = match decode(&frame) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(peer = %link.peer, error = %e, "dropping malformed frame");
                            continue;
                        }
                    };
                    match request {
                        GatewayRequest::Session(SessionMessageRequest::Login) => {
                            login_state = link.handle_login(&auth, &to_client).await;
                        }
                        GatewayRequest::Session(SessionMessageRequest::Logout) => {
                            break Departure::Client;
                        }
                        GatewayRequest::Session(SessionMessageRequest::Chatter(message)) => {
                            link.relay_chatter(&login_state, message).await;
                        }
                        GatewayRequest::Session(other) => {
                            // Anything else goes verbatim onto the session
                            // in-topic.
                            if let Ok(payload) = encode(&other) {
                                if let Err(e) = link
                                    .bus
                                    .publish(&auth.session_topics.publish_topic, Bytes::from(payload))
                                    .await
                                {
                                    warn!(error = %e, "could not forward session frame");
                                }
                            }
                        }
                        GatewayRequest::GetUniverse(_) => {
                            let response = link.get_universe().await;
                            let _ = to_client.send(GatewayResponse::Universe(response));
                        }
                        GatewayRequest::StartSession(_) | GatewayRequest::Attach { .. } => {
                            warn!(peer = %link.peer, "unexpected handshake frame mid-stream");
                        }
                    }
                }
            }
        };

        // A close on either side terminates the other.
        writer.abort();
        drop(to_client);

        if let Departure::Client = departure {
            link.teardown(&auth).await;
        }
        info!(peer = %link.peer, session_id = %auth.session_id, "stream closed");
        Ok(())
    }
}

/// The bus-facing half of a connection: one logical bus client plus the
/// request/reply and subscription plumbing shared by both phases.
struct BusLink {
    bus: Arc<dyn MessageBus>,
    peer: String,
}

impl BusLink {
    /// Request/reply against the bus, absorbing transport and decode
    /// failures into `None`; callers answer the client with a failure
    /// record.
    async fn call<Req, Resp>(&self, subject: &str, request: &Req) -> Option<Resp>
    where
        Req: bincode::Encode,
        Resp: bincode::Decode<()>,
    {
        let payload = match encode(request) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(subject, error = %e, "could not encode request");
                return None;
            }
        };
        match self
            .bus
            .request(subject, Bytes::from(payload), DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            Ok(reply) => match decode(&reply) {
                Ok(response) => Some(response),
                Err(e) => {
                    warn!(subject, error = %e, "dropping malformed reply");
                    None
                }
            },
            Err(e) => {
                warn!(subject, error = %e, "request failed");
                None
            }
        }
    }

    async fn start_session(&self, request: SessionStartRequest) -> SessionStartResponse {
        self.call(REQ_SESSION_START, &request)
            .await
            .unwrap_or_else(SessionStartResponse::failed)
    }

    async fn get_universe(&self) -> UniverseResponse {
        self.call(REQ_UNIVERSE_STATIC, &UniverseRequest {})
            .await
            .unwrap_or(UniverseResponse {
                ok: false,
                systems: Vec::new(),
            })
    }

    /// LOGIN: bring the character up, then wire this connection into the
    /// out-topics it should observe. The presence snapshot is queried
    /// explicitly afterwards so the client always sees the membership
    /// vector that includes its own arrival.
    async fn handle_login(
        &self,
        auth: &SessionAuth,
        to_client: &UnboundedSender<GatewayResponse>,
    ) -> Option<LoginState> {
        let response: Option<CharacterLoginResponse> = self
            .call(
                REQ_CHARACTER_LOGIN,
                &CharacterLoginRequest {
                    character_id: auth.character_id,
                },
            )
            .await;
        let response = match response {
            Some(response) if response.ok => response,
            _ => {
                let _ = to_client.send(GatewayResponse::Session(SessionMessageResponse::Login {
                    ok: false,
                    character_live_info: None,
                }));
                return None;
            }
        };

        let live = response.character_live_info.clone();
        let system_id = live
            .as_ref()
            .map(|l| l.system_id)
            .unwrap_or(parsec_common::SPAWN_SYSTEM_ID);

        // Character events.
        let character_topics: Option<CharacterTopicResponse> = self
            .call(
                REQ_CHARACTER_TOPIC,
                &CharacterTopicRequest {
                    character_id: auth.character_id,
                },
            )
            .await;
        if let Some(topics) = character_topics.and_then(|r| r.topics.filter(|_| r.ok)) {
            self.forward_subscription(&topics.subscribe_topic, to_client.clone(), |payload| {
                match decode::<CharacterLiveInfoMessage>(&payload) {
                    Ok(live) => Some(SessionMessageResponse::CharacterLiveInfo(live)),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed character event");
                        None
                    }
                }
            })
            .await;
        }

        // Membership vectors for the character's system.
        let system_topics: Option<SystemTopicResponse> = self
            .call(REQ_SYSTEM_TOPIC, &SystemTopicRequest { system_id })
            .await;
        let system_topics = system_topics.and_then(|r| r.topics.filter(|_| r.ok));
        if let Some(topics) = &system_topics {
            self.forward_subscription(&topics.subscribe_topic, to_client.clone(), |payload| {
                match decode::<SystemLiveInfoMessage>(&payload) {
                    Ok(live) => Some(SessionMessageResponse::SystemLiveInfo(live)),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed membership vector");
                        None
                    }
                }
            })
            .await;
        }

        // Chatter for the system, created lazily on our request.
        let chatter_topics: Option<SystemTopicResponse> = self
            .call(REQ_CHATTER_TOPIC, &SystemTopicRequest { system_id })
            .await;
        let chatter_topics = chatter_topics.and_then(|r| r.topics.filter(|_| r.ok));
        if let Some(topics) = &chatter_topics {
            self.forward_subscription(&topics.subscribe_topic, to_client.clone(), |payload| {
                match decode::<ChatterMessage>(&payload) {
                    Ok(message) => Some(SessionMessageResponse::Chatter(message)),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed chatter");
                        None
                    }
                }
            })
            .await;
        }

        let _ = to_client.send(GatewayResponse::Session(SessionMessageResponse::Login {
            ok: true,
            character_live_info: live,
        }));

        // Authoritative snapshot, so the arrival vector is never missed.
        if let Some(request_topic) = system_topics.as_ref().and_then(|t| t.request_topic.clone()) {
            let snapshot: Option<SystemLiveInfoResponse> = self
                .call(&request_topic, &SystemLiveInfoRequest { system_id })
                .await;
            if let Some(live) = snapshot.and_then(|r| r.system_live_info.filter(|_| r.ok)) {
                let _ = to_client.send(GatewayResponse::Session(
                    SessionMessageResponse::SystemLiveInfo(live),
                ));
            }
        }

        Some(LoginState {
            chatter_in: chatter_topics.map(|t| t.publish_topic),
        })
    }

    /// Relay a chatter frame for a logged-in, co-present client.
    async fn relay_chatter(&self, login_state: &Option<LoginState>, message: ChatterMessage) {
        let Some(chatter_in) = login_state.as_ref().and_then(|s| s.chatter_in.as_deref()) else {
            warn!(peer = %self.peer, "chatter before login, dropping");
            return;
        };
        if let Ok(payload) = encode(&message) {
            if let Err(e) = self.bus.publish(chatter_in, Bytes::from(payload)).await {
                warn!(error = %e, "could not relay chatter");
            }
        }
    }

    /// The client is gone (clean LOGOUT or a vanished stream): tear the
    /// character down, then the session. The session stop is also the
    /// fallback for the character teardown, so a half-failed sequence still
    /// converges.
    async fn teardown(&self, auth: &SessionAuth) {
        let logout: Option<CharacterLogoutResponse> = self
            .call(
                REQ_CHARACTER_LOGOUT,
                &CharacterLogoutRequest {
                    character_id: auth.character_id,
                },
            )
            .await;
        debug!(
            character_id = auth.character_id,
            ok = logout.map(|r| r.ok),
            "character logout"
        );

        let stop: Option<SessionStopResponse> = self
            .call(
                REQ_SESSION_STOP,
                &SessionStopRequest {
                    session_id: auth.session_id.clone(),
                },
            )
            .await;
        debug!(
            session_id = %auth.session_id,
            ok = stop.map(|r| r.ok),
            "session stop"
        );
    }

    /// Subscribe fan-out to `subject`, mapping each payload into a frame
    /// for the writer task.
    async fn forward_subscription<F>(
        &self,
        subject: &str,
        to_client: UnboundedSender<GatewayResponse>,
        wrap: F,
    ) where
        F: Fn(Bytes) -> Option<SessionMessageResponse> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |_subject, payload| {
            let forwarded = wrap(payload);
            let to_client = to_client.clone();
            Box::pin(async move {
                if let Some(frame) = forwarded {
                    let _ = to_client.send(GatewayResponse::Session(frame));
                }
                None
            })
        });
        match self
            .bus
            .subscribe(subject, traced("gateway_forward", handler), false)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(subject, "already forwarding"),
            Err(e) => warn!(subject, error = %e, "could not subscribe"),
        }
    }
}
