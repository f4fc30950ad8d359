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

use std::time::SystemTime;

use bincode::{Decode, Encode};
use parsec_common::{CharacterId, SystemId};

/// The three bus subjects an instance exposes, named from the consumer's
/// point of view: `subscribe_topic` is where the instance publishes,
/// `publish_topic` is where it listens.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct TopicSet {
    pub subscribe_topic: String,
    pub publish_topic: String,
    pub request_topic: Option<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Encode, Decode)]
#[repr(u8)]
pub enum ServiceKind {
    Session,
    Character,
    System,
    Chatter,
    Gateway,
}

/// Informational lifecycle beacon, published fan-out on
/// `PUB.SERVICE.START` / `PUB.SERVICE.STOP`.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct ServiceBeacon {
    pub kind: ServiceKind,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct ChatterMessage {
    pub character_id: CharacterId,
    pub system_id: SystemId,
    pub text: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterStaticInfoMessage {
    pub character_id: CharacterId,
    pub name: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterLiveInfoMessage {
    pub character_id: CharacterId,
    pub system_id: SystemId,
    pub active: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SystemStaticInfoMessage {
    pub system_id: SystemId,
    pub name: String,
    /// Sorted ascending, so equal graphs encode to equal bytes.
    pub neighbours: Vec<SystemId>,
}

/// The full membership vector of a system, republished on every change.
/// Subscribers compute arrive/depart by diffing against their last seen set.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SystemLiveInfoMessage {
    pub system_id: SystemId,
    pub character_ids: Vec<CharacterId>,
}

// Session lifecycle, `REQ.SESSION.*`.

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SessionStartRequest {
    pub username: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SessionStartResponse {
    pub ok: bool,
    pub character_id: Option<CharacterId>,
    pub session_id: Option<String>,
    pub session_topics: Option<TopicSet>,
}

impl SessionStartResponse {
    pub fn failed() -> Self {
        Self {
            ok: false,
            character_id: None,
            session_id: None,
            session_topics: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SessionStopRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SessionStopResponse {
    pub ok: bool,
}

// Character lifecycle and directory, `REQ.CHARACTER.*`.

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterStaticInfoRequest {
    pub character_id: CharacterId,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterStaticInfoResponse {
    pub ok: bool,
    pub character_static_info: Option<CharacterStaticInfoMessage>,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterLiveInfoRequest {
    pub character_id: CharacterId,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterLiveInfoResponse {
    pub ok: bool,
    pub character_live_info: Option<CharacterLiveInfoMessage>,
    pub topics: Option<TopicSet>,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterLoginRequest {
    pub character_id: CharacterId,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterLoginResponse {
    pub ok: bool,
    pub character_id: CharacterId,
    pub character_live_info: Option<CharacterLiveInfoMessage>,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterLogoutRequest {
    pub character_id: CharacterId,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterLogoutResponse {
    pub ok: bool,
    pub character_id: CharacterId,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterTopicRequest {
    pub character_id: CharacterId,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct CharacterTopicResponse {
    pub ok: bool,
    pub character_id: CharacterId,
    pub topics: Option<TopicSet>,
}

// System directory and presence, `REQ.SYSTEM.*` / `REQ.UNIVERSE.STATIC`.

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SystemStaticInfoRequest {
    pub system_id: SystemId,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SystemStaticInfoResponse {
    pub ok: bool,
    pub system_id: SystemId,
    pub system_static_info: Option<SystemStaticInfoMessage>,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SystemLiveInfoRequest {
    pub system_id: SystemId,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SystemLiveInfoResponse {
    pub ok: bool,
    pub system_id: SystemId,
    pub system_live_info: Option<SystemLiveInfoMessage>,
}

/// Topic lookup for a system (`REQ.SYSTEM.TOPIC`) or its chatter relay
/// (`REQ.CHATTER.TOPIC`); both answer with the same shape.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SystemTopicRequest {
    pub system_id: SystemId,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SystemTopicResponse {
    pub ok: bool,
    pub system_id: SystemId,
    pub topics: Option<TopicSet>,
}

/// Presence delta, published on `PUB.SYSTEM.IN.{sid}`. Safe to replay:
/// the receiving system treats a no-op delta as exactly that.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct SystemSetLiveCharacterRequest {
    pub character_id: CharacterId,
    pub system_id: SystemId,
    pub present: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct UniverseRequest {}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct UniverseResponse {
    pub ok: bool,
    pub systems: Vec<SystemStaticInfoMessage>,
}

// The client stream.

/// A frame from the client, relayed by the gateway onto the session's
/// in-topic or translated into the matching request/reply call.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub enum SessionMessageRequest {
    Login,
    Logout,
    Chatter(ChatterMessage),
    Pong(u64),
}

/// A frame to the client: session lifecycle, login results, and the wrapped
/// out-topic payloads the gateway forwards.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub enum SessionMessageResponse {
    Start,
    Stop,
    Pong(u64),
    Login {
        ok: bool,
        character_live_info: Option<CharacterLiveInfoMessage>,
    },
    CharacterStaticInfo(CharacterStaticInfoMessage),
    CharacterLiveInfo(CharacterLiveInfoMessage),
    SystemLiveInfo(SystemLiveInfoMessage),
    Chatter(ChatterMessage),
}

// The gateway stream, length-prefixed frames of these two enums.

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub enum GatewayRequest {
    StartSession(SessionStartRequest),
    GetUniverse(UniverseRequest),
    /// Binds this connection to a session returned by `StartSession` and
    /// switches the connection into streaming mode.
    Attach {
        session_id: String,
    },
    Session(SessionMessageRequest),
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub enum GatewayResponse {
    SessionStarted(SessionStartResponse),
    Universe(UniverseResponse),
    Session(SessionMessageResponse),
}
