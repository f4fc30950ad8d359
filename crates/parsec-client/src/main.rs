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

//! Demo client: starts a session, attaches, logs the character in, then
//! narrates arrivals, departures and chatter in its system, while nattering
//! on a timer so co-present clients have something to read.

use std::collections::BTreeSet;

use bytes::Bytes;
use clap::Parser;
use eyre::{WrapErr, bail};
use futures_util::{SinkExt, StreamExt};
use parsec_common::telemetry::init_tracing;
use parsec_common::{CharacterId, SystemId};
use parsec_rpc::{
    ChatterMessage, GatewayRequest, GatewayResponse, SessionMessageRequest, SessionMessageResponse,
    SessionStartRequest, UniverseRequest, decode, encode,
};
use tokio::net::TcpStream;
use tokio::select;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
struct Args {
    #[arg(help = "Account username to play as", default_value = "userone")]
    username: String,

    #[arg(
        long,
        value_name = "gateway",
        help = "Gateway address to connect to",
        default_value = "127.0.0.1:7450"
    )]
    gateway: String,

    #[arg(
        long,
        value_name = "chatter-interval",
        help = "Seconds between chatter messages",
        default_value = "25"
    )]
    chatter_interval: u64,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    debug: bool,
}

/// What this client knows about its own character.
struct SessionState {
    character_id: CharacterId,
    system_id: SystemId,
    active: bool,
    locals: BTreeSet<CharacterId>,
}

impl SessionState {
    fn new(character_id: CharacterId) -> Self {
        Self {
            character_id,
            system_id: 0,
            active: false,
            locals: BTreeSet::new(),
        }
    }
}

type ClientStream = Framed<TcpStream, LengthDelimitedCodec>;

async fn send(framed: &mut ClientStream, request: &GatewayRequest) -> Result<(), eyre::Error> {
    let payload = encode(request).wrap_err("could not encode frame")?;
    framed
        .send(Bytes::from(payload))
        .await
        .wrap_err("could not write frame")?;
    Ok(())
}

async fn next_response(framed: &mut ClientStream) -> Result<GatewayResponse, eyre::Error> {
    let Some(frame) = framed.next().await else {
        bail!("gateway closed the stream");
    };
    let frame = frame.wrap_err("could not read frame")?;
    decode(&frame).wrap_err("could not decode frame")
}

/// Diff the membership vector against the last seen set.
fn narrate_membership(state: &mut SessionState, members: Vec<CharacterId>) {
    let members: BTreeSet<CharacterId> = members.into_iter().collect();
    if members == state.locals {
        return;
    }
    let arrived: Vec<_> = members.difference(&state.locals).copied().collect();
    let departed: Vec<_> = state.locals.difference(&members).copied().collect();
    info!(
        system_id = state.system_id,
        ?arrived,
        ?departed,
        "local presence changed"
    );
    state.locals = members;
}

fn handle_event(event: SessionMessageResponse, state: &mut SessionState) -> bool {
    match event {
        SessionMessageResponse::Start => true,
        SessionMessageResponse::Stop => {
            info!("session stopped by the server");
            false
        }
        SessionMessageResponse::Pong(counter) => {
            debug!(counter, "pong");
            true
        }
        SessionMessageResponse::Login {
            ok,
            character_live_info,
        } => {
            if let (true, Some(live)) = (ok, character_live_info) {
                state.system_id = live.system_id;
                state.active = live.active;
                info!(
                    character_id = state.character_id,
                    system_id = state.system_id,
                    "logged in"
                );
            } else {
                warn!("login failed");
                return false;
            }
            true
        }
        SessionMessageResponse::CharacterStaticInfo(static_info) => {
            info!(character_id = static_info.character_id, name = %static_info.name, "character");
            true
        }
        SessionMessageResponse::CharacterLiveInfo(live) => {
            if live.character_id == state.character_id {
                state.system_id = live.system_id;
                state.active = live.active;
                info!(active = live.active, system_id = live.system_id, "own state");
            } else {
                info!(
                    character_id = live.character_id,
                    active = live.active,
                    "character state"
                );
            }
            true
        }
        SessionMessageResponse::SystemLiveInfo(live) => {
            narrate_membership(state, live.character_ids);
            true
        }
        SessionMessageResponse::Chatter(chatter) => {
            if chatter.character_id != state.character_id {
                info!(
                    system_id = chatter.system_id,
                    character_id = chatter.character_id,
                    text = %chatter.text,
                    "chatter"
                );
            }
            true
        }
    }
}

async fn run_session(
    framed: &mut ClientStream,
    state: &mut SessionState,
    chatter_interval: u64,
) -> Result<(), eyre::Error> {
    send(framed, &GatewayRequest::Session(SessionMessageRequest::Login)).await?;

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(chatter_interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut counter = 0u64;

    loop {
        select! {
            frame = framed.next() => {
                let Some(frame) = frame else {
                    info!("gateway closed the stream");
                    return Ok(());
                };
                let frame = frame.wrap_err("could not read frame")?;
                let event = match decode::<GatewayResponse>(&frame) {
                    Ok(GatewayResponse::Session(event)) => event,
                    Ok(other) => {
                        debug!(?other, "ignoring non-session frame");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping malformed frame");
                        continue;
                    }
                };
                if !handle_event(event, state) {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                if !state.active {
                    continue;
                }
                counter += 1;
                let chatter = ChatterMessage {
                    character_id: state.character_id,
                    system_id: state.system_id,
                    text: format!("{} says #{counter}", state.character_id),
                };
                send(framed, &GatewayRequest::Session(SessionMessageRequest::Chatter(chatter))).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("logging out");
                send(framed, &GatewayRequest::Session(SessionMessageRequest::Logout)).await?;
                return Ok(());
            }
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), eyre::Error> {
    color_eyre::install()?;
    let args: Args = Args::parse();
    init_tracing(args.debug)?;

    let stream = TcpStream::connect(&args.gateway)
        .await
        .wrap_err("Unable to connect to gateway")?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    send(
        &mut framed,
        &GatewayRequest::StartSession(SessionStartRequest {
            username: args.username.clone(),
        }),
    )
    .await?;
    let GatewayResponse::SessionStarted(session) = next_response(&mut framed).await? else {
        bail!("unexpected reply to StartSession");
    };
    if !session.ok {
        bail!("no session for username {}", args.username);
    }
    let character_id = session.character_id.expect("ok response without character");
    let session_id = session.session_id.expect("ok response without session id");
    info!(username = %args.username, character_id, session_id = %session_id, "session started");

    send(&mut framed, &GatewayRequest::GetUniverse(UniverseRequest {})).await?;
    let GatewayResponse::Universe(universe) = next_response(&mut framed).await? else {
        bail!("unexpected reply to GetUniverse");
    };
    for system in &universe.systems {
        info!(
            system_id = system.system_id,
            name = %system.name,
            neighbours = ?system.neighbours,
            "system"
        );
    }

    send(&mut framed, &GatewayRequest::Attach { session_id }).await?;

    let mut state = SessionState::new(character_id);
    run_session(&mut framed, &mut state, args.chatter_interval).await
}
