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

//! Arguments shared by every service binary.

use clap::Parser;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

#[derive(Parser, Debug)]
pub struct BusArgs {
    #[arg(
        long,
        value_name = "nats-endpoint",
        help = "Address of the NATS server carrying the service bus",
        env = "NATS_ENDPOINT",
        default_value = "nats://localhost:4222"
    )]
    pub nats_endpoint: String,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,
}

/// Block until the process is told to stop.
pub async fn wait_for_shutdown() {
    let mut hup_signal = signal(SignalKind::hangup()).expect("Unable to register HUP handler");
    let mut stop_signal = signal(SignalKind::interrupt()).expect("Unable to register INT handler");
    let mut term_signal = signal(SignalKind::terminate()).expect("Unable to register TERM handler");

    select! {
        _ = hup_signal.recv() => {
            info!("HUP received, stopping...");
        },
        _ = stop_signal.recv() => {
            info!("INT received, stopping...");
        },
        _ = term_signal.recv() => {
            info!("TERM received, stopping...");
        }
    }
}
