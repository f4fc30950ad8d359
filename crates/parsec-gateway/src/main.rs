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

use std::net::SocketAddr;

use clap::Parser;
use eyre::WrapErr;
use parsec_bus::NatsProvider;
use parsec_common::telemetry::init_tracing;
use parsec_gateway::Connection;
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Args {
    #[arg(
        long,
        value_name = "listen-address",
        help = "Listen address for client connections",
        default_value = "0.0.0.0"
    )]
    listen_address: String,

    #[arg(
        long,
        value_name = "listen-port",
        help = "Listen port for client connections",
        default_value = "7450"
    )]
    listen_port: u16,

    #[arg(
        long,
        value_name = "nats-endpoint",
        help = "Address of the NATS server carrying the service bus",
        env = "NATS_ENDPOINT",
        default_value = "nats://localhost:4222"
    )]
    nats_endpoint: String,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    debug: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), eyre::Error> {
    color_eyre::install()?;
    let args: Args = Args::parse();
    init_tracing(args.debug)?;

    let listen_addr = format!("{}:{}", args.listen_address, args.listen_port);
    let listen_sockaddr = listen_addr
        .parse::<SocketAddr>()
        .wrap_err("Unable to parse listen address")?;

    let provider = NatsProvider::connect(&args.nats_endpoint).await?;
    let listener = TcpListener::bind(listen_sockaddr)
        .await
        .wrap_err("Unable to bind client listener")?;
    info!(address = %listen_sockaddr, "gateway listening");

    let mut hup_signal = signal(SignalKind::hangup()).expect("Unable to register HUP handler");
    let mut stop_signal = signal(SignalKind::interrupt()).expect("Unable to register INT handler");

    loop {
        select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!(?peer, "accepted client connection");
                        let connection =
                            Connection::new(stream, provider.client(), peer.to_string());
                        tokio::spawn(async move {
                            if let Err(e) = connection.run().await {
                                warn!(?peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = hup_signal.recv() => {
                info!("HUP received, stopping...");
                break;
            }
            _ = stop_signal.recv() => {
                info!("INT received, stopping...");
                break;
            }
        }
    }

    provider.shutdown().await;
    info!("Done.");
    Ok(())
}
