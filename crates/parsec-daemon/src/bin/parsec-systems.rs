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

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::WrapErr;
use parsec_bus::{MessageBus, NatsBus};
use parsec_common::telemetry::init_tracing;
use parsec_daemon::args::{BusArgs, wait_for_shutdown};
use parsec_daemon::systems::SystemService;

#[derive(Parser, Debug)]
struct Args {
    #[command(flatten)]
    bus: BusArgs,

    #[arg(
        long,
        value_name = "universe",
        help = "Path to the universe graph catalog",
        default_value = "universe.json"
    )]
    universe: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), eyre::Error> {
    color_eyre::install()?;
    let args: Args = Args::parse();
    init_tracing(args.bus.debug)?;

    let universe =
        parsec_common::load_universe(&args.universe).wrap_err("Unable to load universe catalog")?;

    let bus: Arc<dyn MessageBus> = Arc::new(NatsBus::connect(&args.bus.nats_endpoint).await?);
    let service = SystemService::new(bus.clone(), universe);
    service.start().await?;

    wait_for_shutdown().await;

    service.stop().await;
    bus.stop().await;
    Ok(())
}
