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

//! Lifecycle beacons shared by every service: an informational
//! `PUB.SERVICE.START` / `PUB.SERVICE.STOP` announcement, plus a fan-out
//! subscription logging peer startups.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parsec_bus::{BusError, Handler, MessageBus, traced};
use parsec_rpc::topics::{PUB_SERVICE_START, PUB_SERVICE_STOP};
use parsec_rpc::{ServiceBeacon, ServiceKind, decode};
use tracing::{info, warn};

use crate::encode_reply;

pub struct ServiceManager {
    bus: Arc<dyn MessageBus>,
    kind: ServiceKind,
}

impl ServiceManager {
    pub fn new(bus: Arc<dyn MessageBus>, kind: ServiceKind) -> Self {
        Self { bus, kind }
    }

    fn beacon(&self) -> Option<Bytes> {
        encode_reply(&ServiceBeacon {
            kind: self.kind,
            timestamp: SystemTime::now(),
        })
    }

    pub async fn start(&self) -> Result<(), BusError> {
        if let Some(beacon) = self.beacon() {
            self.bus.publish(PUB_SERVICE_START, beacon).await?;
        }

        let handler: Handler = Arc::new(move |_subject, payload| {
            Box::pin(async move {
                match decode::<ServiceBeacon>(&payload) {
                    Ok(beacon) => info!(kind = ?beacon.kind, "peer service started"),
                    Err(e) => warn!(error = %e, "dropping malformed service beacon"),
                }
                None
            })
        });
        self.bus
            .subscribe(PUB_SERVICE_START, traced("service_beacon", handler), false)
            .await?;
        Ok(())
    }

    pub async fn stop(&self) {
        if let Err(e) = self.bus.unsubscribe(PUB_SERVICE_START).await {
            warn!(error = %e, "could not unsubscribe service beacon");
        }
        if let Some(beacon) = self.beacon() {
            if let Err(e) = self.bus.publish(PUB_SERVICE_STOP, beacon).await {
                warn!(error = %e, "could not publish stop beacon");
            }
        }
    }
}
