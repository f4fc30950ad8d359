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

//! The parsec backplane services. Each service owns a set of instance
//! objects, indexes them under a single-writer discipline, and talks to its
//! peers exclusively through the message bus; no service calls another
//! directly.

pub mod args;
pub mod characters;
pub mod chatter;
pub mod service;
pub mod sessions;
pub mod systems;

use bytes::Bytes;
use tracing::error;

/// Encode a reply record, or log and return `None` so the requester sees a
/// timeout rather than a garbled payload.
pub(crate) fn encode_reply<T: bincode::Encode>(message: &T) -> Option<Bytes> {
    match parsec_rpc::encode(message) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            error!(error = %e, "could not encode reply");
            None
        }
    }
}
