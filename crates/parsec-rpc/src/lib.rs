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

//! The typed records exchanged over the message bus and the gateway stream,
//! together with the canonical bus subject names. Every payload on the bus is
//! a bincode (standard config) encoding of one of these records.

use thiserror::Error;

pub mod messages;
pub mod topics;

pub use messages::*;

/// Errors at the encoding layer.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("could not encode message: {0}")]
    CouldNotEncode(String),
    #[error("could not decode message: {0}")]
    CouldNotDecode(String),
}

/// Encode a wire record with the standard bincode configuration.
pub fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, RpcError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| RpcError::CouldNotEncode(e.to_string()))
}

/// Decode a wire record with the standard bincode configuration. Trailing
/// bytes are rejected: a frame holds exactly one record.
pub fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, RpcError> {
    let (value, consumed) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| RpcError::CouldNotDecode(e.to_string()))?;
    if consumed != bytes.len() {
        return Err(RpcError::CouldNotDecode(format!(
            "{} trailing bytes after record",
            bytes.len() - consumed
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn static_info_round_trips_byte_equal() {
        // Re-serialising a decoded record must yield the identical bytes:
        // clients cache and replay these records.
        let info = SystemStaticInfoMessage {
            system_id: 1,
            name: "Alpha".to_string(),
            neighbours: vec![2, 3],
        };
        let bytes = encode(&info).unwrap();
        let decoded: SystemStaticInfoMessage = decode(&bytes).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn session_events_round_trip() {
        let event = SessionMessageResponse::Chatter(ChatterMessage {
            character_id: 1001,
            system_id: 1,
            text: "hi".to_string(),
        });
        let bytes = encode(&event).unwrap();
        assert_eq!(decode::<SessionMessageResponse>(&bytes).unwrap(), event);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&SessionStopRequest {
            session_id: "abc".to_string(),
        })
        .unwrap();
        bytes.push(0);
        assert!(decode::<SessionStopRequest>(&bytes).is_err());
    }

    #[test]
    fn wrong_record_type_fails_to_decode() {
        let bytes = encode(&UniverseRequest {}).unwrap();
        assert!(decode::<SessionStartResponse>(&bytes).is_err());
    }
}
