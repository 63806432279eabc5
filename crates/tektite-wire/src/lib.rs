//! # tektite-wire: Message sets for `Tektite`
//!
//! Every message exchanged by the consensus module belongs to one of five
//! closed sets, each an exhaustively-matched enum:
//!
//! - [`PeerMessage`] — member-status control traffic among cluster members
//! - [`LogRecord`] — framed records of the replicated log stream
//! - [`IngressFrame`] / [`EgressEvent`] — the client-facing protocol
//! - [`ToServiceMessage`] / [`FromServiceMessage`] — the duplex control link
//!   to the hosted state-machine container
//! - [`SnapshotRecord`] — the consensus module's own snapshot stream
//!
//! Encoding is canonical `postcard` over `serde` derives. The wire format is
//! internal to a cluster; cross-version compatibility is carried by the
//! client protocol's semantic version field, not by the codec.

mod ingress;
mod log;
mod peer;
mod service;
mod snapshot;

pub use ingress::*;
pub use log::*;
pub use peer::*;
pub use service::*;
pub use snapshot::*;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

// ============================================================================
// Codec
// ============================================================================

/// Errors from encoding or decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(postcard::Error),

    #[error("decode failed: {0}")]
    Decode(postcard::Error),
}

/// Encodes a message to its canonical byte form.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, WireError> {
    postcard::to_allocvec(message)
        .map(Bytes::from)
        .map_err(WireError::Encode)
}

/// Decodes a message from its canonical byte form.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    postcard::from_bytes(bytes).map_err(WireError::Decode)
}

/// Major version of the client ingress protocol.
///
/// A connect request whose major version differs is rejected with
/// [`EventCode::InvalidVersion`].
pub const PROTOCOL_MAJOR_VERSION: u16 = 1;

/// Minor version of the client ingress protocol.
pub const PROTOCOL_MINOR_VERSION: u16 = 0;

/// Packs a protocol version as carried on the wire.
pub fn semantic_version(major: u16, minor: u16) -> u32 {
    (u32::from(major) << 16) | u32::from(minor)
}

/// Extracts the major component of a packed protocol version.
pub fn version_major(version: u32) -> u16 {
    (version >> 16) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use tektite_types::{LeadershipTermId, LogPosition, MemberId};

    #[test]
    fn peer_message_codec_round_trip() {
        let message = PeerMessage::CanvassPosition {
            log_leadership_term_id: LeadershipTermId::new(3),
            log_position: LogPosition::new(4096),
            leadership_term_id: LeadershipTermId::new(3),
            follower_member_id: MemberId::new(2),
        };

        let bytes = encode(&message).expect("encode");
        let decoded: PeerMessage = decode(&bytes).expect("decode");
        assert_eq!(message, decoded);
    }

    #[test]
    fn version_packing() {
        let v = semantic_version(PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION);
        assert_eq!(version_major(v), PROTOCOL_MAJOR_VERSION);
        assert_eq!(version_major(semantic_version(7, 2)), 7);
    }
}
