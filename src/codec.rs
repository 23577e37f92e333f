//! The single encode/decode boundary for everything that leaves a process.
//!
//! Stream protocols (mesh, registry, client, chatroom status, chatroom
//! members) carry frames of an 8-byte big-endian length followed by the
//! MessagePack encoding of a serde enum. Multicast datagrams carry a fixed
//! application tag followed by the MessagePack body; datagrams without the
//! tag belong to somebody else sharing the group and are dropped.
//!
//! Since every field is length-delimited by MessagePack itself, user content
//! (names, passwords, message bodies) may contain any byte sequence.

use serde::de::DeserializeOwned;
use serde::Serialize;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use crate::utils::RoomkeeperError;

/// Length of the frame header carrying the body length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// Application tag prefixing every multicast datagram.
pub const GROUP_TAG: &[u8] = b"roomkeeper/1";

/// Encodes an object into a complete length-prefixed stream frame.
pub fn encode_frame<T: Serialize>(obj: &T) -> Result<Vec<u8>, RoomkeeperError> {
    let body = encode_to_vec(obj)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RoomkeeperError(format!(
            "frame body of {} bytes exceeds limit",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads the body length out of a frame header. Fails if fewer than
/// `FRAME_HEADER_LEN` bytes are given or the length exceeds `MAX_FRAME_LEN`.
pub fn frame_body_len(header: &[u8]) -> Result<usize, RoomkeeperError> {
    let bytes: [u8; FRAME_HEADER_LEN] = header
        .get(..FRAME_HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| RoomkeeperError::msg("short frame header"))?;
    let body_len = u64::from_be_bytes(bytes);
    match usize::try_from(body_len) {
        Ok(len) if len <= MAX_FRAME_LEN => Ok(len),
        _ => Err(RoomkeeperError(format!(
            "frame body of {} bytes exceeds limit",
            body_len
        ))),
    }
}

/// Decodes a frame body (the bytes after the header).
pub fn decode_body<T: DeserializeOwned>(
    body: &[u8],
) -> Result<T, RoomkeeperError> {
    Ok(decode_from_slice(body)?)
}

/// Encodes an object into a tagged multicast datagram.
pub fn encode_datagram<T: Serialize>(
    obj: &T,
) -> Result<Vec<u8>, RoomkeeperError> {
    let body = encode_to_vec(obj)?;
    let mut datagram = Vec::with_capacity(GROUP_TAG.len() + body.len());
    datagram.extend_from_slice(GROUP_TAG);
    datagram.extend_from_slice(&body);
    Ok(datagram)
}

/// Decodes a tagged multicast datagram. Returns `Ok(None)` if the datagram
/// does not carry our application tag.
pub fn decode_datagram<T: DeserializeOwned>(
    datagram: &[u8],
) -> Result<Option<T>, RoomkeeperError> {
    match datagram.strip_prefix(GROUP_TAG) {
        Some(body) => Ok(Some(decode_from_slice(body)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod codec_tests {
    use super::*;
    use crate::directory::Transaction;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    enum TestMsg {
        Say { who: String, body: String },
        Quit,
    }

    #[test]
    fn frame_header_matches_body() -> Result<(), RoomkeeperError> {
        let frame = encode_frame(&TestMsg::Quit)?;
        let body_len = frame_body_len(&frame)?;
        assert_eq!(body_len + FRAME_HEADER_LEN, frame.len());
        assert_eq!(
            decode_body::<TestMsg>(&frame[FRAME_HEADER_LEN..])?,
            TestMsg::Quit
        );
        Ok(())
    }

    #[test]
    fn short_header() {
        assert!(frame_body_len(&[0, 0, 1]).is_err());
    }

    #[test]
    fn oversized_header_rejected() -> Result<(), RoomkeeperError> {
        assert!(frame_body_len(&(1u64 << 40).to_be_bytes()).is_err());
        assert!(frame_body_len(&u64::MAX.to_be_bytes()).is_err());
        let at_limit = (MAX_FRAME_LEN as u64).to_be_bytes();
        assert_eq!(frame_body_len(&at_limit)?, MAX_FRAME_LEN);
        Ok(())
    }

    #[test]
    fn separator_lookalikes_survive() -> Result<(), RoomkeeperError> {
        let txn = Transaction::MessageSent {
            chat: "gen@#@eral".into(),
            sender: "al&%%ice".into(),
            body: "line one\nline two @#@ &%% chatkey125$@newHost@$".into(),
            msg_id: 42,
        };
        let frame = encode_frame(&txn)?;
        let decoded: Transaction = decode_body(&frame[FRAME_HEADER_LEN..])?;
        assert_eq!(decoded, txn);
        Ok(())
    }

    #[test]
    fn datagram_tagging() -> Result<(), RoomkeeperError> {
        let msg = TestMsg::Say {
            who: "bob".into(),
            body: "".into(),
        };
        let datagram = encode_datagram(&msg)?;
        assert!(datagram.starts_with(GROUP_TAG));
        assert_eq!(decode_datagram::<TestMsg>(&datagram)?, Some(msg));
        assert_eq!(decode_datagram::<TestMsg>(b"someone else's packet")?, None);
        Ok(())
    }

    #[test]
    fn corrupt_body_is_error() {
        let mut datagram = GROUP_TAG.to_vec();
        datagram.extend_from_slice(&[0xc1, 0xc1]);
        assert!(decode_datagram::<TestMsg>(&datagram).is_err());
    }
}
