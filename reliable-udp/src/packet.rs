//! Wire-format definitions for protocol packets.
//!
//! Every datagram exchanged between the endpoints is a [`Packet`].  This
//! module is responsible for:
//! - Defining the on-wire layout (header fields, flags, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed or inconsistent input.
//! - The header predicates both endpoints use to classify inbound packets.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! One JSON object per datagram:
//!
//! ```text
//! {
//!   "header": { "seqNum": u32, "ackNum": u32, "dataLen": u32, "flags": u8 },
//!   "data":   string
//! }
//! ```
//!
//! Key order is not significant; the decoder accepts any ordering.  `dataLen`
//! is the byte length of `data` once UTF-8 encoded.

use serde::{Deserialize, Serialize};

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Cumulative acknowledgement.
    pub const ACK: u8 = 0b0000_0001;
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u8 = 0b0000_0010;
    /// Finish: the sender has no more data to send.
    pub const FIN: u8 = 0b0000_0100;
    /// Application payload.
    pub const DATA: u8 = 0b0000_1000;
}

/// Fixed set of protocol header fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Sequence number of the first payload byte in this packet.
    pub seq_num: u32,
    /// Cumulative count of peer bytes consumed by the sender of this packet.
    pub ack_num: u32,
    /// Length of the payload in bytes.
    ///
    /// Computed by [`Packet::new`]; validated against the payload by
    /// [`Packet::decode`].
    pub data_len: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
}

/// A complete protocol datagram: header + payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub header: Header,
    /// Payload carried as text on the wire.
    pub data: String,
}

impl Packet {
    /// Frame `payload` into a packet.
    ///
    /// Bytes that are not valid UTF-8 are replaced with U+FFFD, since the
    /// wire payload is a string.  `data_len` always reflects the framed
    /// payload, so it may exceed `payload.len()` when replacement happened.
    pub fn new(ack: u32, seq: u32, flags: u8, payload: &[u8]) -> Self {
        let data = String::from_utf8_lossy(payload).into_owned();
        Self {
            header: Header {
                seq_num: seq,
                ack_num: ack,
                data_len: data.len() as u32,
                flags,
            },
            data,
        }
    }

    /// Payload bytes as they travel on the wire.
    pub fn payload(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Sequence number the peer acknowledges once this packet is accepted.
    pub fn next_seq(&self) -> u32 {
        self.header.seq_num.wrapping_add(self.header.data_len)
    }

    /// Serialise this packet into a newly allocated byte vector.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(PacketError::Encode)
    }

    /// Parse a [`Packet`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is not a JSON object of the packet shape, or
    /// - the `dataLen` field disagrees with the decoded payload length.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let packet: Packet = serde_json::from_slice(buf).map_err(PacketError::Malformed)?;
        if packet.header.data_len as usize != packet.data.len() {
            return Err(PacketError::LengthMismatch {
                declared: packet.header.data_len,
                actual: packet.data.len(),
            });
        }
        Ok(packet)
    }
}

/// Frame and serialise in one step.
pub fn encode(ack: u32, seq: u32, flags: u8, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    Packet::new(ack, seq, flags, payload).encode()
}

/// `true` iff the header carries exactly `expected_flags` and acknowledges
/// exactly `expected_ack`.
pub fn is_valid(header: &Header, expected_flags: u8, expected_ack: u32) -> bool {
    header.flags == expected_flags && header.ack_num == expected_ack
}

/// `true` for a handshake packet.
pub fn is_syn(header: &Header) -> bool {
    header.flags == flags::SYN
}

/// Length of the longest prefix of `buf` that does not end inside a
/// multi-byte UTF-8 sequence.
///
/// Bytes past the returned index belong to a character whose remaining bytes
/// have not been read yet.  Invalid sequences are not held back; they are
/// left for lossy replacement in [`Packet::new`].
pub fn complete_utf8_prefix(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(4) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue; // continuation byte
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if back < width { len - back } else { len };
    }
    len
}

/// Errors that can arise when encoding or parsing a datagram.
#[derive(Debug)]
pub enum PacketError {
    /// Datagram is not a JSON packet object.
    Malformed(serde_json::Error),
    /// `dataLen` field does not match the decoded payload.
    LengthMismatch { declared: u32, actual: usize },
    /// Serialisation failed.
    Encode(serde_json::Error),
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::Malformed(e) => write!(f, "malformed packet: {e}"),
            PacketError::LengthMismatch { declared, actual } => {
                write!(f, "dataLen {declared} does not match payload length {actual}")
            }
            PacketError::Encode(e) => write!(f, "packet encoding failed: {e}"),
        }
    }
}

impl std::error::Error for PacketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PacketError::Malformed(e) | PacketError::Encode(e) => Some(e),
            PacketError::LengthMismatch { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u32, ack: u32, flags: u8) -> Header {
        Header {
            seq_num: seq,
            ack_num: ack,
            data_len: 0,
            flags,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let bytes = encode(7, 42, flags::DATA, b"hello").unwrap();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.header.seq_num, 42);
        assert_eq!(decoded.header.ack_num, 7);
        assert_eq!(decoded.header.flags, flags::DATA);
        assert_eq!(decoded.header.data_len, 5);
        assert_eq!(decoded.payload(), b"hello");
    }

    #[test]
    fn empty_payload_roundtrip() {
        let decoded = Packet::decode(&encode(0, 1000, flags::SYN, b"").unwrap()).unwrap();
        assert_eq!(decoded.payload(), b"");
        assert_eq!(decoded.header.data_len, 0);
        assert!(is_syn(&decoded.header));
    }

    #[test]
    fn wire_uses_camel_case_keys() {
        let bytes = encode(1, 2, flags::ACK, b"x").unwrap();
        let text = String::from_utf8(bytes).unwrap();
        for key in ["\"header\"", "\"seqNum\"", "\"ackNum\"", "\"dataLen\"", "\"flags\"", "\"data\""] {
            assert!(text.contains(key), "missing {key} in {text}");
        }
    }

    #[test]
    fn decode_tolerates_any_key_order() {
        let raw = br#"{"data":"abc","header":{"flags":8,"dataLen":3,"ackNum":0,"seqNum":9}}"#;
        let decoded = Packet::decode(raw).unwrap();
        assert_eq!(decoded.header.seq_num, 9);
        assert_eq!(decoded.header.flags, flags::DATA);
        assert_eq!(decoded.data, "abc");
    }

    #[test]
    fn decode_garbage_returns_error() {
        assert!(matches!(
            Packet::decode(b"not json"),
            Err(PacketError::Malformed(_))
        ));
        assert!(matches!(Packet::decode(&[]), Err(PacketError::Malformed(_))));
    }

    #[test]
    fn decode_missing_header_returns_error() {
        assert!(matches!(
            Packet::decode(br#"{"data":"abc"}"#),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn decode_truncated_returns_error() {
        let mut bytes = encode(0, 0, flags::DATA, b"data").unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let raw = br#"{"header":{"seqNum":0,"ackNum":0,"dataLen":10,"flags":8},"data":"abc"}"#;
        assert!(matches!(
            Packet::decode(raw),
            Err(PacketError::LengthMismatch {
                declared: 10,
                actual: 3
            })
        ));
    }

    #[test]
    fn data_len_counts_utf8_bytes() {
        let pkt = Packet::new(0, 0, flags::DATA, "héllo".as_bytes());
        assert_eq!(pkt.header.data_len, 6);
        assert_eq!(pkt.next_seq(), 6);
    }

    #[test]
    fn invalid_utf8_is_replaced_and_length_follows() {
        let pkt = Packet::new(0, 0, flags::DATA, &[b'a', 0xFF, b'b']);
        assert_eq!(pkt.data, "a\u{FFFD}b");
        assert_eq!(pkt.header.data_len as usize, pkt.data.len());
        assert!(Packet::decode(&pkt.encode().unwrap()).is_ok());
    }

    #[test]
    fn next_seq_wraps() {
        let pkt = Packet::new(0, u32::MAX - 1, flags::DATA, b"abcd");
        assert_eq!(pkt.next_seq(), 2);
    }

    #[test]
    fn is_valid_requires_both_fields() {
        let h = header(0, 5, flags::ACK);
        assert!(is_valid(&h, flags::ACK, 5));
        assert!(!is_valid(&h, flags::ACK, 6));
        assert!(!is_valid(&h, flags::DATA, 5));
        assert!(!is_valid(&h, flags::SYN, 4));
    }

    #[test]
    fn is_syn_is_exact() {
        assert!(is_syn(&header(0, 0, flags::SYN)));
        assert!(!is_syn(&header(0, 0, flags::SYN | flags::ACK)));
        assert!(!is_syn(&header(0, 0, flags::DATA)));
    }

    #[test]
    fn utf8_prefix_holds_back_split_character() {
        let bytes = "aé".as_bytes(); // 'é' is two bytes
        assert_eq!(complete_utf8_prefix(bytes), 3);
        assert_eq!(complete_utf8_prefix(&bytes[..2]), 1);

        let euro = "€".as_bytes(); // three bytes
        assert_eq!(complete_utf8_prefix(&euro[..1]), 0);
        assert_eq!(complete_utf8_prefix(&euro[..2]), 0);
        assert_eq!(complete_utf8_prefix(euro), 3);
    }

    #[test]
    fn utf8_prefix_passes_ascii_and_invalid_bytes() {
        assert_eq!(complete_utf8_prefix(b""), 0);
        assert_eq!(complete_utf8_prefix(b"plain"), 5);
        assert_eq!(complete_utf8_prefix(&[b'a', 0xFF]), 2);
        assert_eq!(complete_utf8_prefix(&[0x80, 0x80, 0x80, 0x80]), 4);
    }
}
