//! Teltonika codec stack (§4.1, §4.3): CRC-16, the shared AVL record shapes,
//! and the per-codec decoders dispatched by codec ID byte.

pub mod avl;
pub mod codec7;
pub mod codec12;
pub mod frame;
pub mod reader;

use avl::AvlRecord;

/// IBM/CRC16 algorithm, polynomial 0xA001, initial value 0, LSB-first.
/// Computed over the `L` payload bytes (codec ID through the trailing
/// record count, exclusive of the CRC field itself).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            let carry = crc & 1;
            crc >>= 1;
            if carry != 0 {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

/// Which codec produced a decoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Codec7,
    Codec8,
    Codec8Ext,
    Codec12,
    Codec16,
}

impl CodecKind {
    pub fn id(self) -> u8 {
        match self {
            CodecKind::Codec7 => 0x07,
            CodecKind::Codec8 => 0x08,
            CodecKind::Codec8Ext => 0x8E,
            CodecKind::Codec12 => 0x0C,
            CodecKind::Codec16 => 0x10,
        }
    }
}

/// The decoded body of a frame, once its codec ID byte has been consumed.
#[derive(Debug, Clone)]
pub enum Payload {
    Avl(Vec<AvlRecord>),
    Command(codec12::Codec12Frame),
}

#[derive(Debug, Clone)]
pub struct DecodedPayload {
    pub codec: CodecKind,
    pub payload: Payload,
}

/// Decodes a frame's payload bytes (as handed back by [`frame::FrameSplitter`],
/// i.e. codec ID through the trailing record/quantity count, CRC already
/// stripped and verified by the splitter).
pub fn decode_payload(data: &[u8]) -> Result<DecodedPayload, crate::error::DecodeError> {
    use crate::error::DecodeError;

    let (&codec_id, rest) = data.split_first().ok_or(DecodeError::Truncated { needed: 1 })?;

    match codec_id {
        0x07 => {
            let (_, records) = codec7::decode_records(rest)?;
            Ok(DecodedPayload {
                codec: CodecKind::Codec7,
                payload: Payload::Avl(records),
            })
        }
        0x0C => {
            let (_, frame) = codec12::decode(rest)?;
            Ok(DecodedPayload {
                codec: CodecKind::Codec12,
                payload: Payload::Command(frame),
            })
        }
        other => {
            let codec = avl::AvlCodec::try_from(other)?;
            let (_, records) = avl::decode_records(codec, rest)?;
            let kind = match codec {
                avl::AvlCodec::Codec8 => CodecKind::Codec8,
                avl::AvlCodec::Codec8Ext => CodecKind::Codec8Ext,
                avl::AvlCodec::Codec16 => CodecKind::Codec16,
            };
            Ok(DecodedPayload {
                codec: kind,
                payload: Payload::Avl(records),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_matches_known_vector() {
        let input = hex::decode(
            "08010000016B40D9AD80010000000000000000000000000000000103021503010101425E10000001",
        )
        .unwrap();
        assert_eq!(crc16(&input), 0xF22A);
    }

    #[test]
    fn unsupported_codec_id_is_an_error_not_a_panic() {
        let err = decode_payload(&[0xAB]).unwrap_err();
        assert_eq!(err, crate::error::DecodeError::UnsupportedCodec(0xAB));
    }
}
