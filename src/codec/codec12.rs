//! Codec 12 decoder: GPRS command/response frames (§4.3, §4.8).
//!
//! Unlike Codec 7/8/8E/16 this codec carries no AVL data — it's the wire
//! shape for sending a text command to a device and reading back its text
//! reply. `Type` distinguishes which direction a given frame travels:
//! `0x05` command (matches a `command_sent` row) or `0x06` response. A
//! device may also emit an unsolicited `0x06` with no matching outbound
//! command, which the correlator audits separately.

use nom::combinator::map_res;
use nom::multi::length_data;
use nom::number::complete::{be_u32, be_u8};
use nom::sequence::tuple;
use nom::IResult;

use crate::error::DecodeError;

pub const COMMAND_TYPE: u8 = 0x05;
pub const RESPONSE_TYPE: u8 = 0x06;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Command,
    Response,
}

impl TryFrom<u8> for FrameType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            COMMAND_TYPE => Ok(Self::Command),
            RESPONSE_TYPE => Ok(Self::Response),
            other => Err(DecodeError::UnsupportedCodec(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Codec12Frame {
    pub frame_type: FrameType,
    /// Decoded as ASCII, falling back to Latin-1 on invalid bytes — Teltonika
    /// devices occasionally echo raw command text verbatim rather than
    /// re-encoding it, so this can't be assumed to be valid UTF-8.
    pub text: String,
}

fn ascii_or_latin1(bytes: &[u8]) -> String {
    if bytes.is_ascii() {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

fn frame_type(input: &[u8]) -> IResult<&[u8], FrameType> {
    map_res(be_u8, FrameType::try_from)(input)
}

/// Parses everything after the codec ID byte: `qty1, type, size+text, qty2`.
/// The caller supplies the already-stripped codec ID.
fn body(input: &[u8]) -> IResult<&[u8], (u8, FrameType, &[u8], u8)> {
    tuple((
        be_u8,
        frame_type,
        length_data(be_u32),
        be_u8,
    ))(input)
}

pub fn decode(input: &[u8]) -> Result<(usize, Codec12Frame), DecodeError> {
    let (rest, (qty1, frame_type, text_bytes, qty2)) =
        body(input).map_err(|_| DecodeError::Truncated { needed: 1 })?;

    if qty1 != qty2 {
        return Err(DecodeError::QuantityMismatch {
            quantity1: qty1,
            quantity2: qty2,
        });
    }

    let consumed = input.len() - rest.len();
    Ok((
        consumed,
        Codec12Frame {
            frame_type,
            text: ascii_or_latin1(text_bytes),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_type: u8, text: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(1); // qty1
        buf.push(frame_type);
        buf.extend_from_slice(&(text.len() as u32).to_be_bytes());
        buf.extend_from_slice(text);
        buf.push(1); // qty2
        buf
    }

    #[test]
    fn decodes_command_text() {
        let raw = frame(COMMAND_TYPE, b"getinfo");
        let (consumed, decoded) = decode(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(decoded.frame_type, FrameType::Command);
        assert_eq!(decoded.text, "getinfo");
    }

    #[test]
    fn decodes_response_text() {
        let raw = frame(RESPONSE_TYPE, b"GSM:5 GPS:1");
        let (_, decoded) = decode(&raw).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Response);
        assert_eq!(decoded.text, "GSM:5 GPS:1");
    }

    #[test]
    fn quantity_mismatch_is_rejected() {
        let mut raw = frame(RESPONSE_TYPE, b"ok");
        *raw.last_mut().unwrap() = 2; // qty2 != qty1
        let err = decode(&raw).unwrap_err();
        assert_eq!(
            err,
            DecodeError::QuantityMismatch {
                quantity1: 1,
                quantity2: 2
            }
        );
    }

    #[test]
    fn unknown_type_byte_is_an_error_not_a_panic() {
        let raw = frame(0x99, b"x");
        assert!(decode(&raw).is_err());
    }
}
