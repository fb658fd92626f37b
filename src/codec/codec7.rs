//! Codec 7 (GH protocol) decoder.
//!
//! This is the oldest of the supported codecs and the only one that packs
//! the priority and timestamp into a single word and uses bitmasks rather
//! than count-prefixed groups. It needs explicit position control rather
//! than nom's combinator style, so it is built on [`super::reader::ByteReader`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::avl::{AvlRecord, GpsElement, IoProperty, IoValue};
use super::reader::ByteReader;
use crate::error::DecodeError;

/// Seconds since this epoch are added to the 30-bit timestamp field.
fn gh_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2007, 1, 1, 0, 0, 0).single().unwrap()
}

const CELL_ID_PROPERTY_ID: u16 = 200;
const SIGNAL_QUALITY_PROPERTY_ID: u16 = 201;
const OPERATOR_CODE_PROPERTY_ID: u16 = 202;
const ALARM_PROPERTY_ID: u16 = 204;
const INVALID_GPS_SPEED: u16 = 255;

/// A minimal hand-rolled bitflags macro: the corpus never pulls in the
/// `bitflags` crate, and a single byte of named bits doesn't warrant it.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        struct $name:ident: u8 {
            $($flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        struct $name(u8);

        #[allow(non_upper_case_globals)]
        impl $name {
            $(const $flag: u8 = $value;)*

            fn from_byte(b: u8) -> Self {
                Self(b)
            }

            fn has(&self, flag: u8) -> bool {
                self.0 & flag != 0
            }
        }
    };
}

bitflags_like! {
    /// Global mask selecting which groups follow the priority/timestamp word.
    struct GlobalMask: u8 {
        GPS_ELEMENT = 1 << 0;
        IO_INT8 = 1 << 1;
        IO_INT16 = 1 << 2;
        IO_INT32 = 1 << 3;
    }
}

bitflags_like! {
    /// GPS sub-element mask.
    struct GpsMask: u8 {
        COORDINATES = 1 << 0;
        ALTITUDE = 1 << 1;
        ANGLE = 1 << 2;
        SPEED = 1 << 3;
        SATELLITES = 1 << 4;
        CELL_ID = 1 << 5;
        SIGNAL_QUALITY = 1 << 6;
        OPERATOR_CODE = 1 << 7;
    }
}

/// Codec 7's priority is extracted from only the top 2 bits of the combined
/// word, so the declared `ALARM` value (10) can never actually appear —
/// only `PERIODICAL` (1) is reachable, with 0/2/3 retained as raw integers.
/// The upstream decoder preserves this rather than widening the field, and
/// so do we.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPriority(pub u8);

impl RawPriority {
    const PERIODICAL: u8 = 1;
    const ALARM: u8 = 10;

    fn is_alarm(&self) -> bool {
        self.0 == Self::ALARM
    }
}

fn decode_gps_element(
    r: &mut ByteReader,
) -> Result<(GpsElement, Vec<IoProperty>), DecodeError> {
    let mask = GpsMask::from_byte(r.read_u8()?);

    let mut lon = 0.0f32;
    let mut lat = 0.0f32;
    if mask.has(GpsMask::COORDINATES) {
        let lat_raw = r.read_i32()?;
        let lon_raw = r.read_i32()?;
        let lat_f = ByteReader::reinterpret_f32(lat_raw);
        let lon_f = ByteReader::reinterpret_f32(lon_raw);
        lat = if (-90.0..=90.0).contains(&lat_f) { lat_f } else { 0.0 };
        lon = if (-180.0..=180.0).contains(&lon_f) { lon_f } else { 0.0 };
    }

    let altitude_m = if mask.has(GpsMask::ALTITUDE) {
        r.read_u16()? as i16
    } else {
        0
    };

    let angle_deg = if mask.has(GpsMask::ANGLE) {
        let raw = r.read_u8()? as u32;
        ((raw * 360 + 128) / 256) as u16
    } else {
        0
    };

    let mut speed_kmh = if mask.has(GpsMask::SPEED) {
        r.read_u8()? as u16
    } else {
        0
    };

    let mut satellites = if mask.has(GpsMask::SATELLITES) {
        r.read_u8()?
    } else {
        3
    };

    let mut properties = Vec::new();
    if mask.has(GpsMask::CELL_ID) {
        let v = r.read_i32()?;
        properties.push(IoProperty {
            id: CELL_ID_PROPERTY_ID,
            value: IoValue::U32(v as u32),
        });
    }
    if mask.has(GpsMask::SIGNAL_QUALITY) {
        let v = r.read_u8()?;
        properties.push(IoProperty {
            id: SIGNAL_QUALITY_PROPERTY_ID,
            value: IoValue::U8(v),
        });
    }
    if mask.has(GpsMask::OPERATOR_CODE) {
        let v = r.read_i32()?;
        properties.push(IoProperty {
            id: OPERATOR_CODE_PROPERTY_ID,
            value: IoValue::U32(v as u32),
        });
    }

    if lon == 0.0 && lat == 0.0 {
        speed_kmh = INVALID_GPS_SPEED;
        satellites = 0;
    }

    let gps = GpsElement {
        lon_e7: (lon * 1.0e7) as i32,
        lat_e7: (lat * 1.0e7) as i32,
        altitude_m,
        angle_deg,
        satellites,
        speed_kmh,
    };
    Ok((gps, properties))
}

fn decode_io_group(r: &mut ByteReader, width: u8) -> Result<Vec<IoProperty>, DecodeError> {
    let count = r.read_u8()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.read_u8()? as u16;
        let value = match width {
            1 => IoValue::U8(r.read_u8()?),
            2 => IoValue::U16(r.read_u16()?),
            4 => IoValue::U32(r.read_u32()?),
            _ => unreachable!("codec 7 only defines 1/2/4-byte IO groups"),
        };
        out.push(IoProperty { id, value });
    }
    Ok(out)
}

fn decode_record(r: &mut ByteReader) -> Result<AvlRecord, DecodeError> {
    let word = r.read_u32()?;
    let priority = RawPriority((word >> 30) as u8);
    let timestamp = gh_epoch() + chrono::Duration::seconds((word & 0x3FFF_FFFF) as i64);

    let (event_id, mut properties) = if priority.is_alarm() {
        (
            ALARM_PROPERTY_ID,
            vec![IoProperty {
                id: ALARM_PROPERTY_ID,
                value: IoValue::U8(1),
            }],
        )
    } else {
        (0u16, Vec::new())
    };

    let mask = GlobalMask::from_byte(r.read_u8()?);

    let (gps, gps_extra) = if mask.has(GlobalMask::GPS_ELEMENT) {
        decode_gps_element(r)?
    } else {
        (
            GpsElement {
                lon_e7: 0,
                lat_e7: 0,
                altitude_m: 0,
                angle_deg: 0,
                satellites: 0,
                speed_kmh: 0,
            },
            Vec::new(),
        )
    };
    properties.extend(gps_extra);

    if mask.has(GlobalMask::IO_INT8) {
        properties.extend(decode_io_group(r, 1)?);
    }
    if mask.has(GlobalMask::IO_INT16) {
        properties.extend(decode_io_group(r, 2)?);
    }
    if mask.has(GlobalMask::IO_INT32) {
        properties.extend(decode_io_group(r, 4)?);
    }

    Ok(AvlRecord {
        timestamp,
        // Codec 7 priority doesn't map onto the shared 4-value enum (it is
        // a raw 2-bit field); we fold PERIODICAL to Low and anything else
        // (including the unreachable ALARM bit pattern) to High, keeping
        // the alarm-derived event_id/property as the source of truth for
        // alarm classification rather than the priority label itself.
        priority: if priority.0 == RawPriority::PERIODICAL {
            super::avl::Priority::Low
        } else {
            super::avl::Priority::High
        },
        gps,
        event_id,
        origin_type: None,
        properties,
    })
}

/// Decodes a full Codec 7 AVL data collection: one length-prefixed byte of
/// record count followed by that many records, no trailing repeated count
/// (unlike Codec 8/8E/16).
pub fn decode_records(input: &[u8]) -> Result<(usize, Vec<AvlRecord>), DecodeError> {
    let mut r = ByteReader::new(input);
    let count = r.read_u8()?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(decode_record(&mut r)?);
    }
    Ok((r.position(), records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collection_decodes_to_zero_records() {
        let (consumed, recs) = decode_records(&[0x00]).unwrap();
        assert_eq!(consumed, 1);
        assert!(recs.is_empty());
    }

    #[test]
    fn truncated_input_surfaces_truncated_error() {
        let err = decode_records(&[0x01]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }
}
