//! Shared AVL record shapes (§3) and the Codec 8 / 8E / 16 decoder.
//!
//! These three codecs share a frame shell; only the width of the event
//! header and the per-group counts differ, so one parameterized decoder
//! serves all three, mirroring the teacher crate's `record(codec)` shape.

use chrono::{DateTime, TimeZone, Utc};
use nom::combinator::{map, map_res};
use nom::multi::{count, length_count};
use nom::number::complete::{be_u16, be_u32, be_u64, be_u8};
use nom::sequence::tuple;
use nom::IResult;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Which of the three shared-shell codecs is in play. Each widens the
/// event header and per-group counts relative to the last.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AvlCodec {
    Codec8,
    Codec8Ext,
    Codec16,
}

impl TryFrom<u8> for AvlCodec {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x08 => Ok(Self::Codec8),
            0x8E => Ok(Self::Codec8Ext),
            0x10 => Ok(Self::Codec16),
            other => Err(DecodeError::UnsupportedCodec(other)),
        }
    }
}

impl From<AvlCodec> for u8 {
    fn from(value: AvlCodec) -> u8 {
        match value {
            AvlCodec::Codec8 => 0x08,
            AvlCodec::Codec8Ext => 0x8E,
            AvlCodec::Codec16 => 0x10,
        }
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub enum Priority {
    Low,
    High,
    Panic,
    Security,
}

impl TryFrom<u8> for Priority {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Low),
            0x01 => Ok(Self::High),
            0x02 => Ok(Self::Panic),
            0x03 => Ok(Self::Security),
            other => Err(DecodeError::UnsupportedCodec(other)),
        }
    }
}

/// GPS sub-element (§3). Coordinates are stored as decimal × 10^7 raw
/// integers, matching the wire representation; conversion to decimal
/// degrees happens in the enricher.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct GpsElement {
    pub lon_e7: i32,
    pub lat_e7: i32,
    pub altitude_m: i16,
    pub angle_deg: u16,
    pub satellites: u8,
    pub speed_kmh: u16,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum IoValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    #[serde(with = "serde_bytes")]
    Variable(Vec<u8>),
}

impl IoValue {
    /// Widen to an `f64` the way the enricher needs for multiplier math.
    /// Variable-length values have no numeric interpretation and yield `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            IoValue::U8(v) => Some(*v as f64),
            IoValue::U16(v) => Some(*v as f64),
            IoValue::U32(v) => Some(*v as f64),
            IoValue::U64(v) => Some(*v as f64),
            IoValue::Variable(_) => None,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct IoProperty {
    pub id: u16,
    pub value: IoValue,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct AvlRecord {
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub gps: GpsElement,
    pub event_id: u16,
    /// Codec 16 only; records which rule origin generated the event.
    pub origin_type: Option<u8>,
    pub properties: Vec<IoProperty>,
}

fn gps_element(input: &[u8]) -> IResult<&[u8], GpsElement> {
    map(
        tuple((be_u32, be_u32, be_u16, be_u16, be_u8, be_u16)),
        |(lon, lat, altitude_m, angle_deg, satellites, speed_kmh)| GpsElement {
            lon_e7: lon as i32,
            lat_e7: lat as i32,
            altitude_m: altitude_m as i16,
            angle_deg,
            satellites,
            speed_kmh,
        },
    )(input)
}

fn event_id(codec: AvlCodec, input: &[u8]) -> IResult<&[u8], u16> {
    match codec {
        AvlCodec::Codec8 => map(be_u8, |v| v as u16)(input),
        AvlCodec::Codec8Ext | AvlCodec::Codec16 => be_u16(input),
    }
}

fn group_count(codec: AvlCodec, input: &[u8]) -> IResult<&[u8], u16> {
    match codec {
        AvlCodec::Codec8Ext => be_u16(input),
        AvlCodec::Codec8 | AvlCodec::Codec16 => map(be_u8, |v| v as u16)(input),
    }
}

fn property<'a, F, O>(
    id_width: fn(&'a [u8]) -> IResult<&'a [u8], u16>,
    value: F,
) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], IoProperty>
where
    F: FnMut(&'a [u8]) -> IResult<&'a [u8], O> + Copy,
    O: Into<IoValue>,
{
    move |input: &'a [u8]| {
        let (input, id) = id_width(input)?;
        let (input, value) = value.clone()(input)?;
        Ok((input, IoProperty { id, value: value.into() }))
    }
}

impl From<u8> for IoValue {
    fn from(v: u8) -> Self {
        IoValue::U8(v)
    }
}
impl From<u16> for IoValue {
    fn from(v: u16) -> Self {
        IoValue::U16(v)
    }
}
impl From<u32> for IoValue {
    fn from(v: u32) -> Self {
        IoValue::U32(v)
    }
}
impl From<u64> for IoValue {
    fn from(v: u64) -> Self {
        IoValue::U64(v)
    }
}

fn io_properties(codec: AvlCodec, input: &[u8]) -> IResult<&[u8], Vec<IoProperty>> {
    let id_width: fn(&[u8]) -> IResult<&[u8], u16> = match codec {
        AvlCodec::Codec8Ext | AvlCodec::Codec16 => be_u16,
        AvlCodec::Codec8 => |i| map(be_u8, |v| v as u16)(i),
    };

    let (input, n1) = group_count(codec, input)?;
    let (input, p1) = count(property(id_width, be_u8), n1 as usize)(input)?;

    let (input, n2) = group_count(codec, input)?;
    let (input, p2) = count(property(id_width, be_u16), n2 as usize)(input)?;

    let (input, n4) = group_count(codec, input)?;
    let (input, p4) = count(property(id_width, be_u32), n4 as usize)(input)?;

    let (input, n8) = group_count(codec, input)?;
    let (input, p8) = count(property(id_width, be_u64), n8 as usize)(input)?;

    let (input, px) = if codec == AvlCodec::Codec8Ext {
        let (input, nx) = be_u16(input)?;
        count(
            property(id_width, |i| {
                map(length_count(be_u16, be_u8), |bytes| bytes)(i)
            }),
            nx as usize,
        )(input)?
    } else {
        (input, Vec::new())
    };

    let mut all = Vec::with_capacity(p1.len() + p2.len() + p4.len() + p8.len() + px.len());
    all.extend(p1);
    all.extend(p2);
    all.extend(p4);
    all.extend(p8);
    all.extend(px);
    Ok((input, all))
}

impl From<Vec<u8>> for IoValue {
    fn from(v: Vec<u8>) -> Self {
        IoValue::Variable(v)
    }
}

fn priority(input: &[u8]) -> IResult<&[u8], Priority> {
    map_res(be_u8, Priority::try_from)(input)
}

fn avl_record(codec: AvlCodec, input: &[u8]) -> IResult<&[u8], AvlRecord> {
    let (input, timestamp_ms) = be_u64(input)?;
    let (input, priority) = priority(input)?;
    let (input, gps) = gps_element(input)?;
    let (input, origin_type) = if codec == AvlCodec::Codec16 {
        map(be_u8, Some)(input)?
    } else {
        (input, None)
    };
    let (input, evt_id) = event_id(codec, input)?;
    let (input, total_io) = group_count(codec, input)?;
    let (input, properties) = io_properties(codec, input)?;

    let timestamp = Utc
        .timestamp_millis_opt(timestamp_ms as i64)
        .single()
        .unwrap_or_else(Utc::now);

    let record = AvlRecord {
        timestamp,
        priority,
        gps,
        event_id: evt_id,
        origin_type,
        properties,
    };

    let _ = total_io; // the header count is informational; real count is len(properties)
    Ok((input, record))
}

/// Parses the record count, the records themselves, and the trailing
/// repeated count, without judging whether the two counts agree — that
/// check belongs to `decode_records`, since nom's `IResult` error type
/// can't carry `DecodeError::QuantityMismatch` through cleanly.
fn records(codec: AvlCodec, input: &[u8]) -> IResult<&[u8], (u8, Vec<AvlRecord>, u8)> {
    let (input, n) = be_u8(input)?;
    let (input, recs) = count(|i| avl_record(codec, i), n as usize)(input)?;
    let (input, n2) = be_u8(input)?;
    Ok((input, (n, recs, n2)))
}

pub fn decode_records(codec: AvlCodec, input: &[u8]) -> Result<(usize, Vec<AvlRecord>), DecodeError> {
    let (rest, (n, recs, n2)) =
        records(codec, input).map_err(|_| DecodeError::Truncated { needed: 1 })?;
    if n != n2 {
        return Err(DecodeError::QuantityMismatch {
            quantity1: n,
            quantity2: n2,
        });
    }
    let consumed = input.len() - rest.len();
    Ok((consumed, recs))
}
