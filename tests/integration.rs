//! End-to-end scenarios across codec decode, enrichment, and broker
//! classification (spec §8 scenarios 1, 5, 6), exercised through the
//! crate's public API without a live socket or broker.

use std::collections::HashMap;

use chrono::{NaiveTime, TimeZone, Utc};
use teltonika_parser_service::broker::{classify, RecordType};
use teltonika_parser_service::codec::{decode_payload, Payload};
use teltonika_parser_service::enrich::RecordEnricher;
use teltonika_parser_service::mapping::{IoMapping, IoType, Target};

fn ignition_mapping(multiplier: f64, column_name: &str, window: (NaiveTime, NaiveTime)) -> IoMapping {
    IoMapping {
        imei: "123456789012345".into(),
        io_id: 1,
        multiplier,
        io_type: IoType::Digital,
        io_name: "Ignition".into(),
        value_name: "On".into(),
        trigger_value: Some(1.0),
        target: Target::Both,
        column_name: column_name.into(),
        window_start: window.0,
        window_end: window.1,
        is_alarm: true,
        is_sms: false,
        is_email: false,
        is_call: false,
        updated_at: Utc::now(),
    }
}

fn codec8_frame_one_record() -> Vec<u8> {
    // codec id, record count
    let mut payload = vec![0x08, 0x01];
    // timestamp ms (2024-01-01T00:00:00Z), priority=0 (Low)
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp_millis() as u64;
    payload.extend_from_slice(&ts.to_be_bytes());
    payload.push(0x00); // priority low
                        // gps: lon_e7, lat_e7, altitude, angle, satellites, speed
    payload.extend_from_slice(&(67_001_100i32).to_be_bytes());
    payload.extend_from_slice(&(248_607_000i32).to_be_bytes());
    payload.extend_from_slice(&(0i16).to_be_bytes());
    payload.extend_from_slice(&(0u16).to_be_bytes());
    payload.push(6);
    payload.extend_from_slice(&(10u16).to_be_bytes());
    // event_id (u8 for codec8)
    payload.push(1);
    // total io count (u8)
    payload.push(1);
    // 1-byte group: count=1, {id:1, value:1}
    payload.push(1);
    payload.push(1);
    payload.push(1);
    // 2-byte group count = 0
    payload.push(0);
    // 4-byte group count = 0
    payload.push(0);
    // 8-byte group count = 0
    payload.push(0);
    // trailing record count
    payload.push(0x01);
    payload
}

#[test]
fn scenario_1_login_then_one_record_classifies_trackdata_event_and_alarm() {
    let payload = codec8_frame_one_record();
    let decoded = decode_payload(&payload).expect("codec8 frame decodes");
    let records = match decoded.payload {
        Payload::Avl(records) => records,
        _ => panic!("expected an AVL payload"),
    };
    assert_eq!(records.len(), 1);

    let mut mappings = HashMap::new();
    mappings.insert(
        1u16,
        vec![ignition_mapping(
            1.0,
            "status",
            (
                NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
            ),
        )],
    );

    let enricher = RecordEnricher::new(None, 50.0);
    let enriched = futures_lite_block_on(enricher.enrich("123456789012345", &records[0], &mappings));

    assert_eq!(enriched.status, "Ignition On");
    assert!(enriched.is_alarm);
    assert_eq!(
        classify(&enriched),
        vec![RecordType::TrackData, RecordType::Event, RecordType::Alarm]
    );
}

#[test]
fn scenario_5_mapping_multiplier_change_reflected_in_formatted_value() {
    // T0: multiplier 1.0 (integer format); T1 store bumps to 0.001.
    let mut mappings_before = HashMap::new();
    mappings_before.insert(
        66u16,
        vec![IoMapping {
            multiplier: 1.0,
            target: Target::Column,
            column_name: "main_battery".into(),
            ..ignition_mapping(1.0, "main_battery", (NaiveTime::from_hms_opt(0, 0, 0).unwrap(), NaiveTime::from_hms_opt(23, 59, 59).unwrap()))
        }],
    );
    let mut mappings_after = HashMap::new();
    mappings_after.insert(
        66u16,
        vec![IoMapping {
            multiplier: 0.001,
            io_type: IoType::Analog,
            target: Target::Column,
            column_name: "main_battery".into(),
            ..ignition_mapping(0.001, "main_battery", (NaiveTime::from_hms_opt(0, 0, 0).unwrap(), NaiveTime::from_hms_opt(23, 59, 59).unwrap()))
        }],
    );

    let record = teltonika_parser_service::codec::avl::AvlRecord {
        timestamp: Utc::now(),
        priority: teltonika_parser_service::codec::avl::Priority::Low,
        gps: teltonika_parser_service::codec::avl::GpsElement {
            lon_e7: 1,
            lat_e7: 1,
            altitude_m: 0,
            angle_deg: 0,
            satellites: 6,
            speed_kmh: 0,
        },
        event_id: 0,
        origin_type: None,
        properties: vec![teltonika_parser_service::codec::avl::IoProperty {
            id: 66,
            value: teltonika_parser_service::codec::avl::IoValue::U16(12500),
        }],
    };

    let enricher = RecordEnricher::new(None, 50.0);
    let before = futures_lite_block_on(enricher.enrich("123456789012345", &record, &mappings_before));
    let after = futures_lite_block_on(enricher.enrich("123456789012345", &record, &mappings_after));

    assert_eq!(before.columns.main_battery.as_deref(), Some("12500"));
    assert_eq!(after.columns.main_battery.as_deref(), Some("12.500"));
}

#[test]
fn scenario_6_alarm_window_boundary_just_inside_and_just_outside() {
    let window = (
        NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
    );
    let mut mappings = HashMap::new();
    mappings.insert(3u16, vec![panic_mapping(window)]);

    let inside = record_with_time_and_event(5, 59, 59, 3);
    let outside = record_with_time_and_event(6, 0, 1, 3);

    let enricher = RecordEnricher::new(None, 50.0);
    let inside_enriched = futures_lite_block_on(enricher.enrich("123456789012345", &inside, &mappings));
    let outside_enriched = futures_lite_block_on(enricher.enrich("123456789012345", &outside, &mappings));

    assert!(inside_enriched.is_alarm);
    assert!(classify(&inside_enriched).contains(&RecordType::Alarm));

    assert!(!outside_enriched.is_alarm);
    assert_eq!(outside_enriched.status, "Panic On");
    assert!(!classify(&outside_enriched).contains(&RecordType::Alarm));
    assert!(classify(&outside_enriched).contains(&RecordType::Event));
}

fn panic_mapping(window: (NaiveTime, NaiveTime)) -> IoMapping {
    IoMapping {
        imei: "123456789012345".into(),
        io_id: 3,
        multiplier: 1.0,
        io_type: IoType::Digital,
        io_name: "Panic".into(),
        value_name: "On".into(),
        trigger_value: Some(1.0),
        target: Target::Both,
        column_name: String::new(),
        window_start: window.0,
        window_end: window.1,
        is_alarm: true,
        is_sms: false,
        is_email: false,
        is_call: false,
        updated_at: Utc::now(),
    }
}

fn record_with_time_and_event(
    hour: u32,
    minute: u32,
    second: u32,
    event_id: u16,
) -> teltonika_parser_service::codec::avl::AvlRecord {
    teltonika_parser_service::codec::avl::AvlRecord {
        timestamp: Utc.with_ymd_and_hms(2026, 1, 1, hour, minute, second).unwrap(),
        priority: teltonika_parser_service::codec::avl::Priority::High,
        gps: teltonika_parser_service::codec::avl::GpsElement {
            lon_e7: 1,
            lat_e7: 1,
            altitude_m: 0,
            angle_deg: 0,
            satellites: 6,
            speed_kmh: 0,
        },
        event_id,
        origin_type: None,
        properties: vec![teltonika_parser_service::codec::avl::IoProperty {
            id: event_id,
            value: teltonika_parser_service::codec::avl::IoValue::U8(1),
        }],
    }
}

/// These enrichment calls have no `.await` points reachable in practice
/// (the `location` argument is `None`), so a tiny inline executor avoids
/// pulling in a `#[tokio::test]` runtime for purely synchronous assertions.
fn futures_lite_block_on<F: std::future::Future>(fut: F) -> F::Output {
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn noop(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);

    let waker = unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) };
    let mut cx = Context::from_waker(&waker);
    let mut fut = Box::pin(fut);
    loop {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }
    }
}
