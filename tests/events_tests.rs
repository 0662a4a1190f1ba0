//! Unit tests for topic naming, payload encoding and the publish path.

#![allow(dead_code)]

#[path = "../src/allowlist.rs"]
mod allowlist;
#[path = "../src/clock.rs"]
mod clock;
#[path = "../src/config.rs"]
mod config;
#[path = "../src/events.rs"]
mod events;
#[path = "../src/link.rs"]
mod link;
#[path = "../src/occupancy.rs"]
mod occupancy;
#[path = "../src/websocket.rs"]
mod websocket;

use std::collections::VecDeque;

use allowlist::CardId;
use config::{Config, Identity};
use events::*;
use link::{ConnectionManager, Radio};
use occupancy::Event;
use websocket::{decode_frame, Opcode, Transport, TransportError, TransportState, WsClient};

const TS: &str = "2023-11-15 03:43:20";
const MAINTENANCE: CardId = CardId::new([0xAF, 0x4D, 0x99, 0x1F]);
const STRANGER: CardId = CardId::new([0x00, 0x00, 0x00, 0x00]);

fn identity() -> Identity {
    Identity {
        room: "202",
        building: "main",
        hotel_id: "3",
    }
}

struct UpRadio;

impl Radio for UpRadio {
    fn poll(&mut self, _now_ms: u64) {}
    fn begin_connect(&mut self, _ssid: &str, _password: &str) {}
    fn is_associated(&self) -> bool {
        true
    }
    fn has_address(&self) -> bool {
        true
    }
    fn power_cycle(&mut self) {}
}

/// Accepts every connection, answers the upgrade and keeps what the client sends.
struct MockBroker {
    state: TransportState,
    handshaken: bool,
    inbound: VecDeque<u8>,
    sent: Vec<u8>,
}

impl MockBroker {
    fn new() -> Self {
        Self {
            state: TransportState::Closed,
            handshaken: false,
            inbound: VecDeque::new(),
            sent: Vec::new(),
        }
    }
}

impl Transport for MockBroker {
    fn open(&mut self, _host: &str, _port: u16) -> Result<(), TransportError> {
        self.state = TransportState::Open;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.handshaken {
            self.sent.extend_from_slice(data);
        } else {
            self.handshaken = true;
            self.inbound.extend(b"HTTP/1.1 101 Switching Protocols\r\n\r\n".iter().copied());
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = buf.len().min(self.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.state = TransportState::Closed;
    }
}

fn manager() -> ConnectionManager {
    let config = Config::get();
    ConnectionManager::new(&config.wifi, &config.broker, &config.time, WsClient::new(5, "test-agent"))
}

// ============================================================================
// Topic tests
// ============================================================================

#[test]
fn test_event_kinds() {
    let role = "Maintenance";
    assert_eq!(EventKind::of(&Event::CheckIn { card: MAINTENANCE, role }), EventKind::Attendance);
    assert_eq!(
        EventKind::of(&Event::CheckOut { card: MAINTENANCE, role, duration_secs: 1 }),
        EventKind::Attendance
    );
    assert_eq!(EventKind::of(&Event::AccessDenied { card: STRANGER }), EventKind::DeniedAccess);
    assert_eq!(EventKind::of(&Event::SecurityAlert { card: STRANGER }), EventKind::Alerts);
}

#[test]
fn test_topics() {
    assert_eq!(
        topic("main", "3", "202", EventKind::Attendance).unwrap().as_str(),
        "campus/room/main/3/202/attendance"
    );
    assert_eq!(
        topic("main", "3", "202", EventKind::Alerts).unwrap().as_str(),
        "campus/room/main/3/202/alerts"
    );
    assert_eq!(
        topic("main", "3", "202", EventKind::DeniedAccess).unwrap().as_str(),
        "campus/room/main/3/202/denied_access"
    );
}

#[test]
fn test_topic_too_long() {
    let building = "b".repeat(TOPIC_LEN);
    assert_eq!(
        topic(&building, "3", "202", EventKind::Attendance),
        Err(PublishError::TopicTooLong)
    );
}

// ============================================================================
// Payload tests
// ============================================================================

#[test]
fn test_check_in_payload() {
    let event = Event::CheckIn { card: MAINTENANCE, role: "Maintenance" };
    assert_eq!(
        payload(&event, TS, "202").unwrap().as_str(),
        r#"{"card_uid":"AF4D991F","role":"Maintenance","check_in":"2023-11-15 03:43:20","room":"202"}"#
    );
}

#[test]
fn test_check_out_payload() {
    let event = Event::CheckOut {
        card: MAINTENANCE,
        role: "Maintenance",
        duration_secs: 50,
    };
    assert_eq!(
        payload(&event, TS, "202").unwrap().as_str(),
        r#"{"card_uid":"AF4D991F","role":"Maintenance","check_out":"2023-11-15 03:43:20","duration":50,"room":"202"}"#
    );
}

#[test]
fn test_denied_payload() {
    let event = Event::AccessDenied { card: STRANGER };
    assert_eq!(
        payload(&event, TS, "202").unwrap().as_str(),
        r#"{"card_uid":"00000000","role":"Unknown","denial_reason":"Unauthorized card","attempted_at":"2023-11-15 03:43:20","room":"202"}"#
    );
}

#[test]
fn test_alert_payload() {
    let event = Event::SecurityAlert { card: STRANGER };
    assert_eq!(
        payload(&event, TS, "202").unwrap().as_str(),
        r#"{"card_uid":"00000000","role":"Security","alert_message":"Unauthorized access attempt detected","triggered_at":"2023-11-15 03:43:20","room":"202"}"#
    );
}

#[test]
fn test_unsynced_timestamp_is_sentinel() {
    let event = Event::CheckIn { card: MAINTENANCE, role: "Guest" };
    let encoded = payload(&event, clock::TIMESTAMP_SENTINEL, "202").unwrap();
    assert!(encoded.contains(r#""check_in":"1970-01-01 00:00:00""#));
}

// ============================================================================
// Envelope tests
// ============================================================================

#[test]
fn test_envelope_escapes_payload() {
    assert_eq!(
        envelope("t", r#"{"a":1}"#).unwrap().as_str(),
        r#"{"cmd":"publish","topic":"t","payload":"{\"a\":1}","qos":0,"retain":false}"#
    );
}

#[test]
fn test_render_check_in() {
    let event = Event::CheckIn { card: MAINTENANCE, role: "Maintenance" };
    let (topic, message) = render(&event, &identity(), TS).unwrap();

    assert_eq!(topic.as_str(), "campus/room/main/3/202/attendance");
    assert_eq!(
        message.as_str(),
        r#"{"cmd":"publish","topic":"campus/room/main/3/202/attendance","payload":"{\"card_uid\":\"AF4D991F\",\"role\":\"Maintenance\",\"check_in\":\"2023-11-15 03:43:20\",\"room\":\"202\"}","qos":0,"retain":false}"#
    );
}

#[test]
fn test_render_uses_identity() {
    let identity = Identity {
        room: "7",
        building: "annex",
        hotel_id: "12",
    };
    let (topic, message) = render(&Event::SecurityAlert { card: STRANGER }, &identity, TS).unwrap();
    assert_eq!(topic.as_str(), "campus/room/annex/12/7/alerts");
    assert!(message.contains(r#"\"room\":\"7\""#));
}

// ============================================================================
// Publisher tests
// ============================================================================

#[test]
fn test_publish_without_network() {
    let mut conn = manager();
    let mut broker = MockBroker::new();
    let publisher = Publisher::new(identity());

    let event = Event::AccessDenied { card: STRANGER };
    assert_eq!(
        publisher.publish(&mut conn, &mut broker, &event, TS),
        Err(PublishError::NetworkDown)
    );
    assert!(broker.sent.is_empty());
}

#[test]
fn test_publish_without_session() {
    let mut conn = manager();
    let mut broker = MockBroker::new();
    let publisher = Publisher::new(identity());

    conn.maintain_network(&mut UpRadio, 0);
    conn.maintain_network(&mut UpRadio, 10);
    assert!(conn.state().network_up);

    let event = Event::AccessDenied { card: STRANGER };
    assert_eq!(
        publisher.publish(&mut conn, &mut broker, &event, TS),
        Err(PublishError::SessionDown)
    );
}

#[test]
fn test_publish_sends_envelope() {
    let mut conn = manager();
    let mut broker = MockBroker::new();
    let publisher = Publisher::new(identity());

    conn.maintain_network(&mut UpRadio, 0);
    conn.maintain_network(&mut UpRadio, 10);
    conn.maintain_session(&mut broker, 10);
    conn.service_session(&mut broker, 10);
    conn.service_session(&mut broker, 20);
    assert!(conn.state().session_up);

    let event = Event::CheckOut {
        card: MAINTENANCE,
        role: "Maintenance",
        duration_secs: 50,
    };
    publisher.publish(&mut conn, &mut broker, &event, TS).unwrap();

    let mut sent = broker.sent.clone();
    let (frame, used) = decode_frame(&mut sent).unwrap().unwrap();
    assert_eq!(used, broker.sent.len());
    assert_eq!(frame.opcode, Opcode::Text);

    let text = std::str::from_utf8(frame.payload).unwrap();
    assert!(text.starts_with(r#"{"cmd":"publish","topic":"campus/room/main/3/202/attendance","#));
    assert!(text.contains(r#"\"duration\":50"#));
}
