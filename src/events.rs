//! Event publication to the broker.
//!
//! Each event becomes an inner JSON payload, wrapped in a publish envelope and
//! sent as one text message. Delivery is fire-and-forget: a failed publish is
//! reported to the caller and the event is dropped.

use core::fmt::Write as FmtWrite;

use heapless::String as HString;
use serde::Serialize;

use crate::config::Identity;
use crate::link::ConnectionManager;
use crate::occupancy::Event;
use crate::websocket::{ChannelError, Transport};

pub const TOPIC_BASE: &str = "campus/room";

pub const TOPIC_LEN: usize = 128;
pub const PAYLOAD_LEN: usize = 384;
pub const ENVELOPE_LEN: usize = 1024;

const DENIAL_REASON: &str = "Unauthorized card";
const ALERT_MESSAGE: &str = "Unauthorized access attempt detected";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Attendance,
    Alerts,
    DeniedAccess,
}

impl EventKind {
    pub fn of(event: &Event) -> Self {
        match event {
            Event::CheckIn { .. } | Event::CheckOut { .. } => EventKind::Attendance,
            Event::AccessDenied { .. } => EventKind::DeniedAccess,
            Event::SecurityAlert { .. } => EventKind::Alerts,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Attendance => "attendance",
            EventKind::Alerts => "alerts",
            EventKind::DeniedAccess => "denied_access",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("network link down")]
    NetworkDown,
    #[error("session link down")]
    SessionDown,
    #[error("topic too long")]
    TopicTooLong,
    #[error("payload does not fit")]
    Encode,
    #[error("send failed: {0}")]
    Send(ChannelError),
}

/// `campus/room/<building>/<hotel_id>/<room>/<kind>`
pub fn topic(building: &str, hotel_id: &str, room: &str, kind: EventKind) -> Result<HString<TOPIC_LEN>, PublishError> {
    let mut topic = HString::new();
    write!(topic, "{}/{}/{}/{}/{}", TOPIC_BASE, building, hotel_id, room, kind.as_str())
        .map_err(|_| PublishError::TopicTooLong)?;
    Ok(topic)
}

// Field order is the wire order.

#[derive(Serialize)]
struct CheckInPayload<'a> {
    card_uid: &'a str,
    role: &'a str,
    check_in: &'a str,
    room: &'a str,
}

#[derive(Serialize)]
struct CheckOutPayload<'a> {
    card_uid: &'a str,
    role: &'a str,
    check_out: &'a str,
    duration: u64,
    room: &'a str,
}

#[derive(Serialize)]
struct DeniedPayload<'a> {
    card_uid: &'a str,
    role: &'a str,
    denial_reason: &'a str,
    attempted_at: &'a str,
    room: &'a str,
}

#[derive(Serialize)]
struct AlertPayload<'a> {
    card_uid: &'a str,
    role: &'a str,
    alert_message: &'a str,
    triggered_at: &'a str,
    room: &'a str,
}

#[derive(Serialize)]
struct Envelope<'a> {
    cmd: &'a str,
    topic: &'a str,
    payload: &'a str,
    qos: u8,
    retain: bool,
}

/// Inner payload for `event`, stamped with `timestamp`.
pub fn payload(event: &Event, timestamp: &str, room: &str) -> Result<HString<PAYLOAD_LEN>, PublishError> {
    let encoded = match event {
        Event::CheckIn { card, role } => serde_json_core::to_string(&CheckInPayload {
            card_uid: &card.to_hex(),
            role,
            check_in: timestamp,
            room,
        }),
        Event::CheckOut { card, role, duration_secs } => serde_json_core::to_string(&CheckOutPayload {
            card_uid: &card.to_hex(),
            role,
            check_out: timestamp,
            duration: *duration_secs,
            room,
        }),
        Event::AccessDenied { card } => serde_json_core::to_string(&DeniedPayload {
            card_uid: &card.to_hex(),
            role: "Unknown",
            denial_reason: DENIAL_REASON,
            attempted_at: timestamp,
            room,
        }),
        Event::SecurityAlert { card } => serde_json_core::to_string(&AlertPayload {
            card_uid: &card.to_hex(),
            role: "Security",
            alert_message: ALERT_MESSAGE,
            triggered_at: timestamp,
            room,
        }),
    };
    encoded.map_err(|_| PublishError::Encode)
}

/// Publish command carrying `payload` as an escaped string.
pub fn envelope(topic: &str, payload: &str) -> Result<HString<ENVELOPE_LEN>, PublishError> {
    serde_json_core::to_string(&Envelope {
        cmd: "publish",
        topic,
        payload,
        qos: 0,
        retain: false,
    })
    .map_err(|_| PublishError::Encode)
}

/// Topic and envelope for one event, ready to send.
pub fn render(event: &Event, identity: &Identity, timestamp: &str) -> Result<(HString<TOPIC_LEN>, HString<ENVELOPE_LEN>), PublishError> {
    let topic = topic(identity.building, identity.hotel_id, identity.room, EventKind::of(event))?;
    let inner = payload(event, timestamp, identity.room)?;
    let message = envelope(&topic, &inner)?;
    Ok((topic, message))
}

pub struct Publisher {
    identity: Identity,
}

impl Publisher {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    /// Send one event. Fails without retry when either link is down.
    pub fn publish<T: Transport>(
        &self,
        conn: &mut ConnectionManager,
        transport: &mut T,
        event: &Event,
        timestamp: &str,
    ) -> Result<(), PublishError> {
        let state = conn.state();
        if !state.network_up {
            return Err(PublishError::NetworkDown);
        }
        if !state.session_up {
            return Err(PublishError::SessionDown);
        }

        let (topic, message) = render(event, &self.identity, timestamp)?;
        conn.send(transport, &message).map_err(PublishError::Send)?;
        log::info!("publish: {} ({} bytes)", topic, message.len());
        Ok(())
    }
}
