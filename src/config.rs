//! Unit configuration, embedded at compile time.
//!
//! Every room runs the same image; the values that differ between units (network
//! credentials, broker endpoint, room identity, timezone) come from environment
//! variables at build time. See build.rs for the list.

use core::fmt::Write as FmtWrite;
use heapless::String as HString;

pub const FIRMWARE_VERSION: &str = "1.0.0";
pub const DEVICE_TYPE: &str = "RFID_READER";

// Network link
pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const WIFI_RETRY_DELAY_MS: u32 = 500;

// Session link
pub const WS_RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const WS_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const WS_HEARTBEAT_TIMEOUT_MS: u64 = 3_000;
pub const WS_HEARTBEAT_MAX_MISSED: u8 = 2;

// Clock
pub const NTP_SERVERS: [&str; 3] = ["pool.ntp.org", "time.nist.gov", "time.google.com"];
pub const NTP_SYNC_INTERVAL_MS: u64 = 3_600_000;
pub const NTP_FAILED_RETRY_MS: u64 = 60_000;
pub const NTP_STARTUP_RETRY_MS: u32 = 5_000;

// Presence
pub const CARD_ABSENT_THRESHOLD: u8 = 5;
pub const MAX_FAILED_ATTEMPTS: u8 = 5;
pub const MAIN_LOOP_DELAY_MS: u32 = 100;

// Health
pub const STATUS_INTERVAL_MS: u64 = 30_000;
pub const MEMORY_CHECK_INTERVAL_MS: u64 = 60_000;
pub const MAX_ERROR_COUNT: u8 = 10;

const _: () = assert!(
    CARD_ABSENT_THRESHOLD >= 1 && CARD_ABSENT_THRESHOLD <= 20,
    "CARD_ABSENT_THRESHOLD must be between 1 and 20"
);

/// Static identity of this unit within the installation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub room: &'static str,
    pub building: &'static str,
    pub hotel_id: &'static str,
}

impl Identity {
    /// Device identifier derived from room and hotel, e.g. `ESP32_ROOM_202_HOTEL_3`.
    pub fn device_id(&self) -> HString<48> {
        let mut id = HString::new();
        let _ = write!(id, "ESP32_ROOM_{}_HOTEL_{}", self.room, self.hotel_id);
        id
    }
}

#[derive(Clone, Debug)]
pub struct WifiConfig {
    pub ssid: &'static str,
    pub password: &'static str,
    pub connect_timeout_ms: u64,
}

/// Session liveness probing: ping every `interval_ms`, a pong later than
/// `timeout_ms` counts as missed, `max_missed` misses drop the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_missed: u8,
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub host: &'static str,
    pub port: u16,
    /// `wss://` (TLS) rather than plain `ws://`.
    pub secure: bool,
    pub path: &'static str,
    pub reconnect_interval_ms: u64,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Clone, Debug)]
pub struct TimeConfig {
    pub servers: [&'static str; 3],
    pub utc_offset_secs: i32,
    pub dst_offset_secs: i32,
    pub sync_interval_ms: u64,
    /// Wait after a failed periodic sync before trying again.
    pub retry_after_failure_ms: u64,
}

impl BrokerConfig {
    pub fn scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }
}

/// Port implied by the scheme, left out of the `Host` header.
pub const fn default_port(secure: bool) -> u16 {
    if secure { 443 } else { 80 }
}

impl TimeConfig {
    /// Total offset from UTC applied to every timestamp.
    pub fn local_offset_secs(&self) -> i32 {
        self.utc_offset_secs + self.dst_offset_secs
    }
}

#[derive(Clone, Debug)]
pub struct PresenceConfig {
    pub absent_threshold: u8,
    pub max_failed_attempts: u8,
    pub poll_interval_ms: u32,
}

/// Complete unit configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub wifi: WifiConfig,
    pub broker: BrokerConfig,
    pub identity: Identity,
    pub time: TimeConfig,
    pub presence: PresenceConfig,
    pub max_error_count: u8,
}

impl Config {
    /// Get the compile-time configuration.
    pub fn get() -> Self {
        let secure = match option_env!("ROOM_NODE_WS_SECURE") {
            Some(s) => parse_flag(s, true),
            None => true,
        };
        Self {
            wifi: WifiConfig {
                ssid: option_env!("ROOM_NODE_SSID").unwrap_or("unconfigured"),
                password: option_env!("ROOM_NODE_PASSWORD").unwrap_or(""),
                connect_timeout_ms: WIFI_CONNECT_TIMEOUT_MS,
            },
            broker: BrokerConfig {
                host: option_env!("ROOM_NODE_WS_HOST").unwrap_or("192.168.1.1"),
                port: match option_env!("ROOM_NODE_WS_PORT") {
                    Some(s) => parse_port(s, default_port(secure)),
                    None => default_port(secure),
                },
                secure,
                path: option_env!("ROOM_NODE_WS_PATH").unwrap_or("/mqtt"),
                reconnect_interval_ms: WS_RECONNECT_INTERVAL_MS,
                heartbeat: HeartbeatConfig {
                    interval_ms: WS_HEARTBEAT_INTERVAL_MS,
                    timeout_ms: WS_HEARTBEAT_TIMEOUT_MS,
                    max_missed: WS_HEARTBEAT_MAX_MISSED,
                },
            },
            identity: Identity {
                room: option_env!("ROOM_NODE_ROOM").unwrap_or("202"),
                building: option_env!("ROOM_NODE_BUILDING").unwrap_or("main"),
                hotel_id: option_env!("ROOM_NODE_HOTEL_ID").unwrap_or("3"),
            },
            time: TimeConfig {
                servers: NTP_SERVERS,
                utc_offset_secs: match option_env!("ROOM_NODE_UTC_OFFSET") {
                    Some(s) => parse_offset(s, 19_800),
                    None => 19_800,
                },
                dst_offset_secs: match option_env!("ROOM_NODE_DST_OFFSET") {
                    Some(s) => parse_offset(s, 0),
                    None => 0,
                },
                sync_interval_ms: NTP_SYNC_INTERVAL_MS,
                retry_after_failure_ms: NTP_FAILED_RETRY_MS,
            },
            presence: PresenceConfig {
                absent_threshold: CARD_ABSENT_THRESHOLD,
                max_failed_attempts: MAX_FAILED_ATTEMPTS,
                poll_interval_ms: MAIN_LOOP_DELAY_MS,
            },
            max_error_count: MAX_ERROR_COUNT,
        }
    }
}

/// Parse a port number (const fn compatible). Non-digits are skipped, zero or
/// overflow falls back to `default`.
pub const fn parse_port(s: &str, default: u16) -> u16 {
    let bytes = s.as_bytes();
    let mut result: u32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit >= b'0' && digit <= b'9' {
            result = result * 10 + (digit - b'0') as u32;
            if result > u16::MAX as u32 {
                return default;
            }
        }
        i += 1;
    }
    if result == 0 { default } else { result as u16 }
}

/// `1`/`true`/`yes` or `0`/`false`/`no`, any case. Anything else yields `default`.
pub const fn parse_flag(s: &str, default: bool) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 5 {
        return default;
    }
    let mut lower = [0u8; 5];
    let mut i = 0;
    while i < bytes.len() {
        lower[i] = bytes[i].to_ascii_lowercase();
        i += 1;
    }
    match (bytes.len(), lower) {
        (1, [b'1', ..]) | (4, [b't', b'r', b'u', b'e', _]) | (3, [b'y', b'e', b's', ..]) => true,
        (1, [b'0', ..]) | (5, [b'f', b'a', b'l', b's', b'e']) | (2, [b'n', b'o', ..]) => false,
        _ => default,
    }
}

/// Parse a signed offset in seconds, e.g. `19800` or `-18000`.
/// Anything that is not an optionally signed run of digits yields `default`.
pub const fn parse_offset(s: &str, default: i32) -> i32 {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return default;
    }
    let (negative, start) = match bytes[0] {
        b'-' => (true, 1),
        b'+' => (false, 1),
        _ => (false, 0),
    };
    if start == bytes.len() {
        return default;
    }
    let mut result: i64 = 0;
    let mut i = start;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit < b'0' || digit > b'9' {
            return default;
        }
        result = result * 10 + (digit - b'0') as i64;
        // Real offsets stay within a day
        if result > 86_400 {
            return default;
        }
        i += 1;
    }
    if negative { -(result as i32) } else { result as i32 }
}
