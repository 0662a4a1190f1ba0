//! Wall-clock time for event timestamps.
//!
//! The node has no RTC. After an SNTP exchange the UTC time is anchored to the
//! monotonic uptime counter, and local time is extrapolated from that anchor
//! until the next sync.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use core::fmt::Write as FmtWrite;
use heapless::String as HString;

/// Rendered when no synchronized time is available.
pub const TIMESTAMP_SENTINEL: &str = "1970-01-01 00:00:00";

/// `YYYY-MM-DD HH:MM:SS`
pub type Timestamp = HString<19>;

pub const NTP_PORT: u16 = 123;
pub const NTP_PACKET_LEN: usize = 48;

// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// A clock reading below this was never set.
pub const MIN_PLAUSIBLE_UNIX_SECS: u64 = 16 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    #[error("network unavailable")]
    NetworkDown,
    #[error("could not resolve server")]
    Resolve,
    #[error("no reply within the poll budget")]
    Timeout,
    #[error("truncated reply")]
    Truncated,
    #[error("reply is not from a server")]
    BadMode,
    #[error("kiss-o'-death from server")]
    KissOfDeath,
    #[error("server clock unsynchronized")]
    Unsynchronized,
    #[error("reply earlier than any plausible time")]
    Implausible,
}

/// A time reply together with the uptime at which it arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSample {
    pub unix_secs: u64,
    pub mono_ms: u64,
}

/// Something that can ask a time server for the current UTC time.
pub trait TimeSource {
    /// Query one server. Blocks for a bounded number of polls at most.
    fn query_time(&mut self, server: &str) -> Result<TimeSample, TimeError>;
}

/// SNTP client request (LI=0, VN=4, Mode=3).
pub fn sntp_request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = 0x23;
    packet
}

/// Extract the server transmit time from an SNTP reply, as Unix seconds.
pub fn parse_sntp_reply(buf: &[u8]) -> Result<u64, TimeError> {
    if buf.len() < NTP_PACKET_LEN {
        return Err(TimeError::Truncated);
    }

    let mode = buf[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(TimeError::BadMode);
    }

    if buf[1] == 0 {
        return Err(TimeError::KissOfDeath);
    }

    let ntp_secs = u32::from_be_bytes([buf[40], buf[41], buf[42], buf[43]]) as u64;
    if ntp_secs == 0 {
        return Err(TimeError::Unsynchronized);
    }

    // Era 1 starts in 2036; small values wrap past it
    let unix = if ntp_secs >= NTP_UNIX_OFFSET_SECS {
        ntp_secs - NTP_UNIX_OFFSET_SECS
    } else {
        ntp_secs + (1u64 << 32) - NTP_UNIX_OFFSET_SECS
    };
    Ok(unix)
}

/// Render a calendar time as `YYYY-MM-DD HH:MM:SS`.
pub fn format_timestamp(time: &NaiveDateTime) -> Timestamp {
    let mut s = Timestamp::new();
    let _ = write!(
        s,
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    );
    s
}

#[derive(Clone, Copy, Debug)]
struct Anchor {
    unix_secs: u64,
    mono_ms: u64,
}

pub struct WallClock {
    anchor: Option<Anchor>,
    offset_secs: i32,
}

impl WallClock {
    /// `offset_secs` is UTC offset plus daylight offset.
    pub fn new(offset_secs: i32) -> Self {
        Self { anchor: None, offset_secs }
    }

    /// Try each server in order; the first plausible reply re-anchors the clock.
    /// On failure the previous anchor (if any) is kept.
    pub fn synchronize<T: TimeSource>(&mut self, source: &mut T, servers: &[&str]) -> Result<(), TimeError> {
        let mut last_error = TimeError::Timeout;

        for server in servers {
            match source.query_time(server) {
                Ok(sample) if sample.unix_secs >= MIN_PLAUSIBLE_UNIX_SECS => {
                    self.anchor = Some(Anchor {
                        unix_secs: sample.unix_secs,
                        mono_ms: sample.mono_ms,
                    });
                    log::info!(
                        "clock: synced via {}, local time {}",
                        server,
                        self.timestamp(sample.mono_ms)
                    );
                    return Ok(());
                }
                Ok(sample) => {
                    log::warn!("clock: {} replied with unset time {}", server, sample.unix_secs);
                    last_error = TimeError::Implausible;
                }
                Err(e) => {
                    log::warn!("clock: {} failed: {}", server, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    pub fn is_synchronized(&self) -> bool {
        self.anchor.is_some()
    }

    /// UTC seconds since the epoch at uptime `now_ms`.
    pub fn utc_secs(&self, now_ms: u64) -> Option<u64> {
        let anchor = self.anchor?;
        let elapsed_secs = now_ms.saturating_sub(anchor.mono_ms) / 1000;
        Some(anchor.unix_secs + elapsed_secs)
    }

    /// Local calendar time at uptime `now_ms`, if the clock has been synchronized.
    pub fn now(&self, now_ms: u64) -> Option<NaiveDateTime> {
        let local = self.utc_secs(now_ms)? as i64 + self.offset_secs as i64;
        DateTime::from_timestamp(local, 0).map(|dt| dt.naive_utc())
    }

    /// Formatted local time, or the sentinel when unavailable.
    pub fn timestamp(&self, now_ms: u64) -> Timestamp {
        match self.now(now_ms) {
            Some(time) => format_timestamp(&time),
            None => {
                let mut s = Timestamp::new();
                let _ = s.push_str(TIMESTAMP_SENTINEL);
                s
            }
        }
    }
}
