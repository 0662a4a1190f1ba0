//! Card identifiers and the static allow-list of authorized users.

use core::fmt;
use core::str::FromStr;

pub const MAX_USERS: usize = 50;

/// Four-byte card identifier as read from the reader.
///
/// Cards with longer UIDs (7 or 10 bytes) are carried by their first four bytes
/// and flagged `truncated`. A truncated identifier never compares equal to an
/// allow-list entry, so it can only ever be denied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CardId {
    bytes: [u8; 4],
    truncated: bool,
}

impl CardId {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self { bytes, truncated: false }
    }

    /// Build from a raw UID of any length. Returns `None` for UIDs shorter than 4 bytes.
    pub fn from_uid(uid: &[u8]) -> Option<Self> {
        if uid.len() < 4 {
            return None;
        }
        Some(Self {
            bytes: [uid[0], uid[1], uid[2], uid[3]],
            truncated: uid.len() != 4,
        })
    }

    pub const fn bytes(&self) -> [u8; 4] {
        self.bytes
    }

    pub const fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// 8-character uppercase hex form used in payloads.
    pub fn to_hex(&self) -> heapless::String<8> {
        use core::fmt::Write as FmtWrite;
        let mut s = heapless::String::new();
        let _ = write!(s, "{}", self);
        s
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.bytes;
        write!(f, "{:02X}{:02X}{:02X}{:02X}", a, b, c, d)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("card id must be 8 hex digits")]
pub struct ParseCardIdError;

impl FromStr for CardId {
    type Err = ParseCardIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseCardIdError);
        }
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ParseCardIdError)?;
        }
        Ok(Self::new(bytes))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthorizedUser {
    pub card: CardId,
    pub role: &'static str,
}

impl AuthorizedUser {
    pub const fn new(card: [u8; 4], role: &'static str) -> Self {
        Self { card: CardId::new(card), role }
    }
}

/// Users allowed into this room.
pub static AUTHORIZED_USERS: [AuthorizedUser; 3] = [
    AuthorizedUser::new([0xAF, 0x4D, 0x99, 0x1F], "Maintenance"),
    AuthorizedUser::new([0xBF, 0xD1, 0x07, 0x1F], "Manager"),
    AuthorizedUser::new([0xB2, 0xF9, 0x7C, 0x00], "Guest"),
];

/// Ordered allow-list with first-match lookup.
#[derive(Clone, Copy, Debug)]
pub struct AllowList<'a> {
    users: &'a [AuthorizedUser],
}

impl<'a> AllowList<'a> {
    pub const fn new(users: &'a [AuthorizedUser]) -> Self {
        assert!(users.len() <= MAX_USERS, "allow-list exceeds MAX_USERS");
        Self { users }
    }

    /// Role of the first user whose card matches `id` exactly.
    pub fn lookup(&self, id: &CardId) -> Option<&'a str> {
        self.users.iter().find(|user| user.card == *id).map(|user| user.role)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// The allow-list compiled into this firmware.
pub fn builtin() -> AllowList<'static> {
    AllowList::new(&AUTHORIZED_USERS)
}
