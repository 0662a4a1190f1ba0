//! Unit tests for card identifiers and allow-list lookup.
//!
//! Compiles allowlist.rs directly; no hardware involved.

#![allow(dead_code)]

#[path = "../src/allowlist.rs"]
mod allowlist;

use allowlist::{builtin, AllowList, AuthorizedUser, CardId, ParseCardIdError};

static DUPLICATE_USERS: [AuthorizedUser; 2] = [
    AuthorizedUser::new([0x01, 0x02, 0x03, 0x04], "First"),
    AuthorizedUser::new([0x01, 0x02, 0x03, 0x04], "Second"),
];

static NO_USERS: [AuthorizedUser; 0] = [];

// ============================================================================
// Lookup tests
// ============================================================================

#[test]
fn test_lookup_builtin_roles() {
    let allow = builtin();

    assert_eq!(allow.lookup(&CardId::new([0xAF, 0x4D, 0x99, 0x1F])), Some("Maintenance"));
    assert_eq!(allow.lookup(&CardId::new([0xBF, 0xD1, 0x07, 0x1F])), Some("Manager"));
    assert_eq!(allow.lookup(&CardId::new([0xB2, 0xF9, 0x7C, 0x00])), Some("Guest"));
}

#[test]
fn test_lookup_unknown_card() {
    let allow = builtin();
    assert_eq!(allow.lookup(&CardId::new([0x00, 0x00, 0x00, 0x00])), None);
    // One byte off
    assert_eq!(allow.lookup(&CardId::new([0xAF, 0x4D, 0x99, 0x1E])), None);
}

#[test]
fn test_lookup_first_match_wins() {
    let allow = AllowList::new(&DUPLICATE_USERS);
    assert_eq!(allow.lookup(&CardId::new([0x01, 0x02, 0x03, 0x04])), Some("First"));
}

#[test]
fn test_empty_allow_list() {
    let allow = AllowList::new(&NO_USERS);
    assert!(allow.is_empty());
    assert_eq!(allow.lookup(&CardId::new([0xAF, 0x4D, 0x99, 0x1F])), None);
}

#[test]
fn test_builtin_size() {
    let allow = builtin();
    assert_eq!(allow.len(), 3);
    assert!(!allow.is_empty());
}

// ============================================================================
// Card identifier tests
// ============================================================================

#[test]
fn test_from_uid_four_bytes() {
    let card = CardId::from_uid(&[0xAF, 0x4D, 0x99, 0x1F]).unwrap();
    assert_eq!(card.bytes(), [0xAF, 0x4D, 0x99, 0x1F]);
    assert!(!card.is_truncated());
    assert_eq!(card, CardId::new([0xAF, 0x4D, 0x99, 0x1F]));
}

#[test]
fn test_from_uid_long_uid_is_truncated_and_never_authorized() {
    // 7-byte UID whose first four bytes match an authorized card
    let card = CardId::from_uid(&[0xAF, 0x4D, 0x99, 0x1F, 0x10, 0x20, 0x30]).unwrap();
    assert!(card.is_truncated());
    assert_eq!(card.bytes(), [0xAF, 0x4D, 0x99, 0x1F]);
    assert_eq!(card.to_hex().as_str(), "AF4D991F");
    assert_eq!(builtin().lookup(&card), None);
}

#[test]
fn test_from_uid_too_short() {
    assert_eq!(CardId::from_uid(&[]), None);
    assert_eq!(CardId::from_uid(&[0x01, 0x02, 0x03]), None);
}

#[test]
fn test_hex_is_uppercase_and_zero_padded() {
    assert_eq!(CardId::new([0xaf, 0x4d, 0x99, 0x1f]).to_string(), "AF4D991F");
    assert_eq!(CardId::new([0xB2, 0xF9, 0x7C, 0x00]).to_hex().as_str(), "B2F97C00");
    assert_eq!(CardId::new([0x00, 0x00, 0x00, 0x00]).to_hex().as_str(), "00000000");
    assert_eq!(CardId::new([0x01, 0x0A, 0x00, 0x0F]).to_hex().as_str(), "010A000F");
}

#[test]
fn test_parse_card_id() {
    assert_eq!("AF4D991F".parse::<CardId>(), Ok(CardId::new([0xAF, 0x4D, 0x99, 0x1F])));
    assert_eq!("af4d991f".parse::<CardId>(), Ok(CardId::new([0xAF, 0x4D, 0x99, 0x1F])));
}

#[test]
fn test_parse_card_id_rejects_malformed() {
    assert_eq!("AF4D99".parse::<CardId>(), Err(ParseCardIdError));
    assert_eq!("AF4D991F00".parse::<CardId>(), Err(ParseCardIdError));
    assert_eq!("AF4D991G".parse::<CardId>(), Err(ParseCardIdError));
    assert_eq!("+F4D991F".parse::<CardId>(), Err(ParseCardIdError));
    assert_eq!("".parse::<CardId>(), Err(ParseCardIdError));
}
