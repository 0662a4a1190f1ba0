//! Unit tests for the occupancy state machine and the presence detector.
//!
//! Compiles occupancy.rs and reader.rs directly and feeds them scripted reads.

#![allow(dead_code)]

#[path = "../src/allowlist.rs"]
mod allowlist;
#[path = "../src/config.rs"]
mod config;
#[path = "../src/occupancy.rs"]
mod occupancy;
#[path = "../src/reader.rs"]
mod reader;

use std::collections::VecDeque;

use allowlist::{builtin, CardId};
use config::PresenceConfig;
use occupancy::{Event, Occupancy, SlotState};
use reader::{CardReader, PresenceDetector};

const MAINTENANCE: CardId = CardId::new([0xAF, 0x4D, 0x99, 0x1F]);
const MANAGER: CardId = CardId::new([0xBF, 0xD1, 0x07, 0x1F]);
const UNKNOWN: CardId = CardId::new([0x00, 0x00, 0x00, 0x00]);
const OTHER_UNKNOWN: CardId = CardId::new([0xDE, 0xAD, 0xBE, 0xEF]);

fn presence_config(threshold: u8) -> PresenceConfig {
    PresenceConfig {
        absent_threshold: threshold,
        max_failed_attempts: 5,
        poll_interval_ms: 100,
    }
}

fn new_occupancy() -> Occupancy {
    Occupancy::new(&presence_config(5))
}

/// Feed `n` absent polls starting at `start_ms`, 100 ms apart. Returns all events.
fn absent_polls(occ: &mut Occupancy, n: u32, start_ms: u64) -> Vec<Event> {
    let allow = builtin();
    let mut events = Vec::new();
    for i in 0..n {
        events.extend(occ.observe(None, start_ms + i as u64 * 100, &allow));
    }
    events
}

// ============================================================================
// Check-in tests
// ============================================================================

#[test]
fn test_authorized_card_checks_in() {
    let mut occ = new_occupancy();
    let events = occ.observe(Some(MAINTENANCE), 1_000, &builtin());

    assert_eq!(events.as_slice(), &[Event::CheckIn { card: MAINTENANCE, role: "Maintenance" }]);
    assert_eq!(occ.state(), SlotState::Occupied);

    let session = occ.session().unwrap();
    assert_eq!(session.card, MAINTENANCE);
    assert_eq!(session.role, "Maintenance");
    assert_eq!(session.started_ms, 1_000);
}

#[test]
fn test_each_builtin_role_checks_in() {
    for (card, role) in [(MAINTENANCE, "Maintenance"), (MANAGER, "Manager")] {
        let mut occ = new_occupancy();
        let events = occ.observe(Some(card), 0, &builtin());
        assert_eq!(events.as_slice(), &[Event::CheckIn { card, role }]);
    }
}

#[test]
fn test_repeated_presence_while_occupied_is_idempotent() {
    let mut occ = new_occupancy();
    occ.observe(Some(MAINTENANCE), 1_000, &builtin());

    for t in 1..50 {
        let events = occ.observe(Some(MAINTENANCE), 1_000 + t * 100, &builtin());
        assert!(events.is_empty());
    }

    assert_eq!(occ.session().unwrap().started_ms, 1_000);
    assert!(occ.is_checked_in());
}

#[test]
fn test_other_card_while_occupied_only_resets_absence() {
    let mut occ = new_occupancy();
    occ.observe(Some(MAINTENANCE), 0, &builtin());
    absent_polls(&mut occ, 3, 100);
    assert_eq!(occ.absent_reads(), 3);

    let events = occ.observe(Some(UNKNOWN), 400, &builtin());
    assert!(events.is_empty());
    assert_eq!(occ.absent_reads(), 0);
    assert_eq!(occ.session().unwrap().card, MAINTENANCE);
}

// ============================================================================
// Debounce / check-out tests
// ============================================================================

#[test]
fn test_fewer_than_threshold_absences_keep_session() {
    let mut occ = new_occupancy();
    occ.observe(Some(MAINTENANCE), 0, &builtin());

    let events = absent_polls(&mut occ, 4, 100);
    assert!(events.is_empty());
    assert_eq!(occ.state(), SlotState::Occupied);
    assert_eq!(occ.absent_reads(), 4);
}

#[test]
fn test_threshold_absences_check_out_once() {
    let mut occ = new_occupancy();
    occ.observe(Some(MAINTENANCE), 0, &builtin());

    absent_polls(&mut occ, 4, 100);
    let events = occ.observe(None, 500, &builtin());
    assert_eq!(
        events.as_slice(),
        &[Event::CheckOut {
            card: MAINTENANCE,
            role: "Maintenance",
            duration_secs: 0,
        }]
    );
    assert_eq!(occ.state(), SlotState::Vacant);
    assert_eq!(occ.absent_reads(), 0);

    // Further absences emit nothing
    assert!(absent_polls(&mut occ, 20, 600).is_empty());
}

#[test]
fn test_presence_interrupting_absences_restarts_count() {
    let mut occ = new_occupancy();
    occ.observe(Some(MAINTENANCE), 0, &builtin());

    absent_polls(&mut occ, 4, 100);
    occ.observe(Some(MAINTENANCE), 500, &builtin());
    let events = absent_polls(&mut occ, 4, 600);

    assert!(events.is_empty());
    assert!(occ.is_checked_in());
}

#[test]
fn test_checkout_duration_floors_to_seconds() {
    let mut occ = new_occupancy();
    occ.observe(Some(MANAGER), 1_000, &builtin());

    absent_polls(&mut occ, 4, 2_000);
    let events = occ.observe(None, 1_000 + 12_999, &builtin());
    assert_eq!(
        events.as_slice(),
        &[Event::CheckOut {
            card: MANAGER,
            role: "Manager",
            duration_secs: 12,
        }]
    );
}

#[test]
fn test_threshold_of_one_checks_out_on_first_miss() {
    let mut occ = Occupancy::new(&presence_config(1));
    occ.observe(Some(MAINTENANCE), 0, &builtin());

    let events = occ.observe(None, 3_000, &builtin());
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Event::CheckOut { duration_secs: 3, .. }));
}

#[test]
fn test_card_can_check_in_again_after_checkout() {
    let mut occ = new_occupancy();
    occ.observe(Some(MAINTENANCE), 0, &builtin());
    absent_polls(&mut occ, 5, 100);

    let events = occ.observe(Some(MAINTENANCE), 10_000, &builtin());
    assert_eq!(events.as_slice(), &[Event::CheckIn { card: MAINTENANCE, role: "Maintenance" }]);
    assert_eq!(occ.session().unwrap().started_ms, 10_000);
}

#[test]
fn test_vacant_absence_is_noop() {
    let mut occ = new_occupancy();
    let events = absent_polls(&mut occ, 10, 0);
    assert!(events.is_empty());
    assert_eq!(occ.state(), SlotState::Vacant);
    assert!(occ.session().is_none());
}

// ============================================================================
// Unauthorized card tests
// ============================================================================

#[test]
fn test_unknown_card_denied_with_alert() {
    let mut occ = new_occupancy();
    let events = occ.observe(Some(UNKNOWN), 0, &builtin());

    assert_eq!(
        events.as_slice(),
        &[Event::AccessDenied { card: UNKNOWN }, Event::SecurityAlert { card: UNKNOWN }]
    );
    assert_eq!(occ.state(), SlotState::Vacant);
    assert_eq!(occ.failed_attempts(), 1);
}

#[test]
fn test_denied_card_left_on_reader_reported_once() {
    let mut occ = new_occupancy();
    let allow = builtin();
    let mut denials = 0;

    // A card resting on the reader alternates present/absent reads
    for i in 0..20u64 {
        let read = if i % 2 == 0 { Some(UNKNOWN) } else { None };
        denials += occ
            .observe(read, i * 100, &allow)
            .iter()
            .filter(|e| matches!(e, Event::AccessDenied { .. }))
            .count();
    }

    assert_eq!(denials, 1);
    assert_eq!(occ.failed_attempts(), 1);
}

#[test]
fn test_denied_card_reported_again_after_removal() {
    let mut occ = new_occupancy();
    occ.observe(Some(UNKNOWN), 0, &builtin());
    absent_polls(&mut occ, 5, 100);

    let events = occ.observe(Some(UNKNOWN), 1_000, &builtin());
    assert_eq!(events.len(), 2);
    assert_eq!(occ.failed_attempts(), 2);
}

#[test]
fn test_different_unknown_card_reported_immediately() {
    let mut occ = new_occupancy();
    occ.observe(Some(UNKNOWN), 0, &builtin());

    let events = occ.observe(Some(OTHER_UNKNOWN), 100, &builtin());
    assert_eq!(
        events.as_slice(),
        &[
            Event::AccessDenied { card: OTHER_UNKNOWN },
            Event::SecurityAlert { card: OTHER_UNKNOWN }
        ]
    );
}

#[test]
fn test_checkin_clears_failed_attempts() {
    let mut occ = new_occupancy();
    occ.observe(Some(UNKNOWN), 0, &builtin());
    occ.observe(Some(OTHER_UNKNOWN), 100, &builtin());
    assert_eq!(occ.failed_attempts(), 2);

    occ.observe(Some(MAINTENANCE), 200, &builtin());
    assert_eq!(occ.failed_attempts(), 0);
    assert!(occ.is_checked_in());
}

#[test]
fn test_truncated_uid_is_denied() {
    let mut occ = new_occupancy();
    let card = CardId::from_uid(&[0xAF, 0x4D, 0x99, 0x1F, 0x01, 0x02, 0x03]).unwrap();

    let events = occ.observe(Some(card), 0, &builtin());
    assert_eq!(events.as_slice(), &[Event::AccessDenied { card }, Event::SecurityAlert { card }]);
    assert!(!occ.is_checked_in());
}

// ============================================================================
// Presence record invariant
// ============================================================================

#[test]
fn test_presence_fields_set_and_cleared_together() {
    let mut occ = new_occupancy();
    let allow = builtin();
    let script = [
        Some(UNKNOWN),
        None,
        Some(MAINTENANCE),
        None,
        None,
        Some(MANAGER),
        None,
        None,
        None,
        None,
        None,
        None,
    ];

    for (i, read) in script.iter().enumerate() {
        occ.observe(*read, i as u64 * 100, &allow);
        let p = occ.presence();
        if p.checked_in {
            assert!(p.current_card.is_some());
            assert!(p.role.is_some());
            assert!(p.session_started_ms.is_some());
        } else {
            assert!(p.current_card.is_none());
            assert!(p.role.is_none());
            assert!(p.session_started_ms.is_none());
        }
    }
}

// ============================================================================
// Presence detector tests
// ============================================================================

struct ScriptedReader {
    script: VecDeque<Option<CardId>>,
    resets: u32,
}

impl CardReader for ScriptedReader {
    fn poll_for_card(&mut self) -> Option<CardId> {
        self.script.pop_front().flatten()
    }

    fn reset_after_read(&mut self) {
        self.resets += 1;
    }
}

#[test]
fn test_detector_halts_reader_on_absent_path() {
    let reader = ScriptedReader {
        script: VecDeque::from([None, Some(MAINTENANCE), None]),
        resets: 0,
    };
    let mut detector = PresenceDetector::new(reader);

    assert_eq!(detector.poll_once(), None);
    assert_eq!(detector.reader().resets, 1);

    assert_eq!(detector.poll_once(), Some(MAINTENANCE));
    assert_eq!(detector.reader().resets, 1);

    assert_eq!(detector.poll_once(), None);
    assert_eq!(detector.reader().resets, 2);
}
