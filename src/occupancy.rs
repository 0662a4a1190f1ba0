//! Occupancy state machine for the room's single reader slot.
//!
//! Transitions (one call to [`Occupancy::observe`] per poll):
//! - VACANT + authorized card   -> OCCUPIED, emits check-in
//! - VACANT + unknown card      -> stays VACANT, emits denied-access and security-alert
//! - OCCUPIED + any card        -> absence counter cleared, nothing emitted
//! - OCCUPIED + `threshold` consecutive absent polls -> VACANT, emits check-out
//! - VACANT + absent            -> nothing
//!
//! Transitions commit before anything is published. A lost event never leaves the
//! slot out of step with the card actually on the reader.

use heapless::Vec;

use crate::allowlist::{AllowList, CardId};
use crate::config::PresenceConfig;

/// Business event produced by a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    CheckIn { card: CardId, role: &'static str },
    CheckOut { card: CardId, role: &'static str, duration_secs: u64 },
    AccessDenied { card: CardId },
    SecurityAlert { card: CardId },
}

/// At most two events come out of a single poll (denial + alert).
pub type Events = Vec<Event, 2>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Vacant,
    Occupied,
}

/// An open check-in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session {
    pub card: CardId,
    pub role: &'static str,
    pub started_ms: u64,
}

/// Snapshot of the presence record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceState {
    pub current_card: Option<CardId>,
    pub role: Option<&'static str>,
    pub session_started_ms: Option<u64>,
    pub absent_reads: u32,
    pub checked_in: bool,
}

pub struct Occupancy {
    session: Option<Session>,
    absent_reads: u32,
    threshold: u32,
    // Unknown card still on the reader since its denial
    denied_card: Option<CardId>,
    failed_attempts: u8,
    max_failed_attempts: u8,
}

impl Occupancy {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            session: None,
            absent_reads: 0,
            threshold: config.absent_threshold.max(1) as u32,
            denied_card: None,
            failed_attempts: 0,
            max_failed_attempts: config.max_failed_attempts,
        }
    }

    /// Feed one poll result. `now_ms` is the monotonic time of this cycle.
    pub fn observe(&mut self, read: Option<CardId>, now_ms: u64, allow: &AllowList<'static>) -> Events {
        let mut events = Events::new();

        match read {
            Some(card) => {
                self.absent_reads = 0;

                if self.session.is_some() {
                    // Presence only; the open session is not re-authorized per poll
                    return events;
                }

                if self.denied_card == Some(card) {
                    log::debug!("presence: denied card {} still on reader", card);
                    return events;
                }

                match allow.lookup(&card) {
                    Some(role) => {
                        self.session = Some(Session { card, role, started_ms: now_ms });
                        self.denied_card = None;
                        self.failed_attempts = 0;
                        log::info!("presence: {} checked in (card {})", role, card);
                        let _ = events.push(Event::CheckIn { card, role });
                    }
                    None => {
                        self.denied_card = Some(card);
                        self.failed_attempts = self.failed_attempts.saturating_add(1);
                        log::warn!(
                            "presence: access DENIED for card {} (attempt {})",
                            card,
                            self.failed_attempts
                        );
                        if self.failed_attempts >= self.max_failed_attempts {
                            log::warn!(
                                "presence: {} consecutive unauthorized attempts",
                                self.failed_attempts
                            );
                        }
                        let _ = events.push(Event::AccessDenied { card });
                        let _ = events.push(Event::SecurityAlert { card });
                    }
                }
            }
            None => {
                self.absent_reads = self.absent_reads.saturating_add(1);
                if self.absent_reads < self.threshold {
                    return events;
                }

                if let Some(card) = self.denied_card.take() {
                    log::debug!("presence: denied card {} left reader", card);
                }

                if let Some(session) = self.session.take() {
                    self.absent_reads = 0;
                    let duration_secs = now_ms.saturating_sub(session.started_ms) / 1000;
                    log::info!(
                        "presence: {} checked out (card {}, {}s)",
                        session.role,
                        session.card,
                        duration_secs
                    );
                    let _ = events.push(Event::CheckOut {
                        card: session.card,
                        role: session.role,
                        duration_secs,
                    });
                }
            }
        }

        events
    }

    pub fn state(&self) -> SlotState {
        if self.session.is_some() {
            SlotState::Occupied
        } else {
            SlotState::Vacant
        }
    }

    pub fn is_checked_in(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn absent_reads(&self) -> u32 {
        self.absent_reads
    }

    pub fn failed_attempts(&self) -> u8 {
        self.failed_attempts
    }

    pub fn presence(&self) -> PresenceState {
        PresenceState {
            current_card: self.session.map(|s| s.card),
            role: self.session.map(|s| s.role),
            session_started_ms: self.session.map(|s| s.started_ms),
            absent_reads: self.absent_reads,
            checked_in: self.session.is_some(),
        }
    }
}
