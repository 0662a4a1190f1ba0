//! Raw card sampling. One poll per main cycle, no debouncing here.

use crate::allowlist::CardId;

/// Proximity-card reader driver, as seen by the presence logic.
pub trait CardReader {
    /// Wake any card in the field and read its serial. `None` if no card answered
    /// or the serial read failed.
    fn poll_for_card(&mut self) -> Option<CardId>;

    /// Close the current transaction so the next poll starts clean.
    fn reset_after_read(&mut self);
}

/// Wraps a reader into a per-poll present/absent sample.
pub struct PresenceDetector<R> {
    reader: R,
}

impl<R: CardReader> PresenceDetector<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Sample the reader once.
    ///
    /// On the absent path the reader is always halted, whether nothing answered
    /// or the serial read failed part way.
    pub fn poll_once(&mut self) -> Option<CardId> {
        match self.reader.poll_for_card() {
            Some(card) => Some(card),
            None => {
                self.reader.reset_after_read();
                None
            }
        }
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}
