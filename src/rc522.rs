//! MFRC522 proximity reader on SPI2.

use core::cell::RefCell;

use embassy_embedded_hal::shared_bus::blocking::spi::SpiDevice;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use esp_hal::gpio::Output;
use esp_hal::spi::master::Spi;
use esp_hal::Blocking;
use mfrc522::comm::blocking::spi::SpiInterface;
use mfrc522::{Initialized, Mfrc522};

use crate::allowlist::CardId;
use crate::reader::CardReader;

pub type SpiBus = Mutex<NoopRawMutex, RefCell<Spi<'static, Blocking>>>;
pub type ReaderSpi = SpiDevice<'static, NoopRawMutex, Spi<'static, Blocking>, Output<'static>>;

pub struct Rc522 {
    chip: Mfrc522<SpiInterface<ReaderSpi>, Initialized>,
}

impl Rc522 {
    /// Initialize the chip. Fails if it does not answer on the bus.
    pub fn new(spi: ReaderSpi) -> Result<Self, &'static str> {
        let chip = Mfrc522::new(SpiInterface::new(spi))
            .init()
            .map_err(|_| "mfrc522 init failed")?;
        let mut reader = Self { chip };
        match reader.chip.version() {
            Ok(version) => log::info!("reader: mfrc522 version 0x{:02X}", version),
            Err(_) => log::warn!("reader: mfrc522 version read failed"),
        }
        Ok(reader)
    }
}

impl CardReader for Rc522 {
    fn poll_for_card(&mut self) -> Option<CardId> {
        // A card answers WUPA until a failed poll halts it. Left on the reader it
        // alternates: the halted poll fails, the next WUPA wakes and reads it again.
        let atqa = self.chip.wupa().ok()?;
        let uid = self.chip.select(&atqa).ok()?;

        let card = CardId::from_uid(uid.as_bytes());
        match card {
            Some(card) if card.is_truncated() => {
                log::warn!("reader: {}-byte uid, using first 4 bytes ({})", uid.as_bytes().len(), card)
            }
            Some(_) => {}
            None => log::warn!("reader: short uid ({} bytes) ignored", uid.as_bytes().len()),
        }
        card
    }

    fn reset_after_read(&mut self) {
        let _ = self.chip.hlta();
    }
}
