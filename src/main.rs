//! Room access node - ESP32 firmware for per-room card presence tracking.
//!
//! Architecture:
//! - One cooperative loop (`node`) owns all presence and connection state
//! - MFRC522 reader on SPI2 (`rc522`), Wi-Fi + smoltcp (`net`)
//! - Check-in/check-out and security events are published to the broker over a
//!   WebSocket session (`websocket`, `events`)

#![no_std]
#![no_main]

use esp_bootloader_esp_idf::esp_app_desc;
esp_app_desc!();

mod allowlist;
mod clock;
mod config;
mod events;
mod heap_debug;
mod link;
mod net;
mod node;
mod occupancy;
mod rc522;
mod reader;
mod websocket;

extern crate alloc;

use core::cell::RefCell;
use core::mem::MaybeUninit;
use critical_section::Mutex;
use embassy_embedded_hal::shared_bus::blocking::spi::SpiDevice;
use esp_alloc as _;
use esp_hal::{
    clock::CpuClock,
    gpio::{Level, Output, OutputConfig},
    main,
    rng::Rng,
    spi::{master::Spi, Mode as SpiMode},
    time::{Duration, Instant, Rate},
    timer::timg::{TimerGroup, Wdt},
};
use esp_println::logger::init_logger;
use esp_radio::wifi::Config as WifiConfig;
use static_cell::StaticCell;

use crate::config::{Config, DEVICE_TYPE, FIRMWARE_VERSION};
use crate::net::NetStack;
use crate::node::{Node, Platform};
use crate::rc522::{Rc522, SpiBus};

const HEAP_SIZE: usize = 72 * 1024;
const READER_SPI_HZ: u32 = 1_000_000;

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static READER_BUS: StaticCell<SpiBus> = StaticCell::new();

// Watchdog timer
pub(crate) static WATCHDOG: Mutex<RefCell<Option<Wdt<esp_hal::peripherals::TIMG1>>>> =
    Mutex::new(RefCell::new(None));

/// Feed the watchdog timer.
/// This should be called during long-running operations to prevent watchdog reset.
pub fn feed_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.feed();
        }
    });
}

/// Board services for the main cycle.
struct Board {
    led: Output<'static>,
}

impl Platform for Board {
    fn now_ms(&self) -> u64 {
        Instant::now().duration_since_epoch().as_millis()
    }

    fn sleep_ms(&mut self, ms: u32) {
        // usleep lets the Wi-Fi driver tasks run
        esp_radio_rtos_driver::usleep(ms * 1000);
    }

    fn feed_watchdog(&mut self) {
        feed_watchdog();
    }

    fn set_indicator(&mut self, on: bool) {
        self.led.set_level(if on { Level::High } else { Level::Low });
    }

    fn report_memory(&mut self) {
        heap_debug::report("periodic");
    }
}

#[main]
fn main() -> ! {
    // Initialize logging
    init_logger(log::LevelFilter::Info);
    let config = Config::get();
    log::info!(
        "room-access-node {} ({}) starting as {}",
        FIRMWARE_VERSION,
        DEVICE_TYPE,
        config.identity.device_id()
    );

    // Initialize heap (the radio driver allocates)
    static mut HEAP: MaybeUninit<[u8; HEAP_SIZE]> = MaybeUninit::uninit();
    unsafe {
        esp_alloc::HEAP.add_region(esp_alloc::HeapRegion::new(
            core::ptr::addr_of_mut!(HEAP) as *mut u8,
            HEAP_SIZE,
            esp_alloc::MemoryCapability::Internal.into(),
        ));
    }

    // Hardware init
    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    // Start the esp-rtos scheduler (required before esp_radio::init)
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Initialize watchdog timer on TIMG1 (TIMG0 is used by the scheduler)
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut wdt = timg1.wdt;
    wdt.enable();
    wdt.set_timeout(
        esp_hal::timer::timg::MwdtStage::Stage0,
        Duration::from_secs(30),
    );
    critical_section::with(|cs| {
        WATCHDOG
            .borrow_ref_mut(cs)
            .replace(unsafe { core::mem::transmute(wdt) });
    });

    // Wi-Fi station
    let radio = RADIO.init(esp_radio::init().unwrap());
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio, peripherals.WIFI, WifiConfig::default()).unwrap();

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let net = NetStack::new(wifi_controller, interfaces.sta, seed, config.broker.secure);

    // MFRC522 on SPI2 (SCK=18, MOSI=23, MISO=19, SS=21, RST=22)
    let spi = Spi::new(
        peripherals.SPI2,
        esp_hal::spi::master::Config::default()
            .with_frequency(Rate::from_hz(READER_SPI_HZ))
            .with_mode(SpiMode::_0),
    )
    .unwrap()
    .with_sck(peripherals.GPIO18)
    .with_mosi(peripherals.GPIO23)
    .with_miso(peripherals.GPIO19);
    let bus = READER_BUS.init(embassy_sync::blocking_mutex::Mutex::new(RefCell::new(spi)));
    let cs = Output::new(peripherals.GPIO21, Level::High, OutputConfig::default());
    // Held high for the life of the program; low puts the chip in reset
    let _reader_rst = Output::new(peripherals.GPIO22, Level::High, OutputConfig::default());
    let reader = Rc522::new(SpiDevice::new(bus, cs)).unwrap();

    // Occupancy LED (GPIO2)
    let led = Output::new(peripherals.GPIO2, Level::Low, OutputConfig::default());
    let mut board = Board { led };

    heap_debug::log_heap_stats("startup");

    let mut node = Node::new(config, reader, net, allowlist::builtin(), rng.random());
    node.bootstrap(&mut board);
    node.run(&mut board)
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    critical_section::with(|_| {
        log::error!("PANIC: {}", info);
    });

    // Spin without feeding watchdog. The 30s timeout will trigger a full system reset.
    loop {
        core::hint::spin_loop();
    }
}
