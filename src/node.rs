//! Main cycle driver.
//!
//! One [`Node::tick`] per cycle, always in the same order:
//! network link, session link, session I/O, clock resync, reader poll,
//! occupancy, publish. The node owns every piece of mutable state, so nothing
//! else writes presence or connection state.

use core::fmt::Write as FmtWrite;

use crate::allowlist::AllowList;
use crate::clock::{TimeError, TimeSource, WallClock};
use crate::config::{Config, FIRMWARE_VERSION, MEMORY_CHECK_INTERVAL_MS, NTP_STARTUP_RETRY_MS, STATUS_INTERVAL_MS, WIFI_RETRY_DELAY_MS};
use crate::events::{EventKind, PublishError, Publisher};
use crate::link::{ConnectionManager, LinkEvent, Radio};
use crate::occupancy::{Event, Events, Occupancy};
use crate::reader::{CardReader, PresenceDetector};
use crate::websocket::{Transport, WsClient};

/// Board services the driver needs between cycles.
pub trait Platform {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u32);
    fn feed_watchdog(&mut self);
    /// Occupancy indicator (LED).
    fn set_indicator(&mut self, on: bool);
    fn report_memory(&mut self);
}

/// Consecutive-error counter. At the limit the driver stops feeding the watchdog.
pub struct Health {
    errors: u8,
    max_errors: u8,
    restart_logged: bool,
}

impl Health {
    pub fn new(max_errors: u8) -> Self {
        Self {
            errors: 0,
            max_errors: max_errors.max(1),
            restart_logged: false,
        }
    }

    pub fn record_error(&mut self) {
        self.errors = self.errors.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.errors = 0;
        self.restart_logged = false;
    }

    pub fn errors(&self) -> u8 {
        self.errors
    }

    pub fn restart_requested(&self) -> bool {
        self.errors >= self.max_errors
    }
}

/// What happened during one cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub events: Events,
    pub published: u8,
    pub publish_errors: u8,
    /// `Some` when a clock resync was attempted.
    pub synced: Option<bool>,
    pub network_timed_out: bool,
}

pub struct Node<R, N> {
    config: Config,
    detector: PresenceDetector<R>,
    net: N,
    conn: ConnectionManager,
    clock: WallClock,
    occupancy: Occupancy,
    allow: AllowList<'static>,
    publisher: Publisher,
    health: Health,
    last_status_ms: u64,
    last_memory_ms: u64,
}

impl<R, N> Node<R, N>
where
    R: CardReader,
    N: Radio + Transport + TimeSource,
{
    pub fn new(config: Config, reader: R, net: N, allow: AllowList<'static>, seed: u32) -> Self {
        let mut user_agent: heapless::String<64> = heapless::String::new();
        let _ = write!(user_agent, "{}/{}", config.identity.device_id(), FIRMWARE_VERSION);
        let client = WsClient::new(seed, &user_agent);

        Self {
            detector: PresenceDetector::new(reader),
            net,
            conn: ConnectionManager::new(&config.wifi, &config.broker, &config.time, client),
            clock: WallClock::new(config.time.local_offset_secs()),
            occupancy: Occupancy::new(&config.presence),
            allow,
            publisher: Publisher::new(config.identity.clone()),
            health: Health::new(config.max_error_count),
            last_status_ms: 0,
            last_memory_ms: 0,
            config,
        }
    }

    /// Bring the network up and block until the clock has synchronized once.
    /// Every event needs a timestamp, so nothing runs before this succeeds.
    pub fn bootstrap<P: Platform>(&mut self, platform: &mut P) {
        while !self.conn.network().is_up() {
            self.step_network(platform.now_ms());
            platform.feed_watchdog();
            platform.sleep_ms(WIFI_RETRY_DELAY_MS);
        }

        loop {
            match self.sync_clock(platform.now_ms()) {
                Ok(()) => break,
                Err(e) => log::warn!("clock: initial sync failed ({}), retrying in {}s", e, NTP_STARTUP_RETRY_MS / 1000),
            }

            // Keep the network alive while waiting out the retry delay
            let resume_at = platform.now_ms() + NTP_STARTUP_RETRY_MS as u64;
            while platform.now_ms() < resume_at {
                self.step_network(platform.now_ms());
                platform.feed_watchdog();
                platform.sleep_ms(WIFI_RETRY_DELAY_MS);
            }
        }

        let now_ms = platform.now_ms();
        self.last_status_ms = now_ms;
        self.last_memory_ms = now_ms;
        self.banner();
    }

    /// Run one cycle at uptime `now_ms`.
    pub fn tick(&mut self, now_ms: u64) -> CycleReport {
        let mut report = CycleReport::default();

        // 1. Network link
        report.network_timed_out = self.step_network(now_ms) == LinkEvent::TimedOut;

        // 2. Session link
        self.conn.maintain_session(&mut self.net, now_ms);

        // 3. Session I/O; inbound messages are only logged
        self.conn.service_session(&mut self.net, now_ms);

        // 4. Clock
        if let Some(result) = self.conn.maybe_resync(&mut self.net, &mut self.clock, now_ms) {
            match result {
                Ok(()) => self.health.record_success(),
                Err(_) => self.health.record_error(),
            }
            report.synced = Some(result.is_ok());
        }

        // 5. Reader and occupancy; transitions commit before publishing
        let read = self.detector.poll_once();
        report.events = self.occupancy.observe(read, now_ms, &self.allow);

        // 6. Publish
        for event in report.events.iter() {
            match self.publish(event, now_ms) {
                Ok(()) => {
                    report.published += 1;
                    self.health.record_success();
                }
                Err(e) => {
                    log::warn!("publish: dropped {} event: {}", EventKind::of(event).as_str(), e);
                    report.publish_errors += 1;
                    self.health.record_error();
                }
            }
        }

        report
    }

    /// Cycle forever. The watchdog is fed once per cycle until the error limit is hit.
    pub fn run<P: Platform>(&mut self, platform: &mut P) -> ! {
        loop {
            let now_ms = platform.now_ms();
            self.tick(now_ms);
            platform.set_indicator(self.occupancy.is_checked_in());

            if now_ms.saturating_sub(self.last_status_ms) >= STATUS_INTERVAL_MS {
                self.last_status_ms = now_ms;
                self.log_status();
            }
            if now_ms.saturating_sub(self.last_memory_ms) >= MEMORY_CHECK_INTERVAL_MS {
                self.last_memory_ms = now_ms;
                platform.report_memory();
            }

            if self.health.restart_requested() {
                if !self.health.restart_logged {
                    log::error!(
                        "health: {} consecutive errors, letting the watchdog reset the node",
                        self.health.errors()
                    );
                    self.health.restart_logged = true;
                }
            } else {
                platform.feed_watchdog();
            }

            platform.sleep_ms(self.config.presence.poll_interval_ms);
        }
    }

    fn step_network(&mut self, now_ms: u64) -> LinkEvent {
        self.net.poll(now_ms);
        let event = self.conn.maintain_network(&mut self.net, now_ms);
        match event {
            LinkEvent::Up => self.health.record_success(),
            LinkEvent::TimedOut => self.health.record_error(),
            LinkEvent::None | LinkEvent::Lost => {}
        }
        event
    }

    fn sync_clock(&mut self, now_ms: u64) -> Result<(), TimeError> {
        let result = self.conn.sync_now(&mut self.net, &mut self.clock, now_ms);
        match result {
            Ok(()) => self.health.record_success(),
            Err(_) => self.health.record_error(),
        }
        result
    }

    fn publish(&mut self, event: &Event, now_ms: u64) -> Result<(), PublishError> {
        let timestamp = self.clock.timestamp(now_ms);
        self.publisher.publish(&mut self.conn, &mut self.net, event, &timestamp)
    }

    fn banner(&self) {
        let identity = &self.config.identity;
        let broker = &self.config.broker;
        log::info!("====================");
        log::info!("room {} access control ({})", identity.room, identity.device_id());
        log::info!("building {}, hotel {}", identity.building, identity.hotel_id);
        log::info!("broker: {}://{}:{}{}", broker.scheme(), broker.host, broker.port, broker.path);
        log::info!("allow-list: {} users", self.allow.len());
        log::info!("====================");
        log::info!("ready to read cards");
    }

    fn log_status(&self) {
        let presence = self.occupancy.presence();
        let state = self.conn.state();
        log::info!(
            "status: occupied={} absent_reads={} wifi={} ws={} clock={} errors={}",
            presence.checked_in,
            presence.absent_reads,
            self.conn.network().state().as_str(),
            if state.session_up { "up" } else { self.conn.session().state().as_str() },
            if self.clock.is_synchronized() { "synced" } else { "unsynced" },
            self.health.errors()
        );
    }

    pub fn occupancy(&self) -> &Occupancy {
        &self.occupancy
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.conn
    }

    pub fn clock(&self) -> &WallClock {
        &self.clock
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut N {
        &mut self.net
    }

    pub fn reader_mut(&mut self) -> &mut R {
        self.detector.reader_mut()
    }
}
