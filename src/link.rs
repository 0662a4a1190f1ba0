//! Connection maintenance: network link, broker session, clock resync.
//!
//! Both links follow `DOWN -> CONNECTING -> UP`. The session link is only ever
//! attempted while the network link is up, and the clock is only resynchronized
//! over an up network link.

use crate::clock::{TimeError, TimeSource, WallClock};
use crate::config::{BrokerConfig, TimeConfig, WifiConfig};
use crate::websocket::{ChannelError, ChannelEvent, ChannelEvents, Transport, WsClient};

pub const MAX_RETRIES_BEFORE_RESET: u8 = 3;
pub const RESET_COOLDOWN_MS: u64 = 5_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Connecting,
    Up,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Down => "down",
            LinkState::Connecting => "connecting",
            LinkState::Up => "up",
        }
    }
}

/// Outcome of one network maintenance step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    None,
    Up,
    TimedOut,
    Lost,
}

/// Wi-Fi station plus IP stack, as seen by the link policy.
pub trait Radio {
    /// Drive the IP stack (DHCP, sockets). Called at the start of every cycle.
    fn poll(&mut self, now_ms: u64);
    /// (Re)configure the station and start associating. Must not block for long.
    fn begin_connect(&mut self, ssid: &str, password: &str);
    fn is_associated(&self) -> bool;
    /// Holding a DHCP lease.
    fn has_address(&self) -> bool;
    /// Stop the radio so the next connect starts from a clean driver state.
    fn power_cycle(&mut self);
}

// ============================================================================
// Network link
// ============================================================================

/// Wi-Fi connection state machine.
pub struct NetworkLink {
    state: LinkState,
    ssid: &'static str,
    password: &'static str,
    connect_timeout_ms: u64,
    connect_started: u64,
    retry_count: u8,
    cooldown_until: u64,
}

impl NetworkLink {
    pub fn new(config: &WifiConfig) -> Self {
        Self {
            state: LinkState::Down,
            ssid: config.ssid,
            password: config.password,
            connect_timeout_ms: config.connect_timeout_ms,
            connect_started: 0,
            retry_count: 0,
            cooldown_until: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == LinkState::Up
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn maintain<R: Radio>(&mut self, radio: &mut R, now_ms: u64) -> LinkEvent {
        match self.state {
            LinkState::Down => {
                if now_ms < self.cooldown_until {
                    // Still cooling down after a radio reset
                    return LinkEvent::None;
                }
                log::info!("wifi: connecting to {}", self.ssid);
                radio.begin_connect(self.ssid, self.password);
                self.state = LinkState::Connecting;
                self.connect_started = now_ms;
                LinkEvent::None
            }
            LinkState::Connecting => {
                if radio.is_associated() && radio.has_address() {
                    log::info!("wifi: connected");
                    self.state = LinkState::Up;
                    self.retry_count = 0;
                    return LinkEvent::Up;
                }
                if now_ms.saturating_sub(self.connect_started) <= self.connect_timeout_ms {
                    return LinkEvent::None;
                }

                self.retry_count = self.retry_count.saturating_add(1);
                log::warn!(
                    "wifi: connection timeout (attempt {}/{})",
                    self.retry_count,
                    MAX_RETRIES_BEFORE_RESET
                );
                if self.retry_count >= MAX_RETRIES_BEFORE_RESET {
                    log::warn!("wifi: power-cycling radio after {} failures", self.retry_count);
                    radio.power_cycle();
                    self.retry_count = 0;
                    self.cooldown_until = now_ms + RESET_COOLDOWN_MS;
                }
                self.state = LinkState::Down;
                LinkEvent::TimedOut
            }
            LinkState::Up => {
                if !radio.is_associated() {
                    log::warn!("wifi: disconnected, will power-cycle radio");
                    radio.power_cycle();
                    self.cooldown_until = now_ms + RESET_COOLDOWN_MS;
                    self.state = LinkState::Down;
                    LinkEvent::Lost
                } else if !radio.has_address() {
                    log::warn!("wifi: lease lost, waiting for dhcp");
                    self.state = LinkState::Connecting;
                    self.connect_started = now_ms;
                    LinkEvent::Lost
                } else {
                    LinkEvent::None
                }
            }
        }
    }
}

// ============================================================================
// Session link
// ============================================================================

/// Broker session on top of the network link, with reconnect pacing.
pub struct SessionLink {
    state: LinkState,
    client: WsClient,
    broker: BrokerConfig,
    // Earliest uptime at which another connect may start
    retry_after: u64,
}

impl SessionLink {
    pub fn new(broker: &BrokerConfig, client: WsClient) -> Self {
        let mut client = client;
        client.enable_heartbeat(broker.heartbeat);
        Self {
            state: LinkState::Down,
            client,
            broker: broker.clone(),
            retry_after: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == LinkState::Up && self.client.is_open()
    }

    pub fn maintain<T: Transport>(&mut self, transport: &mut T, network_up: bool, now_ms: u64) {
        if !network_up {
            if self.state != LinkState::Down {
                log::warn!("ws: network down, dropping session");
                self.client.reset(transport);
                self.demote(now_ms);
            }
            return;
        }

        if self.state != LinkState::Down || now_ms < self.retry_after {
            return;
        }

        self.retry_after = now_ms + self.broker.reconnect_interval_ms;
        match self.client.connect(transport, &self.broker, now_ms) {
            Ok(()) => self.state = LinkState::Connecting,
            Err(e) => log::warn!("ws: connect failed: {}", e),
        }
    }

    /// Move the client along and fill `events` with what happened.
    pub fn service<T: Transport>(&mut self, transport: &mut T, now_ms: u64, events: &mut ChannelEvents) {
        self.client.service(transport, now_ms, events);
    }

    /// Apply one drained channel event to the link state.
    pub fn apply(&mut self, event: &ChannelEvent, now_ms: u64) {
        match event {
            ChannelEvent::Connected => {
                log::info!("ws: session up");
                self.state = LinkState::Up;
            }
            ChannelEvent::Disconnected => {
                log::warn!("ws: session down");
                self.demote(now_ms);
            }
            ChannelEvent::Error(e) => {
                log::warn!("ws: session error: {}", e);
                self.demote(now_ms);
            }
            ChannelEvent::Text(text) => log::info!("ws: received {}", text),
            ChannelEvent::Pong => log::debug!("ws: pong"),
        }
    }

    pub fn send<T: Transport>(&mut self, transport: &mut T, text: &str) -> Result<(), ChannelError> {
        if self.state != LinkState::Up {
            return Err(ChannelError::NotConnected);
        }
        let result = self.client.send_text(transport, text);
        if self.client.is_closed() {
            // A failed write tears the stream down; reconnect on the next cycle
            self.state = LinkState::Down;
        }
        result
    }

    fn demote(&mut self, now_ms: u64) {
        self.state = LinkState::Down;
        self.retry_after = now_ms + self.broker.reconnect_interval_ms;
    }
}

// ============================================================================
// Clock resync gating
// ============================================================================

/// Fires once per interval after a successful sync, and after the shorter
/// retry delay when the last attempt failed.
pub struct SyncSchedule {
    interval_ms: u64,
    retry_ms: u64,
    last_attempt: Option<u64>,
    last_failed: bool,
}

impl SyncSchedule {
    pub fn new(interval_ms: u64, retry_ms: u64) -> Self {
        Self {
            interval_ms,
            retry_ms,
            last_attempt: None,
            last_failed: false,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        let wait_ms = if self.last_failed { self.retry_ms } else { self.interval_ms };
        match self.last_attempt {
            Some(last) => now_ms.saturating_sub(last) >= wait_ms,
            None => true,
        }
    }

    pub fn record(&mut self, now_ms: u64, succeeded: bool) {
        self.last_attempt = Some(now_ms);
        self.last_failed = !succeeded;
    }

    pub fn last_attempt(&self) -> Option<u64> {
        self.last_attempt
    }
}

// ============================================================================
// Connection manager
// ============================================================================

/// Live connection status, rebuilt on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionState {
    pub network_up: bool,
    pub session_up: bool,
    pub last_sync_attempt_ms: Option<u64>,
}

pub struct ConnectionManager {
    network: NetworkLink,
    session: SessionLink,
    sync: SyncSchedule,
    servers: [&'static str; 3],
    events: ChannelEvents,
}

impl ConnectionManager {
    pub fn new(wifi: &WifiConfig, broker: &BrokerConfig, time: &TimeConfig, client: WsClient) -> Self {
        Self {
            network: NetworkLink::new(wifi),
            session: SessionLink::new(broker, client),
            sync: SyncSchedule::new(time.sync_interval_ms, time.retry_after_failure_ms),
            servers: time.servers,
            events: ChannelEvents::new(),
        }
    }

    pub fn maintain_network<R: Radio>(&mut self, radio: &mut R, now_ms: u64) -> LinkEvent {
        self.network.maintain(radio, now_ms)
    }

    pub fn maintain_session<T: Transport>(&mut self, transport: &mut T, now_ms: u64) {
        self.session.maintain(transport, self.network.is_up(), now_ms);
    }

    /// Service session I/O and drain the channel queue. Returns how many
    /// session failures were reported this cycle.
    pub fn service_session<T: Transport>(&mut self, transport: &mut T, now_ms: u64) -> u8 {
        self.session.service(transport, now_ms, &mut self.events);

        let mut failures = 0u8;
        while let Some(event) = self.events.pop_front() {
            if matches!(event, ChannelEvent::Error(_)) {
                failures = failures.saturating_add(1);
            }
            self.session.apply(&event, now_ms);
        }
        failures
    }

    /// Resynchronize the clock if the network is up and the interval has elapsed.
    /// `None` when no attempt was made.
    pub fn maybe_resync<S: TimeSource>(
        &mut self,
        source: &mut S,
        clock: &mut WallClock,
        now_ms: u64,
    ) -> Option<Result<(), TimeError>> {
        if !self.network.is_up() || !self.sync.is_due(now_ms) {
            return None;
        }
        let result = clock.synchronize(source, &self.servers);
        self.sync.record(now_ms, result.is_ok());
        if let Err(e) = &result {
            log::warn!("clock: resync failed ({}), retrying in {}s", e, self.sync.retry_ms / 1000);
        }
        Some(result)
    }

    /// Unconditional sync attempt, used at startup.
    pub fn sync_now<S: TimeSource>(&mut self, source: &mut S, clock: &mut WallClock, now_ms: u64) -> Result<(), TimeError> {
        if !self.network.is_up() {
            return Err(TimeError::NetworkDown);
        }
        let result = clock.synchronize(source, &self.servers);
        self.sync.record(now_ms, result.is_ok());
        result
    }

    pub fn send<T: Transport>(&mut self, transport: &mut T, text: &str) -> Result<(), ChannelError> {
        self.session.send(transport, text)
    }

    pub fn network(&self) -> &NetworkLink {
        &self.network
    }

    pub fn session(&self) -> &SessionLink {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            network_up: self.network.is_up(),
            session_up: self.session.is_up(),
            last_sync_attempt_ms: self.sync.last_attempt(),
        }
    }
}
