//! WebSocket client (RFC 6455) carrying the broker session.
//!
//! Runs over any byte-stream [`Transport`] and never blocks: each call to
//! [`WsClient::service`] moves the connection along and pushes state changes and
//! inbound messages into a [`ChannelEvents`] queue. The main cycle drains that
//! queue once per tick, so every state mutation happens on its thread.

use core::fmt::Write as FmtWrite;

use base64::Engine;
use heapless::{Deque, String as HString, Vec};

use crate::config::{default_port, BrokerConfig, HeartbeatConfig};

pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Largest inbound frame we buffer.
pub const RX_BUF_LEN: usize = 1024;
/// Largest outbound payload.
pub const MAX_PAYLOAD_LEN: usize = 1024;
/// Inbound text is logged only, so it is kept short.
pub const MAX_TEXT_EVENT_LEN: usize = 128;
pub const EVENT_QUEUE_LEN: usize = 8;

// Worst-case client header: 2 + 8 extended length + 4 mask
const MAX_HEADER_LEN: usize = 14;
const MAX_CONTROL_PAYLOAD: usize = 125;

// ============================================================================
// Transport seam
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Opening,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network unavailable")]
    NetworkDown,
    #[error("could not resolve host")]
    Resolve,
    #[error("connect failed")]
    Connect,
    #[error("tls handshake failed")]
    Tls,
    #[error("write failed")]
    Write,
    #[error("read failed")]
    Read,
}

/// Reliable ordered byte stream to the broker.
pub trait Transport {
    /// Start connecting. Completion is observed through [`Transport::state`].
    fn open(&mut self, host: &str, port: u16) -> Result<(), TransportError>;
    fn state(&self) -> TransportState;
    /// Queue bytes for sending; returns how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;
    /// Read whatever has arrived; `Ok(0)` when nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
    fn close(&mut self);
}

fn write_all<T: Transport>(transport: &mut T, data: &[u8]) -> Result<(), TransportError> {
    let mut offset = 0;
    while offset < data.len() {
        let n = transport.write(&data[offset..])?;
        if n == 0 {
            return Err(TransportError::Write);
        }
        offset += n;
    }
    Ok(())
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("session not open")]
    NotConnected,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connection refused or reset")]
    ConnectFailed,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake rejected with status {0}")]
    HandshakeRejected(u16),
    #[error("heartbeat timed out")]
    HeartbeatTimeout,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("protocol violation")]
    Protocol,
    #[error("transport: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for ChannelError {
    fn from(e: TransportError) -> Self {
        ChannelError::Transport(e)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Error(ChannelError),
    Text(HString<MAX_TEXT_EVENT_LEN>),
    Pong,
}

/// Single-producer queue drained once per main cycle.
pub type ChannelEvents = Deque<ChannelEvent, EVENT_QUEUE_LEN>;

fn push_event(events: &mut ChannelEvents, event: ChannelEvent) {
    // Keep the newest state change if nobody drained the queue
    if events.is_full() {
        let _ = events.pop_front();
    }
    let _ = events.push_back(event);
}

// ============================================================================
// Frame codec
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame larger than buffer")]
    TooLarge,
    #[error("malformed frame")]
    Protocol,
}

impl From<FrameError> for ChannelError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::TooLarge => ChannelError::FrameTooLarge,
            FrameError::Protocol => ChannelError::Protocol,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: &'a [u8],
}

/// Encode a single final frame, masked with `mask` as a client must.
/// Returns the number of bytes written to `out`.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: [u8; 4], out: &mut [u8]) -> Result<usize, FrameError> {
    let len = payload.len();
    let header_len = match len {
        0..=125 => 2,
        126..=0xFFFF => 4,
        _ => 10,
    } + 4;

    if out.len() < header_len + len {
        return Err(FrameError::TooLarge);
    }

    out[0] = 0x80 | opcode as u8;
    let mut pos = 2;
    match len {
        0..=125 => out[1] = 0x80 | len as u8,
        126..=0xFFFF => {
            out[1] = 0x80 | 126;
            out[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            pos = 4;
        }
        _ => {
            out[1] = 0x80 | 127;
            out[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            pos = 10;
        }
    }

    out[pos..pos + 4].copy_from_slice(&mask);
    pos += 4;

    for (i, byte) in payload.iter().enumerate() {
        out[pos + i] = byte ^ mask[i % 4];
    }

    Ok(pos + len)
}

/// Decode one frame from the front of `buf`, unmasking in place.
///
/// Returns `Ok(None)` until a whole frame is buffered, otherwise the frame and the
/// number of bytes it occupied.
pub fn decode_frame(buf: &mut [u8]) -> Result<Option<(Frame<'_>, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        // No extensions negotiated, RSV bits must be clear
        return Err(FrameError::Protocol);
    }
    let opcode = Opcode::from_u8(buf[0] & 0x0F).ok_or(FrameError::Protocol)?;
    let masked = buf[1] & 0x80 != 0;

    let (len, mut pos) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(ext), 10)
        }
        n => (n as u64, 2),
    };

    if opcode.is_control() && (len as usize > MAX_CONTROL_PAYLOAD || !fin) {
        return Err(FrameError::Protocol);
    }
    // The whole frame, header included, has to fit the receive buffer
    let header_len = pos as u64 + if masked { 4 } else { 0 };
    if len > RX_BUF_LEN as u64 - header_len {
        return Err(FrameError::TooLarge);
    }
    let len = len as usize;

    let mask = if masked {
        if buf.len() < pos + 4 {
            return Ok(None);
        }
        let m = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        pos += 4;
        Some(m)
    } else {
        None
    };

    if buf.len() < pos + len {
        return Ok(None);
    }

    let payload = &mut buf[pos..pos + len];
    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok(Some((Frame { fin, opcode, payload }, pos + len)))
}

// ============================================================================
// Opening handshake
// ============================================================================

pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Build the HTTP/1.1 upgrade request. The port is left out of `Host` when it is
/// the scheme's default.
pub fn handshake_request(
    host: &str,
    port: u16,
    secure: bool,
    path: &str,
    key: &str,
    user_agent: &str,
) -> HString<512> {
    let mut request: HString<512> = HString::new();
    let _ = write!(request, "GET {} HTTP/1.1\r\n", if path.is_empty() { "/" } else { path });
    if port == default_port(secure) {
        let _ = write!(request, "Host: {}\r\n", host);
    } else {
        let _ = write!(request, "Host: {}:{}\r\n", host, port);
    }
    let _ = write!(
        request,
        "Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         User-Agent: {}\r\n\r\n",
        key, user_agent
    );
    request
}

/// Parse the server's reply to the upgrade request.
///
/// `Ok(None)` while the header block is incomplete; otherwise the status code and
/// the length of the header block, so any frame bytes behind it can be kept.
pub fn parse_handshake_response(data: &[u8]) -> Result<Option<(u16, usize)>, ChannelError> {
    let header_end = match find_header_end(data) {
        Some(end) => end,
        None => return Ok(None),
    };
    let header = core::str::from_utf8(&data[..header_end]).map_err(|_| ChannelError::Protocol)?;

    // Format: "HTTP/1.1 101 Switching Protocols"
    let status = header
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or(ChannelError::Protocol)?;

    Ok(Some((status, header_end + 4)))
}

// ============================================================================
// Client
// ============================================================================

/// Mask and handshake-key generator. Masking only has to be unpredictable to
/// intermediaries, not cryptographically strong.
struct XorShift32(u32);

impl XorShift32 {
    fn new(seed: u32) -> Self {
        Self(if seed == 0 { 0x9E37_79B9 } else { seed })
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Closed,
    Opening { since_ms: u64 },
    Handshaking { since_ms: u64 },
    Open,
}

/// What an inbound frame asks of us, copied out of the receive buffer.
enum Inbound {
    Text(HString<MAX_TEXT_EVENT_LEN>),
    Ping(Vec<u8, MAX_CONTROL_PAYLOAD>),
    Pong,
    Close,
    Ignored,
}

pub struct WsClient {
    phase: Phase,
    rx: Vec<u8, RX_BUF_LEN>,
    host: &'static str,
    port: u16,
    secure: bool,
    path: &'static str,
    user_agent: HString<64>,
    heartbeat: Option<HeartbeatConfig>,
    last_ping_ms: u64,
    pong_deadline_ms: Option<u64>,
    missed_pongs: u8,
    rng: XorShift32,
}

impl WsClient {
    pub fn new(seed: u32, user_agent: &str) -> Self {
        let mut ua = HString::new();
        for c in user_agent.chars() {
            if ua.push(c).is_err() {
                break;
            }
        }
        Self {
            phase: Phase::Closed,
            rx: Vec::new(),
            host: "",
            port: 0,
            secure: false,
            path: "/",
            user_agent: ua,
            heartbeat: None,
            last_ping_ms: 0,
            pong_deadline_ms: None,
            missed_pongs: 0,
            rng: XorShift32::new(seed),
        }
    }

    pub fn enable_heartbeat(&mut self, heartbeat: HeartbeatConfig) {
        self.heartbeat = Some(heartbeat);
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Begin connecting to the broker. No-op unless the client is closed.
    pub fn connect<T: Transport>(
        &mut self,
        transport: &mut T,
        broker: &BrokerConfig,
        now_ms: u64,
    ) -> Result<(), ChannelError> {
        if self.phase != Phase::Closed {
            return Ok(());
        }

        self.host = broker.host;
        self.port = broker.port;
        self.secure = broker.secure;
        self.path = broker.path;
        self.rx.clear();

        log::info!("ws: connecting to {}://{}:{}{}", broker.scheme(), self.host, self.port, self.path);
        transport.open(self.host, self.port)?;
        self.phase = Phase::Opening { since_ms: now_ms };
        Ok(())
    }

    /// Drop the session without notifying anyone (used when the network itself went away).
    pub fn reset<T: Transport>(&mut self, transport: &mut T) {
        if self.phase != Phase::Closed {
            log::debug!("ws: reset");
        }
        transport.close();
        self.phase = Phase::Closed;
        self.rx.clear();
        self.pong_deadline_ms = None;
        self.missed_pongs = 0;
    }

    /// Drive the connection: finish connecting, read frames, answer pings, heartbeat.
    pub fn service<T: Transport>(&mut self, transport: &mut T, now_ms: u64, events: &mut ChannelEvents) {
        match self.phase {
            Phase::Closed => {}
            Phase::Opening { since_ms } => match transport.state() {
                TransportState::Open => {
                    if let Err(e) = self.send_handshake(transport) {
                        self.fail(transport, e, events);
                        return;
                    }
                    self.phase = Phase::Handshaking { since_ms: now_ms };
                }
                TransportState::Closed => self.fail(transport, ChannelError::ConnectFailed, events),
                TransportState::Opening => {
                    if now_ms.saturating_sub(since_ms) >= CONNECT_TIMEOUT_MS {
                        self.fail(transport, ChannelError::ConnectTimeout, events);
                    }
                }
            },
            Phase::Handshaking { since_ms } => {
                if let Err(e) = self.fill_rx(transport) {
                    self.fail(transport, e, events);
                    return;
                }
                match parse_handshake_response(&self.rx) {
                    Ok(Some((101, consumed))) => {
                        self.consume(consumed);
                        self.phase = Phase::Open;
                        self.last_ping_ms = now_ms;
                        self.pong_deadline_ms = None;
                        self.missed_pongs = 0;
                        log::info!("ws: connected to {}{}", self.host, self.path);
                        push_event(events, ChannelEvent::Connected);
                    }
                    Ok(Some((status, _))) => {
                        self.fail(transport, ChannelError::HandshakeRejected(status), events);
                    }
                    Ok(None) => {
                        if transport.state() == TransportState::Closed {
                            self.fail(transport, ChannelError::ConnectFailed, events);
                        } else if now_ms.saturating_sub(since_ms) >= HANDSHAKE_TIMEOUT_MS {
                            self.fail(transport, ChannelError::HandshakeTimeout, events);
                        }
                    }
                    Err(e) => self.fail(transport, e, events),
                }
            }
            Phase::Open => self.service_open(transport, now_ms, events),
        }
    }

    /// Send one text message on the open session.
    pub fn send_text<T: Transport>(&mut self, transport: &mut T, text: &str) -> Result<(), ChannelError> {
        if self.phase != Phase::Open {
            return Err(ChannelError::NotConnected);
        }
        if text.len() > MAX_PAYLOAD_LEN {
            return Err(ChannelError::FrameTooLarge);
        }

        let mut frame = [0u8; MAX_PAYLOAD_LEN + MAX_HEADER_LEN];
        let n = encode_frame(Opcode::Text, text.as_bytes(), self.next_mask(), &mut frame)?;
        if let Err(e) = write_all(transport, &frame[..n]) {
            log::warn!("ws: send failed: {}", e);
            // The stream is unusable once a frame went out partially
            self.reset(transport);
            return Err(e.into());
        }
        Ok(())
    }

    fn service_open<T: Transport>(&mut self, transport: &mut T, now_ms: u64, events: &mut ChannelEvents) {
        if let Err(e) = self.fill_rx(transport) {
            self.fail(transport, e, events);
            return;
        }

        loop {
            let decoded = decode_frame(&mut self.rx).map(|f| f.map(|(frame, n)| (Self::classify(&frame), n)));
            let (inbound, consumed) = match decoded {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("ws: bad frame: {}", e);
                    self.fail(transport, e.into(), events);
                    return;
                }
            };
            self.consume(consumed);

            match inbound {
                Inbound::Text(text) => push_event(events, ChannelEvent::Text(text)),
                Inbound::Ping(payload) => {
                    if let Err(e) = self.send_control(transport, Opcode::Pong, &payload) {
                        self.fail(transport, e, events);
                        return;
                    }
                }
                Inbound::Pong => {
                    self.pong_deadline_ms = None;
                    self.missed_pongs = 0;
                    push_event(events, ChannelEvent::Pong);
                }
                Inbound::Close => {
                    log::info!("ws: closed by server");
                    let _ = self.send_control(transport, Opcode::Close, &[]);
                    self.reset(transport);
                    push_event(events, ChannelEvent::Disconnected);
                    return;
                }
                Inbound::Ignored => {}
            }
        }

        if transport.state() == TransportState::Closed {
            log::info!("ws: connection closed");
            self.reset(transport);
            push_event(events, ChannelEvent::Disconnected);
            return;
        }

        self.service_heartbeat(transport, now_ms, events);
    }

    fn service_heartbeat<T: Transport>(&mut self, transport: &mut T, now_ms: u64, events: &mut ChannelEvents) {
        let heartbeat = match self.heartbeat {
            Some(hb) => hb,
            None => return,
        };

        if let Some(deadline) = self.pong_deadline_ms {
            if now_ms >= deadline {
                self.pong_deadline_ms = None;
                self.missed_pongs = self.missed_pongs.saturating_add(1);
                log::warn!("ws: pong missed ({}/{})", self.missed_pongs, heartbeat.max_missed);
                if self.missed_pongs >= heartbeat.max_missed {
                    self.fail(transport, ChannelError::HeartbeatTimeout, events);
                }
            }
        } else if now_ms.saturating_sub(self.last_ping_ms) >= heartbeat.interval_ms {
            self.last_ping_ms = now_ms;
            if let Err(e) = self.send_control(transport, Opcode::Ping, &[]) {
                self.fail(transport, e, events);
                return;
            }
            self.pong_deadline_ms = Some(now_ms + heartbeat.timeout_ms);
        }
    }

    fn classify(frame: &Frame<'_>) -> Inbound {
        match frame.opcode {
            Opcode::Text => Inbound::Text(truncated_text(frame.payload)),
            Opcode::Ping => {
                let mut payload = Vec::new();
                let _ = payload.extend_from_slice(frame.payload);
                Inbound::Ping(payload)
            }
            Opcode::Pong => Inbound::Pong,
            Opcode::Close => Inbound::Close,
            Opcode::Binary | Opcode::Continuation => {
                log::debug!("ws: ignoring {:?} frame ({} bytes)", frame.opcode, frame.payload.len());
                Inbound::Ignored
            }
        }
    }

    fn send_handshake<T: Transport>(&mut self, transport: &mut T) -> Result<(), ChannelError> {
        let mut nonce = [0u8; 16];
        self.rng.fill(&mut nonce);
        let mut key = [0u8; 24];
        let n = base64::engine::general_purpose::STANDARD
            .encode_slice(nonce, &mut key)
            .map_err(|_| ChannelError::Protocol)?;
        let key = core::str::from_utf8(&key[..n]).map_err(|_| ChannelError::Protocol)?;

        let request = handshake_request(self.host, self.port, self.secure, self.path, key, &self.user_agent);
        write_all(transport, request.as_bytes())?;
        Ok(())
    }

    fn send_control<T: Transport>(&mut self, transport: &mut T, opcode: Opcode, payload: &[u8]) -> Result<(), ChannelError> {
        let mut frame = [0u8; MAX_CONTROL_PAYLOAD + MAX_HEADER_LEN];
        let n = encode_frame(opcode, payload, self.next_mask(), &mut frame)?;
        write_all(transport, &frame[..n])?;
        Ok(())
    }

    fn fill_rx<T: Transport>(&mut self, transport: &mut T) -> Result<(), ChannelError> {
        let mut chunk = [0u8; 256];
        loop {
            let free = RX_BUF_LEN - self.rx.len();
            if free == 0 {
                return Ok(());
            }
            let want = free.min(chunk.len());
            let n = transport.read(&mut chunk[..want])?;
            if n == 0 {
                return Ok(());
            }
            let _ = self.rx.extend_from_slice(&chunk[..n]);
        }
    }

    fn consume(&mut self, n: usize) {
        let len = self.rx.len();
        let n = n.min(len);
        self.rx.copy_within(n..len, 0);
        self.rx.truncate(len - n);
    }

    fn next_mask(&mut self) -> [u8; 4] {
        self.rng.next_u32().to_le_bytes()
    }

    fn fail<T: Transport>(&mut self, transport: &mut T, error: ChannelError, events: &mut ChannelEvents) {
        log::warn!("ws: {}", error);
        self.reset(transport);
        push_event(events, ChannelEvent::Error(error));
    }
}

/// Longest valid UTF-8 prefix of `payload` that fits an event.
fn truncated_text(payload: &[u8]) -> HString<MAX_TEXT_EVENT_LEN> {
    let valid = match core::str::from_utf8(payload) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&payload[..e.valid_up_to()]).unwrap_or(""),
    };
    let mut text = HString::new();
    for c in valid.chars() {
        if text.push(c).is_err() {
            break;
        }
    }
    text
}
