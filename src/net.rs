//! Wi-Fi station and smoltcp stack.
//!
//! One [`NetStack`] owns the radio and every socket: DHCP for the lease, DNS for
//! host names, a UDP socket for SNTP and a TCP socket that carries the broker
//! session. The main cycle drives it through [`Radio`], [`Transport`] and
//! [`TimeSource`]; only DNS, SNTP and the TLS handshake block, and all are bounded.
//!
//! With TLS on, the session socket is wrapped in an embedded-tls connection.
//! The broker certificate is not verified.

use alloc::string::ToString;
use core::cell::RefCell;
use core::ptr::addr_of_mut;
use embedded_io::ErrorKind;
use embedded_tls::blocking::TlsConnection;
use embedded_tls::{Aes128GcmSha256, TlsConfig, TlsContext, TlsError, UnsecureProvider};
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiDevice};
use heapless::Vec;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet, SocketStorage};
use smoltcp::socket::dhcpv4::{Event as DhcpEvent, Socket as DhcpSocket};
use smoltcp::socket::dns::{DnsQuery, GetQueryResultError, Socket as DnsSocket};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::socket::udp::{PacketBuffer, PacketMetadata, Socket as UdpSocket};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{DnsQueryType, HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv4Cidr};
use static_cell::{ConstStaticCell, StaticCell};

use crate::clock::{parse_sntp_reply, sntp_request, TimeError, TimeSample, TimeSource, NTP_PACKET_LEN, NTP_PORT};
use crate::link::Radio;
use crate::websocket::{Transport, TransportError, TransportState};

const DNS_TIMEOUT_MS: u64 = 5_000;
const SNTP_POLL_ATTEMPTS: u32 = 20;
const SNTP_POLL_INTERVAL_MS: u64 = 500;
const SNTP_LOCAL_PORT: u16 = 50_123;
const TCP_EPHEMERAL_FIRST: u16 = 49_152;
const YIELD_US: u32 = 10_000;
const TCP_ESTABLISH_TIMEOUT_MS: u64 = 10_000;
const TLS_HANDSHAKE_READ_WAIT_MS: u64 = 5_000;
const TLS_WRITE_WAIT_MS: u64 = 5_000;

static SOCKET_STORAGE: ConstStaticCell<[SocketStorage<'static>; 4]> = ConstStaticCell::new([SocketStorage::EMPTY; 4]);
static TCP_RX: ConstStaticCell<[u8; 2048]> = ConstStaticCell::new([0; 2048]);
static TCP_TX: ConstStaticCell<[u8; 2048]> = ConstStaticCell::new([0; 2048]);
static UDP_RX_META: ConstStaticCell<[PacketMetadata; 2]> = ConstStaticCell::new([PacketMetadata::EMPTY; 2]);
static UDP_RX: ConstStaticCell<[u8; 256]> = ConstStaticCell::new([0; 256]);
static UDP_TX_META: ConstStaticCell<[PacketMetadata; 2]> = ConstStaticCell::new([PacketMetadata::EMPTY; 2]);
static UDP_TX: ConstStaticCell<[u8; 128]> = ConstStaticCell::new([0; 128]);
static DNS_QUERIES: ConstStaticCell<[Option<DnsQuery>; 1]> = ConstStaticCell::new([None]);
static IP_CORE: StaticCell<RefCell<IpCore>> = StaticCell::new();

// TLS record buffers. A full record is 16 KiB plus header and tag.
static mut TLS_RX: [u8; 16_640] = [0; 16_640];
static mut TLS_TX: [u8; 4_096] = [0; 4_096];

type TlsStream = TlsConnection<'static, TcpIo, Aes128GcmSha256>;

fn now_ms() -> u64 {
    esp_hal::time::Instant::now().duration_since_epoch().as_millis()
}

/// Parse an IPv4 address from a string without heap allocation.
fn parse_ipv4(s: &str) -> Option<Ipv4Address> {
    let mut octets = [0u8; 4];
    let mut octet_idx = 0;

    for part in s.split('.') {
        if octet_idx >= 4 {
            return None;
        }
        octets[octet_idx] = part.parse().ok()?;
        octet_idx += 1;
    }

    if octet_idx == 4 {
        Some(Ipv4Address::new(octets[0], octets[1], octets[2], octets[3]))
    } else {
        None
    }
}

/// Interface, device and sockets. Shared between the stack and the TLS
/// adapter so either can drive the interface.
struct IpCore {
    device: WifiDevice<'static>,
    iface: Interface,
    sockets: SocketSet<'static>,
    /// How long a TLS read may wait for bytes. Zero outside the handshake.
    read_wait_ms: u64,
}

impl IpCore {
    fn poll(&mut self, now_ms: u64) {
        let timestamp = SmoltcpInstant::from_millis(now_ms as i64);
        self.iface.poll(timestamp, &mut self.device, &mut self.sockets);
    }
}

/// Byte stream over the session TCP socket, as embedded-tls wants it.
struct TcpIo {
    core: &'static RefCell<IpCore>,
    handle: SocketHandle,
}

impl embedded_io::ErrorType for TcpIo {
    type Error = ErrorKind;
}

impl embedded_io::Read for TcpIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ErrorKind> {
        let deadline = now_ms() + self.core.borrow().read_wait_ms;
        loop {
            {
                let mut core = self.core.borrow_mut();
                core.poll(now_ms());
                let socket = core.sockets.get_mut::<TcpSocket>(self.handle);
                if socket.can_recv() {
                    return socket.recv_slice(buf).map_err(|_| ErrorKind::ConnectionReset);
                }
                if !socket.may_recv() {
                    return Err(ErrorKind::NotConnected);
                }
            }
            // Nothing buffered; the record reader keeps its place until the next call
            if now_ms() >= deadline {
                return Err(ErrorKind::TimedOut);
            }
            crate::feed_watchdog();
            esp_radio_rtos_driver::usleep(YIELD_US);
        }
    }
}

impl embedded_io::Write for TcpIo {
    fn write(&mut self, buf: &[u8]) -> Result<usize, ErrorKind> {
        let deadline = now_ms() + TLS_WRITE_WAIT_MS;
        loop {
            {
                let mut core = self.core.borrow_mut();
                core.poll(now_ms());
                let socket = core.sockets.get_mut::<TcpSocket>(self.handle);
                if !socket.may_send() {
                    return Err(ErrorKind::NotConnected);
                }
                if socket.can_send() {
                    return socket.send_slice(buf).map_err(|_| ErrorKind::ConnectionReset);
                }
            }
            if now_ms() >= deadline {
                return Err(ErrorKind::TimedOut);
            }
            crate::feed_watchdog();
            esp_radio_rtos_driver::usleep(YIELD_US);
        }
    }

    fn flush(&mut self) -> Result<(), ErrorKind> {
        self.core.borrow_mut().poll(now_ms());
        Ok(())
    }
}

/// Hardware RNG for TLS key exchange.
struct HwRng;

impl rand_core::RngCore for HwRng {
    fn next_u32(&mut self) -> u32 {
        esp_hal::rng::Rng::new().random()
    }

    fn next_u64(&mut self) -> u64 {
        (self.next_u32() as u64) << 32 | self.next_u32() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl rand_core::CryptoRng for HwRng {}

/// Lease details copied out of a DHCP event.
enum DhcpChange {
    Configured {
        address: Ipv4Cidr,
        router: Option<Ipv4Address>,
        dns: Vec<IpAddress, 3>,
    },
    Deconfigured,
}

pub struct NetStack {
    controller: WifiController<'static>,
    core: &'static RefCell<IpCore>,
    dhcp: SocketHandle,
    dns: SocketHandle,
    udp: SocketHandle,
    tcp: SocketHandle,
    has_address: bool,
    next_local_port: u16,
    tls_enabled: bool,
    tls: Option<TlsStream>,
}

impl NetStack {
    /// Build the stack. Panics if called twice (the socket buffers are static).
    pub fn new(controller: WifiController<'static>, mut device: WifiDevice<'static>, seed: u64, tls_enabled: bool) -> Self {
        let mac = esp_radio::wifi::sta_mac();
        let hw_addr = HardwareAddress::Ethernet(smoltcp::wire::EthernetAddress(mac));
        let mut iface_config = Config::new(hw_addr);
        iface_config.random_seed = seed;
        let iface = Interface::new(iface_config, &mut device, SmoltcpInstant::from_millis(now_ms() as i64));

        let mut sockets = SocketSet::new(&mut SOCKET_STORAGE.take()[..]);

        let dhcp = sockets.add(DhcpSocket::new());
        let dns = sockets.add(DnsSocket::new(&[], &mut DNS_QUERIES.take()[..]));
        let udp = sockets.add(UdpSocket::new(
            PacketBuffer::new(&mut UDP_RX_META.take()[..], &mut UDP_RX.take()[..]),
            PacketBuffer::new(&mut UDP_TX_META.take()[..], &mut UDP_TX.take()[..]),
        ));
        let tcp = sockets.add(TcpSocket::new(
            SocketBuffer::new(&mut TCP_RX.take()[..]),
            SocketBuffer::new(&mut TCP_TX.take()[..]),
        ));

        let core = IP_CORE.init(RefCell::new(IpCore {
            device,
            iface,
            sockets,
            read_wait_ms: 0,
        }));

        Self {
            controller,
            core,
            dhcp,
            dns,
            udp,
            tcp,
            has_address: false,
            next_local_port: TCP_EPHEMERAL_FIRST,
            tls_enabled,
            tls: None,
        }
    }

    fn poll_iface(&mut self, now_ms: u64) {
        self.core.borrow_mut().poll(now_ms);
    }

    fn handle_dhcp(&mut self) {
        let mut core = self.core.borrow_mut();
        let change = match core.sockets.get_mut::<DhcpSocket>(self.dhcp).poll() {
            Some(DhcpEvent::Configured(config)) => DhcpChange::Configured {
                address: config.address,
                router: config.router,
                dns: config.dns_servers.iter().map(|ip| IpAddress::Ipv4(*ip)).collect(),
            },
            Some(DhcpEvent::Deconfigured) => DhcpChange::Deconfigured,
            None => return,
        };

        match change {
            DhcpChange::Configured { address, router, dns } => {
                core.iface.update_ip_addrs(|addrs| {
                    addrs.clear();
                    addrs.push(IpCidr::Ipv4(address)).ok();
                });
                if let Some(router) = router {
                    core.iface.routes_mut().add_default_ipv4_route(router).ok();
                }
                core.sockets.get_mut::<DnsSocket>(self.dns).update_servers(&dns);
                drop(core);
                log::info!("dhcp: IP={} dns_servers={}", address, dns.len());
                crate::heap_debug::log_heap_stats("dhcp_configured");
                self.has_address = true;
            }
            DhcpChange::Deconfigured => {
                drop(core);
                log::warn!("dhcp: deconfigured");
                self.drop_lease();
            }
        }
    }

    fn drop_lease(&mut self) {
        let mut core = self.core.borrow_mut();
        core.iface.update_ip_addrs(|addrs| addrs.clear());
        core.iface.routes_mut().remove_default_ipv4_route();
        self.has_address = false;
    }

    /// Resolve `host` to an IPv4 address. Dotted literals skip DNS.
    fn resolve(&mut self, host: &str) -> Option<IpAddress> {
        if let Some(ip) = parse_ipv4(host) {
            return Some(IpAddress::Ipv4(ip));
        }

        let started = {
            let mut guard = self.core.borrow_mut();
            let core = &mut *guard;
            core.sockets
                .get_mut::<DnsSocket>(self.dns)
                .start_query(core.iface.context(), host, DnsQueryType::A)
        };
        let query = match started {
            Ok(query) => query,
            Err(e) => {
                log::warn!("dns: query for {} not started: {:?}", host, e);
                return None;
            }
        };

        let deadline = now_ms() + DNS_TIMEOUT_MS;
        loop {
            let now = now_ms();
            let mut core = self.core.borrow_mut();
            core.poll(now);

            let socket = core.sockets.get_mut::<DnsSocket>(self.dns);
            match socket.get_query_result(query) {
                Ok(addrs) => return addrs.first().copied(),
                Err(GetQueryResultError::Pending) => {}
                Err(GetQueryResultError::Failed) => {
                    log::warn!("dns: lookup of {} failed", host);
                    return None;
                }
            }
            if now > deadline {
                log::warn!("dns: lookup of {} timed out", host);
                socket.cancel_query(query);
                return None;
            }
            drop(core);

            esp_radio_rtos_driver::usleep(YIELD_US);
        }
    }

    fn next_local_port(&mut self) -> u16 {
        let port = self.next_local_port;
        self.next_local_port = if port == u16::MAX { TCP_EPHEMERAL_FIRST } else { port + 1 };
        port
    }

    fn abort_tcp(&mut self) {
        self.tls = None;
        self.core.borrow_mut().sockets.get_mut::<TcpSocket>(self.tcp).abort();
    }

    fn tcp_state(&self) -> TcpState {
        self.core.borrow().sockets.get::<TcpSocket>(self.tcp).state()
    }

    /// Wait for the TCP connection, then run the TLS handshake over it.
    fn open_tls(&mut self, host: &str) -> Result<(), TransportError> {
        let deadline = now_ms() + TCP_ESTABLISH_TIMEOUT_MS;
        loop {
            self.poll_iface(now_ms());
            match self.tcp_state() {
                TcpState::Established => break,
                TcpState::SynSent | TcpState::SynReceived if now_ms() < deadline => {}
                state => {
                    log::warn!("tls: tcp not established ({})", state);
                    self.abort_tcp();
                    return Err(TransportError::Connect);
                }
            }
            crate::feed_watchdog();
            esp_radio_rtos_driver::usleep(YIELD_US);
        }

        // SAFETY: the buffers back at most one connection. The previous one was
        // dropped by `abort_tcp` before `open` reached here.
        let rx: &'static mut [u8] = unsafe { &mut *addr_of_mut!(TLS_RX) };
        let tx: &'static mut [u8] = unsafe { &mut *addr_of_mut!(TLS_TX) };
        let io = TcpIo { core: self.core, handle: self.tcp };
        let mut conn = TlsConnection::new(io, rx, tx);

        // SNI only makes sense for names
        let config = if parse_ipv4(host).is_some() {
            TlsConfig::new()
        } else {
            TlsConfig::new().with_server_name(host)
        };

        self.core.borrow_mut().read_wait_ms = TLS_HANDSHAKE_READ_WAIT_MS;
        let result = conn.open(TlsContext::new(&config, UnsecureProvider::new::<Aes128GcmSha256>(HwRng)));
        self.core.borrow_mut().read_wait_ms = 0;

        match result {
            Ok(()) => {
                log::info!("tls: session established with {}", host);
                self.tls = Some(conn);
                Ok(())
            }
            Err(e) => {
                log::warn!("tls: handshake with {} failed: {:?}", host, e);
                drop(conn);
                self.abort_tcp();
                Err(TransportError::Tls)
            }
        }
    }
}

impl Radio for NetStack {
    fn poll(&mut self, now_ms: u64) {
        if !self.is_associated() {
            if self.has_address {
                self.drop_lease();
            }
            return;
        }
        self.poll_iface(now_ms);
        self.handle_dhcp();
    }

    fn begin_connect(&mut self, ssid: &str, password: &str) {
        // Ensure WiFi is stopped before (re)configuring to avoid ESP-IDF errors
        let _ = self.controller.stop();
        esp_radio_rtos_driver::usleep(10_000);

        let client_config = ClientConfig::default()
            .with_ssid(ssid.to_string())
            .with_password(password.to_string());
        if let Err(e) = self.controller.set_config(&ModeConfig::Client(client_config)) {
            log::error!("wifi: set_config failed: {:?}", e);
        }
        if let Err(e) = self.controller.start() {
            log::error!("wifi: start failed: {:?}", e);
        }
        if let Err(e) = self.controller.connect() {
            log::error!("wifi: connect failed: {:?}", e);
        }

        // A new association always needs a fresh lease
        self.core.borrow_mut().sockets.get_mut::<DhcpSocket>(self.dhcp).reset();
        self.drop_lease();
    }

    fn is_associated(&self) -> bool {
        self.controller.is_connected().unwrap_or(false)
    }

    fn has_address(&self) -> bool {
        self.has_address
    }

    fn power_cycle(&mut self) {
        if let Err(e) = self.controller.disconnect() {
            log::warn!("wifi: disconnect failed: {:?}", e);
        }
        if let Err(e) = self.controller.stop() {
            log::warn!("wifi: stop failed: {:?}", e);
        }
        self.abort_tcp();
        self.drop_lease();
        crate::feed_watchdog(); // Feed before blocking sleep
        esp_radio_rtos_driver::usleep(100_000);
    }
}

impl Transport for NetStack {
    fn open(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.tls = None;
        if !self.has_address {
            return Err(TransportError::NetworkDown);
        }
        let remote = self.resolve(host).ok_or(TransportError::Resolve)?;
        let local_port = self.next_local_port();

        {
            let mut guard = self.core.borrow_mut();
            let core = &mut *guard;
            let socket = core.sockets.get_mut::<TcpSocket>(self.tcp);
            if socket.is_open() {
                socket.abort();
            }
            socket.connect(core.iface.context(), (remote, port), local_port).map_err(|e| {
                log::error!("ws: connect initiation failed: {:?}", e);
                TransportError::Connect
            })?;
        }

        if self.tls_enabled {
            self.open_tls(host)?;
        }
        Ok(())
    }

    fn state(&self) -> TransportState {
        match self.tcp_state() {
            TcpState::SynSent | TcpState::SynReceived => TransportState::Opening,
            // Plain TCP without its TLS layer carries nothing
            TcpState::Established if self.tls_enabled && self.tls.is_none() => TransportState::Closed,
            TcpState::Established => TransportState::Open,
            _ => TransportState::Closed,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if let Some(tls) = self.tls.as_mut() {
            let n = tls.write(data).map_err(|e| {
                log::warn!("tls: write failed: {:?}", e);
                TransportError::Write
            })?;
            tls.flush().map_err(|e| {
                log::warn!("tls: flush failed: {:?}", e);
                TransportError::Write
            })?;
            return Ok(n);
        }

        let mut core = self.core.borrow_mut();
        let socket = core.sockets.get_mut::<TcpSocket>(self.tcp);
        if !socket.may_send() {
            return Err(TransportError::Write);
        }
        socket.send_slice(data).map_err(|_| TransportError::Write)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if let Some(tls) = self.tls.as_mut() {
            return match tls.read(buf) {
                Ok(n) => Ok(n),
                // No complete record yet
                Err(TlsError::Io(ErrorKind::TimedOut)) => Ok(0),
                Err(e) => {
                    log::warn!("tls: read failed: {:?}", e);
                    Err(TransportError::Read)
                }
            };
        }

        let mut core = self.core.borrow_mut();
        let socket = core.sockets.get_mut::<TcpSocket>(self.tcp);
        if !socket.can_recv() {
            return Ok(0);
        }
        socket.recv_slice(buf).map_err(|_| TransportError::Read)
    }

    fn close(&mut self) {
        self.abort_tcp();
    }
}

impl TimeSource for NetStack {
    fn query_time(&mut self, server: &str) -> Result<TimeSample, TimeError> {
        if !self.has_address {
            return Err(TimeError::NetworkDown);
        }
        let remote = self.resolve(server).ok_or(TimeError::Resolve)?;

        let mut reply = [0u8; NTP_PACKET_LEN];
        {
            let mut core = self.core.borrow_mut();
            let socket = core.sockets.get_mut::<UdpSocket>(self.udp);
            if !socket.is_open() {
                socket.bind(SNTP_LOCAL_PORT).map_err(|_| TimeError::NetworkDown)?;
            }
            // Discard late replies to an earlier query
            while socket.recv_slice(&mut reply).is_ok() {}

            socket
                .send_slice(&sntp_request(), (remote, NTP_PORT))
                .map_err(|_| TimeError::NetworkDown)?;
        }

        for _ in 0..SNTP_POLL_ATTEMPTS {
            let slice_end = now_ms() + SNTP_POLL_INTERVAL_MS;
            loop {
                let now = now_ms();
                {
                    let mut core = self.core.borrow_mut();
                    core.poll(now);

                    let socket = core.sockets.get_mut::<UdpSocket>(self.udp);
                    if let Ok((n, meta)) = socket.recv_slice(&mut reply) {
                        if meta.endpoint.addr == remote && meta.endpoint.port == NTP_PORT {
                            let unix_secs = parse_sntp_reply(&reply[..n])?;
                            return Ok(TimeSample { unix_secs, mono_ms: now });
                        }
                    }
                }

                if now >= slice_end {
                    break;
                }
                esp_radio_rtos_driver::usleep(YIELD_US);
            }
            crate::feed_watchdog();
        }

        Err(TimeError::Timeout)
    }
}
