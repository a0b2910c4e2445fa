//! WiFi association and TCP link management
//!
//! The [`TransportConnector`] finds the peer's network (or becomes the
//! access point when there is none), keeps one TCP connection to the peer
//! alive with heartbeats, and moves text lines across it. It is polled from
//! the main loop and never blocks; every wait is a deadline compared against
//! the `now` handed to [`TransportConnector::update`].
//!
//! States, in the order a node normally walks them:
//!
//! - `SCANNING` looks for the peer's network, and after too many misses the
//!   node starts its own access point (`AP_MODE`). If the access point can't
//!   be started the node scans again.
//! - `CONNECTING` waits for association, then opens TCP to the access point.
//!   No association in time means `DISCONNECTED`, which re-joins later.
//! - `CONNECTED` carries lines. A lost link sends the initiator back to
//!   `CONNECTING` and the acceptor back to `AP_MODE`.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use common::{HEARTBEAT, HEARTBEAT_ACK};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::config::NetworkConfig;

pub mod framing;
pub mod host;
pub mod queue;
pub mod radio;

use framing::LineDeframer;
use queue::OutgoingQueue;
use radio::{Link, Radio, ReadStatus, ScanStatus};

const READ_CHUNK: usize = 256;
/// Reads per tick, so a chatty peer can't stall the loop
const MAX_READS_PER_TICK: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Scanning,
    Connecting,
    Connected,
    ApMode,
    Disconnected,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Scanning => "SCANNING",
            TransportState::Connecting => "CONNECTING",
            TransportState::Connected => "CONNECTED",
            TransportState::ApMode => "AP_MODE",
            TransportState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Our side of the link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    /// Running the access point, no client attached
    Ap,
    /// Joined the peer's network and opened the connection
    Client,
    /// Accepted the connection on our own access point
    Peer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub ip: IpAddr,
    pub role: PeerRole,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { peer: PeerInfo },
    Disconnected,
    AcceptedClient(IpAddr),
    /// Any received line that is not a heartbeat
    Line(String),
}

/// Most recent noteworthy thing that happened, for diagnostics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LastEvent {
    pub tag: &'static str,
    pub at_ms: u64,
}

pub struct TransportConnector<R: Radio> {
    radio: R,
    config: NetworkConfig,
    local_id: String,
    state: TransportState,

    link: Option<R::Link>,
    peer: Option<PeerInfo>,
    queue: OutgoingQueue,
    deframer: LineDeframer,
    subscribers: Vec<mpsc::UnboundedSender<TransportEvent>>,

    scan_running: bool,
    scan_started_ms: u64,
    last_scan_poll_ms: u64,
    scan_attempts: u32,

    connect_started_ms: u64,
    last_connect_attempt_ms: Option<u64>,
    /// A TCP connect was started and hasn't resolved yet
    connect_in_flight: bool,

    last_heartbeat_sent_ms: u64,
    last_heartbeat_received_ms: u64,

    ap_rescan_delay_ms: u64,
    last_ap_scan_ms: u64,

    last_status_log_ms: u64,
    last_event: Option<LastEvent>,
    refused: u32,
}

impl<R: Radio> TransportConnector<R> {
    pub fn new(radio: R, config: NetworkConfig, now: u64) -> Self {
        let local_id = radio.local_id();
        info!("transport: starting as {} (SCANNING)", local_id);

        Self {
            queue: OutgoingQueue::new(config.queue_capacity),
            ap_rescan_delay_ms: config.ap_rescan_base_ms,
            radio,
            config,
            local_id,
            state: TransportState::Scanning,
            link: None,
            peer: None,
            deframer: LineDeframer::new(),
            subscribers: Vec::new(),
            scan_running: false,
            scan_started_ms: now,
            last_scan_poll_ms: now,
            scan_attempts: 0,
            connect_started_ms: now,
            last_connect_attempt_ms: None,
            connect_in_flight: false,
            last_heartbeat_sent_ms: now,
            last_heartbeat_received_ms: now,
            last_ap_scan_ms: now,
            last_status_log_ms: now,
            last_event: None,
            refused: 0,
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.peer.as_ref().map(|peer| peer.role)
    }

    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
            && self.link.as_ref().map_or(false, |link| link.is_connected())
    }

    pub fn queue(&self) -> &OutgoingQueue {
        &self.queue
    }

    pub fn last_event(&self) -> Option<LastEvent> {
        self.last_event
    }

    /// Connection attempts turned away while a peer was attached
    pub fn refused(&self) -> u32 {
        self.refused
    }

    /// 0 to 4 bars from the association's RSSI
    pub fn signal_bars(&self) -> Option<u8> {
        if !self.radio.is_associated() {
            return None;
        }
        let bars = match self.radio.rssi()? {
            rssi if rssi >= -55 => 4,
            rssi if rssi >= -65 => 3,
            rssi if rssi >= -75 => 2,
            rssi if rssi >= -85 => 1,
            _ => 0,
        };
        Some(bars)
    }

    /// Never blocks. Lines wait here until a peer is connected.
    pub fn enqueue_outgoing(&mut self, line: impl Into<String>, now: u64) {
        self.queue.push(line.into(), now);
    }

    pub fn update(&mut self, now: u64) {
        if now.saturating_sub(self.last_status_log_ms) >= self.config.status_log_interval_ms {
            self.last_status_log_ms = now;
            info!(
                "transport: state={} associated={} peer={:?} queued={}/{} dropped={}",
                self.state,
                self.radio.is_associated(),
                self.peer,
                self.queue.len(),
                self.queue.capacity(),
                self.queue.dropped()
            );
        }

        match self.state {
            TransportState::Scanning => self.update_scanning(now),
            TransportState::Connecting => self.update_connecting(now),
            TransportState::Connected => self.update_connected(now),
            TransportState::ApMode => self.update_ap_mode(now),
            TransportState::Disconnected => self.update_disconnected(now),
        }
    }

    fn update_scanning(&mut self, now: u64) {
        if now.saturating_sub(self.last_scan_poll_ms) < self.config.scan_interval_ms {
            return;
        }
        self.last_scan_poll_ms = now;

        if !self.scan_running {
            match self.radio.start_scan() {
                Ok(()) => {
                    self.scan_running = true;
                    self.scan_started_ms = now;
                    debug!("transport: scan started");
                }
                Err(e) => {
                    warn!("transport: failed to start scan: {}", e);
                    self.scan_missed(now);
                }
            }
            return;
        }

        match self.radio.scan_status() {
            ScanStatus::Running => {
                if now.saturating_sub(self.scan_started_ms) >= self.config.scan_timeout_ms {
                    self.radio.cancel_scan();
                    self.scan_running = false;
                    info!("transport: scan timed out");
                    self.record(now, "SCAN_TIMEOUT");
                    self.scan_missed(now);
                }
            }
            ScanStatus::Complete(networks) => {
                self.scan_running = false;
                let target = networks.iter().find(|n| n.ssid == self.config.ssid);
                match target {
                    Some(network) => {
                        info!(
                            "transport: found {} on channel {} ({} dBm)",
                            network.ssid, network.channel, network.rssi
                        );
                        let channel = network.channel;
                        self.join(Some(channel), now);
                    }
                    None => self.scan_missed(now),
                }
            }
            ScanStatus::Failed => {
                self.scan_running = false;
                warn!("transport: scan failed");
                self.scan_missed(now);
            }
        }
    }

    fn scan_missed(&mut self, now: u64) {
        self.scan_attempts += 1;
        if self.scan_attempts >= self.config.max_scan_attempts {
            info!(
                "transport: {} not found after {} scans",
                self.config.ssid, self.scan_attempts
            );
            self.enter_ap_mode(now);
        } else {
            info!(
                "transport: {} not found, scanning again (attempt {})",
                self.config.ssid, self.scan_attempts
            );
        }
    }

    fn join(&mut self, channel: Option<u8>, now: u64) {
        if let Err(e) = self
            .radio
            .join(&self.config.ssid, &self.config.password, channel)
        {
            warn!("transport: failed to join {}: {}", self.config.ssid, e);
        }
        self.set_state(TransportState::Connecting);
        self.connect_started_ms = now;
        self.last_connect_attempt_ms = None;
    }

    fn enter_ap_mode(&mut self, now: u64) {
        if let Err(e) = self.radio.start_access_point(
            &self.config.ssid,
            &self.config.password,
            self.config.ap_channel,
        ) {
            // Start a fresh round of scans, the access point is tried again
            // once they all miss
            warn!("transport: failed to start access point: {}", e);
            self.record(now, "AP_FAILED");
            self.peer = None;
            self.scan_running = false;
            self.scan_attempts = 0;
            self.last_scan_poll_ms = now;
            self.set_state(TransportState::Scanning);
            return;
        }

        info!("transport: access point up on channel {}", self.config.ap_channel);
        self.set_state(TransportState::ApMode);
        self.record(now, "AP_MODE");
        self.peer = Some(PeerInfo {
            ip: IpAddr::V4(self.config.ap_ip),
            role: PeerRole::Ap,
        });
        self.scan_running = false;
        self.scan_attempts = 0;
        self.ap_rescan_delay_ms = self.config.ap_rescan_base_ms;
        self.last_ap_scan_ms = now;
    }

    fn update_connecting(&mut self, now: u64) {
        if !self.radio.is_associated() {
            if now.saturating_sub(self.connect_started_ms) >= self.config.connect_timeout_ms {
                warn!("transport: association did not complete");
                self.record(now, "ASSOC_TIMEOUT");
                self.set_state(TransportState::Disconnected);
                self.connect_started_ms = now;
                self.emit(TransportEvent::Disconnected);
            }
            return;
        }

        // Joined our own network, the peer must be looking for us
        if self.radio.local_ip() == Some(IpAddr::V4(self.config.ap_ip)) {
            warn!("transport: local ip is the access point address");
            self.record(now, "SELF_CONNECT");
            self.enter_ap_mode(now);
            return;
        }

        if !self.connect_in_flight {
            let due = self.last_connect_attempt_ms.map_or(true, |at| {
                now.saturating_sub(at) >= self.config.connect_retry_ms
            });
            if !due {
                return;
            }
            self.last_connect_attempt_ms = Some(now);
        }

        let addr = SocketAddr::new(IpAddr::V4(self.config.ap_ip), self.config.port);
        match self.radio.connect(addr) {
            Ok(Some(link)) => {
                self.connect_in_flight = false;
                info!("transport: connected to {}", addr);
                self.attach(link, addr.ip(), PeerRole::Client, now);
                self.record(now, "CONNECTED");
                self.emit_connected();
            }
            Ok(None) => {
                if !self.connect_in_flight {
                    debug!("transport: connecting to {}", addr);
                }
                self.connect_in_flight = true;
            }
            Err(e) => {
                self.connect_in_flight = false;
                info!("transport: connect to {} failed, retrying: {}", addr, e);
                self.connect_started_ms = now;
            }
        }
    }

    fn update_connected(&mut self, now: u64) {
        let alive = self.link.as_ref().map_or(false, |link| link.is_connected());
        if !alive {
            info!("transport: link lost");
            self.teardown(now, "TCP_LOST");
            return;
        }

        if self.role() == Some(PeerRole::Client)
            && now.saturating_sub(self.last_heartbeat_sent_ms) >= self.config.heartbeat_interval_ms
        {
            self.last_heartbeat_sent_ms = now;
            self.send_direct(HEARTBEAT);
        }

        let (lines, closed) = self.read_lines(now);
        for line in lines {
            self.dispatch(line);
        }
        if closed {
            self.teardown(now, "TCP_CLOSED");
            return;
        }

        if now.saturating_sub(self.last_heartbeat_received_ms) >= self.config.heartbeat_timeout_ms
        {
            warn!(
                "transport: nothing heard for {}ms",
                self.config.heartbeat_timeout_ms
            );
            self.teardown(now, "HB_TIMEOUT");
            return;
        }

        self.send_queued();

        if self.role() == Some(PeerRole::Peer) {
            self.refuse_extra_clients();
        }
    }

    fn update_ap_mode(&mut self, now: u64) {
        match self.radio.accept() {
            Ok(Some((link, ip))) => {
                info!("transport: accepted client {}", ip);
                self.attach(link, ip, PeerRole::Peer, now);
                self.record(now, "ACCEPTED");
                self.emit(TransportEvent::AcceptedClient(ip));
                self.emit_connected();
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("transport: accept failed: {}", e),
        }

        if self.scan_running {
            match self.radio.scan_status() {
                ScanStatus::Running => {
                    if now.saturating_sub(self.scan_started_ms) >= self.config.scan_timeout_ms {
                        self.radio.cancel_scan();
                        self.scan_running = false;
                        self.back_off_rescan(now);
                    }
                }
                ScanStatus::Complete(networks) => {
                    self.scan_running = false;
                    let channel = networks
                        .iter()
                        .find(|n| n.ssid == self.config.ssid)
                        .map(|n| n.channel);
                    match channel {
                        Some(channel) => {
                            info!("transport: {} reappeared, leaving AP mode", self.config.ssid);
                            self.record(now, "REJOIN");
                            self.radio.stop_access_point();
                            self.peer = None;
                            self.join(Some(channel), now);
                        }
                        None => self.back_off_rescan(now),
                    }
                }
                ScanStatus::Failed => {
                    self.scan_running = false;
                    self.back_off_rescan(now);
                }
            }
            return;
        }

        if self.radio.station_count() == 0
            && now.saturating_sub(self.last_ap_scan_ms) >= self.ap_rescan_delay_ms
        {
            match self.radio.start_scan() {
                Ok(()) => {
                    debug!("transport: rescanning from AP mode");
                    self.scan_running = true;
                    self.scan_started_ms = now;
                }
                Err(e) => {
                    warn!("transport: failed to start rescan: {}", e);
                    self.back_off_rescan(now);
                }
            }
        }
    }

    fn back_off_rescan(&mut self, now: u64) {
        self.last_ap_scan_ms = now;
        self.ap_rescan_delay_ms = (self.ap_rescan_delay_ms + self.config.ap_rescan_step_ms)
            .min(self.config.ap_rescan_max_ms);
        debug!(
            "transport: next rescan in {}ms",
            self.ap_rescan_delay_ms
        );
    }

    fn update_disconnected(&mut self, now: u64) {
        if now.saturating_sub(self.connect_started_ms) >= self.config.connect_retry_ms {
            info!("transport: retrying association");
            self.join(None, now);
        }
    }

    fn attach(&mut self, link: R::Link, ip: IpAddr, role: PeerRole, now: u64) {
        self.link = Some(link);
        self.peer = Some(PeerInfo { ip, role });
        self.deframer.clear();
        self.last_heartbeat_sent_ms = now;
        self.last_heartbeat_received_ms = now;
        self.set_state(TransportState::Connected);

        while !self.queue.is_empty() {
            if !self.send_queued() {
                break;
            }
        }
    }

    fn teardown(&mut self, now: u64, reason: &'static str) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.deframer.clear();
        self.record(now, reason);

        match self.role() {
            Some(PeerRole::Client) => {
                if let Err(e) = self.radio.reconnect() {
                    warn!("transport: failed to re-associate: {}", e);
                }
                self.peer = None;
                self.set_state(TransportState::Connecting);
                self.connect_started_ms = now;
                self.last_connect_attempt_ms = Some(now);
            }
            _ => {
                self.set_state(TransportState::ApMode);
                self.peer = Some(PeerInfo {
                    ip: IpAddr::V4(self.config.ap_ip),
                    role: PeerRole::Ap,
                });
                self.scan_running = false;
                self.ap_rescan_delay_ms = self.config.ap_rescan_base_ms;
                self.last_ap_scan_ms = now;
            }
        }

        self.emit(TransportEvent::Disconnected);
    }

    /// Complete lines read this tick, and whether the peer has gone away.
    /// Lines that arrived ahead of the close are still returned.
    fn read_lines(&mut self, now: u64) -> (Vec<String>, bool) {
        let mut lines = Vec::new();
        let Some(link) = self.link.as_mut() else {
            return (lines, true);
        };
        let mut buf = [0u8; READ_CHUNK];

        for _ in 0..MAX_READS_PER_TICK {
            match link.poll_read(&mut buf) {
                Ok(ReadStatus::Data(n)) => {
                    self.last_heartbeat_received_ms = now;
                    self.deframer.push(&buf[..n], |line| lines.push(line));
                }
                Ok(ReadStatus::Empty) => break,
                Ok(ReadStatus::Closed) => return (lines, true),
                Err(e) => {
                    warn!("transport: read failed: {}", e);
                    return (lines, true);
                }
            }
        }
        (lines, false)
    }

    fn dispatch(&mut self, line: String) {
        debug!("transport: RX {}", line);
        if line == HEARTBEAT {
            if self.role() == Some(PeerRole::Peer) {
                self.send_direct(HEARTBEAT_ACK);
            }
        } else if line != HEARTBEAT_ACK {
            self.emit(TransportEvent::Line(line));
        }
    }

    fn refuse_extra_clients(&mut self) {
        match self.radio.accept() {
            Ok(Some((mut link, ip))) => {
                link.close();
                self.refused += 1;
                info!("transport: refused extra client {}", ip);
            }
            Ok(None) => {}
            Err(e) => debug!("transport: accept failed: {}", e),
        }
    }

    /// Write a line straight to the socket, skipping the queue
    fn send_direct(&mut self, line: &str) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link.send_line(line) {
            Ok(true) => debug!("transport: TX {}", line),
            Ok(false) => debug!("transport: socket busy, {} skipped", line),
            Err(e) => warn!("transport: failed to send {}: {}", line, e),
        }
    }

    /// Hand the oldest queued line to the socket. False if nothing was sent.
    fn send_queued(&mut self) -> bool {
        let (Some(link), Some(front)) = (self.link.as_mut(), self.queue.front()) else {
            return false;
        };
        match link.send_line(&front.line) {
            Ok(true) => {
                debug!("transport: TX {}", front.line);
                self.queue.pop_sent();
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("transport: failed to send queued line: {}", e);
                false
            }
        }
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            info!("transport: {} -> {}", self.state, state);
            self.state = state;
            self.connect_in_flight = false;
        }
    }

    fn record(&mut self, now: u64, tag: &'static str) {
        self.last_event = Some(LastEvent { tag, at_ms: now });
    }

    fn emit_connected(&mut self) {
        if let Some(peer) = self.peer.clone() {
            self.emit(TransportEvent::Connected { peer });
        }
    }

    fn emit(&mut self, event: TransportEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radio::NetworkInfo;
    use std::{cell::RefCell, collections::VecDeque, net::Ipv4Addr, rc::Rc};

    use anyhow::{anyhow, Error};

    #[derive(Default)]
    struct Wire {
        sent: Vec<String>,
        inbox: VecDeque<u8>,
        connected: bool,
        peer_closed: bool,
        writable: bool,
    }

    struct MockLink(Rc<RefCell<Wire>>);

    impl Link for MockLink {
        fn send_line(&mut self, line: &str) -> Result<bool, Error> {
            let mut wire = self.0.borrow_mut();
            if !wire.writable {
                return Ok(false);
            }
            wire.sent.push(line.to_string());
            Ok(true)
        }

        fn poll_read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, Error> {
            let mut wire = self.0.borrow_mut();
            if wire.inbox.is_empty() {
                return Ok(if wire.peer_closed {
                    ReadStatus::Closed
                } else {
                    ReadStatus::Empty
                });
            }
            let mut n = 0;
            while n < buf.len() {
                match wire.inbox.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(ReadStatus::Data(n))
        }

        fn is_connected(&self) -> bool {
            self.0.borrow().connected
        }

        fn close(&mut self) {
            self.0.borrow_mut().connected = false;
        }
    }

    #[derive(Default)]
    struct Air {
        networks: Vec<NetworkInfo>,
        scan_hangs: bool,
        scans_started: u32,
        scanning: bool,
        associated: bool,
        local_ip: Option<IpAddr>,
        joins: Vec<Option<u8>>,
        ap_running: bool,
        ap_fails: bool,
        stations: usize,
        accept_fails: bool,
        connect_fails: bool,
        /// Polls a connect stays unresolved for
        connect_polls: u32,
        connects: u32,
        pending: VecDeque<IpAddr>,
        wires: Vec<Rc<RefCell<Wire>>>,
    }

    #[derive(Clone, Default)]
    struct MockRadio(Rc<RefCell<Air>>);

    impl MockRadio {
        fn wire(&self) -> Rc<RefCell<Wire>> {
            let wire = Rc::new(RefCell::new(Wire {
                connected: true,
                writable: true,
                ..Wire::default()
            }));
            self.0.borrow_mut().wires.push(wire.clone());
            wire
        }

        fn last_wire(&self) -> Rc<RefCell<Wire>> {
            self.0.borrow().wires.last().cloned().unwrap()
        }
    }

    impl Radio for MockRadio {
        type Link = MockLink;

        fn local_id(&self) -> String {
            "AA:BB:CC:00:00:01".to_string()
        }

        fn start_scan(&mut self) -> Result<(), Error> {
            let mut air = self.0.borrow_mut();
            air.scans_started += 1;
            air.scanning = true;
            Ok(())
        }

        fn scan_status(&mut self) -> ScanStatus {
            let mut air = self.0.borrow_mut();
            if air.scan_hangs {
                return ScanStatus::Running;
            }
            air.scanning = false;
            ScanStatus::Complete(air.networks.clone())
        }

        fn cancel_scan(&mut self) {
            self.0.borrow_mut().scanning = false;
        }

        fn join(&mut self, _ssid: &str, _password: &str, channel: Option<u8>) -> Result<(), Error> {
            self.0.borrow_mut().joins.push(channel);
            Ok(())
        }

        fn reconnect(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn is_associated(&self) -> bool {
            self.0.borrow().associated
        }

        fn local_ip(&self) -> Option<IpAddr> {
            self.0.borrow().local_ip
        }

        fn rssi(&self) -> Option<i8> {
            Some(-60)
        }

        fn start_access_point(&mut self, _ssid: &str, _password: &str, _channel: u8) -> Result<(), Error> {
            let mut air = self.0.borrow_mut();
            if air.ap_fails {
                return Err(anyhow!("address in use"));
            }
            air.ap_running = true;
            Ok(())
        }

        fn stop_access_point(&mut self) {
            self.0.borrow_mut().ap_running = false;
        }

        fn station_count(&self) -> usize {
            self.0.borrow().stations
        }

        fn connect(&mut self, _addr: SocketAddr) -> Result<Option<MockLink>, Error> {
            {
                let mut air = self.0.borrow_mut();
                air.connects += 1;
                if air.connect_polls > 0 {
                    air.connect_polls -= 1;
                    return Ok(None);
                }
                if air.connect_fails {
                    return Err(anyhow!("connection refused"));
                }
            }
            Ok(Some(MockLink(self.wire())))
        }

        fn accept(&mut self) -> Result<Option<(MockLink, IpAddr)>, Error> {
            if self.0.borrow().accept_fails {
                return Err(anyhow!("not listening"));
            }
            let ip = self.0.borrow_mut().pending.pop_front();
            Ok(ip.map(|ip| (MockLink(self.wire()), ip)))
        }
    }

    fn config() -> NetworkConfig {
        NetworkConfig {
            queue_capacity: 32,
            ..NetworkConfig::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Tick from `from` to `to` in 10ms steps
    fn run<R: Radio>(connector: &mut TransportConnector<R>, from: u64, to: u64) {
        let mut now = from;
        while now <= to {
            connector.update(now);
            now += 10;
        }
    }

    fn connected_client() -> (TransportConnector<MockRadio>, MockRadio, mpsc::UnboundedReceiver<TransportEvent>) {
        let radio = MockRadio::default();
        radio.0.borrow_mut().networks = vec![NetworkInfo {
            ssid: "morse-transceiver".to_string(),
            channel: 6,
            rssi: -50,
        }];
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);
        let mut rx = connector.subscribe();

        run(&mut connector, 0, 1600);
        assert_eq!(connector.state(), TransportState::Connecting);
        assert_eq!(radio.0.borrow().joins, vec![Some(6)]);

        {
            let mut air = radio.0.borrow_mut();
            air.associated = true;
            air.local_ip = Some(IpAddr::V4(Ipv4Addr::new(192, 168, 4, 2)));
        }
        connector.update(1610);
        assert_eq!(connector.state(), TransportState::Connected);
        drain(&mut rx);
        (connector, radio, rx)
    }

    fn access_point() -> (TransportConnector<MockRadio>, MockRadio, mpsc::UnboundedReceiver<TransportEvent>) {
        let radio = MockRadio::default();
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);
        let rx = connector.subscribe();
        run(&mut connector, 0, 5000);
        assert_eq!(connector.state(), TransportState::ApMode);
        (connector, radio, rx)
    }

    #[test]
    fn test_falls_back_to_ap_after_max_scans() {
        let radio = MockRadio::default();
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);

        // One poll starts a scan, the next reads the empty result
        run(&mut connector, 0, 4000);
        assert_eq!(connector.state(), TransportState::Scanning);
        run(&mut connector, 4010, 4800);
        assert_eq!(connector.state(), TransportState::ApMode);
        assert_eq!(radio.0.borrow().scans_started, 3);
        assert!(radio.0.borrow().ap_running);
        assert_eq!(connector.role(), Some(PeerRole::Ap));

        // And takes the first client that shows up
        radio.0.borrow_mut().pending.push_back(IpAddr::V4(Ipv4Addr::new(192, 168, 4, 2)));
        connector.update(4810);
        assert_eq!(connector.state(), TransportState::Connected);
        assert_eq!(connector.role(), Some(PeerRole::Peer));
    }

    #[test]
    fn test_scan_timeout_counts_as_attempt() {
        let radio = MockRadio::default();
        radio.0.borrow_mut().scan_hangs = true;
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);

        run(&mut connector, 0, 7000);
        assert_eq!(connector.state(), TransportState::Scanning);
        run(&mut connector, 7010, 8800);
        assert_eq!(connector.last_event().map(|e| e.tag), Some("SCAN_TIMEOUT"));
        assert_eq!(radio.0.borrow().scans_started, 2);
    }

    #[test]
    fn test_connect_flushes_queue_and_emits() {
        let radio = MockRadio::default();
        radio.0.borrow_mut().networks = vec![NetworkInfo {
            ssid: "morse-transceiver".to_string(),
            channel: 6,
            rssi: -50,
        }];
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);
        let mut rx = connector.subscribe();

        for i in 0..40 {
            connector.enqueue_outgoing(format!("sym:.;dur:{};src:x", i), 0);
        }
        assert_eq!(connector.queue().len(), 32);

        run(&mut connector, 0, 1600);
        radio.0.borrow_mut().associated = true;
        connector.update(1610);

        assert!(connector.is_connected());
        assert_eq!(connector.role(), Some(PeerRole::Client));
        let sent = radio.last_wire().borrow().sent.clone();
        assert_eq!(sent.len(), 32);
        assert_eq!(sent[0], "sym:.;dur:8;src:x");
        assert_eq!(sent[31], "sym:.;dur:39;src:x");
        assert!(connector.queue().is_empty());

        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::Connected {
                peer: PeerInfo {
                    ip: IpAddr::V4(Ipv4Addr::new(192, 168, 4, 1)),
                    role: PeerRole::Client
                }
            }]
        );
    }

    #[test]
    fn test_one_queued_line_per_tick() {
        let (mut connector, radio, _rx) = connected_client();
        radio.last_wire().borrow_mut().sent.clear();

        connector.enqueue_outgoing("DOWN;src:x", 1620);
        connector.enqueue_outgoing("UP;src:x", 1620);
        connector.update(1620);
        assert_eq!(radio.last_wire().borrow().sent, vec!["DOWN;src:x"]);
        connector.update(1630);
        assert_eq!(radio.last_wire().borrow().sent, vec!["DOWN;src:x", "UP;src:x"]);
    }

    #[test]
    fn test_busy_socket_keeps_line_queued() {
        let (mut connector, radio, _rx) = connected_client();
        radio.last_wire().borrow_mut().writable = false;

        connector.enqueue_outgoing("DOWN;src:x", 1620);
        connector.update(1620);
        assert_eq!(connector.queue().len(), 1);

        radio.last_wire().borrow_mut().writable = true;
        connector.update(1630);
        assert!(connector.queue().is_empty());
    }

    #[test]
    fn test_connect_retries_at_interval() {
        let radio = MockRadio::default();
        radio.0.borrow_mut().networks = vec![NetworkInfo {
            ssid: "morse-transceiver".to_string(),
            channel: 1,
            rssi: -70,
        }];
        {
            let mut air = radio.0.borrow_mut();
            air.connect_fails = true;
            air.associated = true;
        }
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);

        // Joined at 1600, first attempt on the next tick
        run(&mut connector, 0, 1610);
        assert_eq!(radio.0.borrow().connects, 1);
        run(&mut connector, 1620, 5600);
        assert_eq!(radio.0.borrow().connects, 1);
        run(&mut connector, 5610, 5610);
        assert_eq!(radio.0.borrow().connects, 2);
        assert_eq!(connector.state(), TransportState::Connecting);

        radio.0.borrow_mut().connect_fails = false;
        run(&mut connector, 5620, 9600);
        assert!(!connector.is_connected());
        run(&mut connector, 9610, 9610);
        assert!(connector.is_connected());
    }

    #[test]
    fn test_slow_connect_is_polled_every_tick() {
        let radio = MockRadio::default();
        {
            let mut air = radio.0.borrow_mut();
            air.networks = vec![NetworkInfo {
                ssid: "morse-transceiver".to_string(),
                channel: 1,
                rssi: -70,
            }];
            air.associated = true;
            air.connect_polls = 3;
        }
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);
        let mut rx = connector.subscribe();

        // Started at 1610, still unresolved for the next two ticks
        run(&mut connector, 0, 1630);
        assert_eq!(radio.0.borrow().connects, 3);
        assert_eq!(connector.state(), TransportState::Connecting);
        assert!(drain(&mut rx).is_empty());

        // Resolves well before the retry interval
        connector.update(1640);
        assert_eq!(radio.0.borrow().connects, 4);
        assert!(connector.is_connected());
        assert_eq!(connector.last_event().map(|e| e.tag), Some("CONNECTED"));
    }

    #[test]
    fn test_association_timeout_then_retry() {
        let radio = MockRadio::default();
        radio.0.borrow_mut().networks = vec![NetworkInfo {
            ssid: "morse-transceiver".to_string(),
            channel: 1,
            rssi: -70,
        }];
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);
        let mut rx = connector.subscribe();

        run(&mut connector, 0, 1600);
        assert_eq!(connector.state(), TransportState::Connecting);
        run(&mut connector, 1610, 6600);
        assert_eq!(connector.state(), TransportState::Disconnected);
        assert_eq!(drain(&mut rx), vec![TransportEvent::Disconnected]);

        run(&mut connector, 6610, 10_600);
        assert_eq!(connector.state(), TransportState::Connecting);
        assert_eq!(radio.0.borrow().joins, vec![Some(1), None]);
    }

    #[test]
    fn test_self_connect_guard() {
        let radio = MockRadio::default();
        radio.0.borrow_mut().networks = vec![NetworkInfo {
            ssid: "morse-transceiver".to_string(),
            channel: 1,
            rssi: -40,
        }];
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);
        run(&mut connector, 0, 1600);

        {
            let mut air = radio.0.borrow_mut();
            air.associated = true;
            air.local_ip = Some(IpAddr::V4(Ipv4Addr::new(192, 168, 4, 1)));
        }
        connector.update(1610);
        assert_eq!(connector.state(), TransportState::ApMode);
        assert_eq!(connector.last_event().map(|e| e.tag), Some("AP_MODE"));
        assert_eq!(radio.0.borrow().connects, 0);
    }

    #[test]
    fn test_client_sends_heartbeats_and_consumes_acks() {
        let (mut connector, radio, mut rx) = connected_client();
        let wire = radio.last_wire();

        connector.update(3110);
        assert_eq!(wire.borrow().sent, vec!["alive"]);

        wire.borrow_mut().inbox.extend(b"alive_ack\nDOWN;src:peer\n");
        connector.update(3120);
        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::Line("DOWN;src:peer".to_string())]
        );
    }

    #[test]
    fn test_heartbeat_timeout_reconnects_initiator() {
        let (mut connector, radio, mut rx) = connected_client();

        run(&mut connector, 1620, 7600);
        assert!(connector.is_connected());
        connector.update(7610);

        assert_eq!(connector.state(), TransportState::Connecting);
        assert_eq!(connector.last_event().map(|e| e.tag), Some("HB_TIMEOUT"));
        assert_eq!(connector.peer(), None);
        assert!(!radio.last_wire().borrow().connected);
        assert_eq!(drain(&mut rx), vec![TransportEvent::Disconnected]);
    }

    #[test]
    fn test_traffic_keeps_link_alive() {
        let (mut connector, radio, _rx) = connected_client();
        let wire = radio.last_wire();

        let mut now = 1620;
        while now < 20_000 {
            wire.borrow_mut().inbox.extend(b"alive_ack\n");
            run(&mut connector, now, now + 1000);
            now += 1010;
        }
        assert!(connector.is_connected());
    }

    #[test]
    fn test_acceptor_answers_heartbeat_and_refuses_extra() {
        let (mut connector, radio, mut rx) = access_point();
        let client = IpAddr::V4(Ipv4Addr::new(192, 168, 4, 2));
        radio.0.borrow_mut().pending.push_back(client);

        connector.update(5010);
        assert_eq!(
            drain(&mut rx),
            vec![
                TransportEvent::AcceptedClient(client),
                TransportEvent::Connected {
                    peer: PeerInfo {
                        ip: client,
                        role: PeerRole::Peer
                    }
                }
            ]
        );

        let wire = radio.last_wire();
        wire.borrow_mut().inbox.extend(b"alive\n");
        connector.update(5020);
        assert_eq!(wire.borrow().sent, vec!["alive_ack"]);

        radio
            .0
            .borrow_mut()
            .pending
            .push_back(IpAddr::V4(Ipv4Addr::new(192, 168, 4, 3)));
        connector.update(5030);
        assert_eq!(connector.refused(), 1);
        assert!(!radio.last_wire().borrow().connected);
        assert_eq!(connector.peer().map(|p| p.ip), Some(client));
    }

    #[test]
    fn test_acceptor_returns_to_ap_mode_when_peer_leaves() {
        let (mut connector, radio, mut rx) = access_point();
        radio
            .0
            .borrow_mut()
            .pending
            .push_back(IpAddr::V4(Ipv4Addr::new(192, 168, 4, 2)));
        connector.update(5010);
        drain(&mut rx);

        radio.last_wire().borrow_mut().peer_closed = true;
        connector.update(5020);

        assert_eq!(connector.state(), TransportState::ApMode);
        assert_eq!(connector.role(), Some(PeerRole::Ap));
        assert_eq!(drain(&mut rx), vec![TransportEvent::Disconnected]);
    }

    #[test]
    fn test_lines_before_close_are_delivered() {
        let (mut connector, radio, mut rx) = connected_client();
        {
            let wire = radio.last_wire();
            let mut wire = wire.borrow_mut();
            wire.inbox.extend(b"sym:-;dur:400;src:peer\nUP;src:peer\n");
            wire.peer_closed = true;
        }

        connector.update(1620);
        assert_eq!(
            drain(&mut rx),
            vec![
                TransportEvent::Line("sym:-;dur:400;src:peer".to_string()),
                TransportEvent::Line("UP;src:peer".to_string()),
                TransportEvent::Disconnected,
            ]
        );
        assert_eq!(connector.last_event().map(|e| e.tag), Some("TCP_CLOSED"));
        assert_eq!(connector.state(), TransportState::Connecting);
    }

    #[test]
    fn test_failed_access_point_scans_again() {
        let radio = MockRadio::default();
        radio.0.borrow_mut().ap_fails = true;
        let mut connector = TransportConnector::new(radio.clone(), config(), 0);

        run(&mut connector, 0, 4800);
        assert_eq!(connector.state(), TransportState::Scanning);
        assert_eq!(connector.last_event().map(|e| e.tag), Some("AP_FAILED"));
        assert_eq!(connector.peer(), None);
        assert_eq!(radio.0.borrow().scans_started, 3);

        // A full round of misses later the access point is tried again
        radio.0.borrow_mut().ap_fails = false;
        run(&mut connector, 4810, 9590);
        assert_eq!(connector.state(), TransportState::Scanning);
        connector.update(9600);
        assert_eq!(connector.state(), TransportState::ApMode);
        assert_eq!(radio.0.borrow().scans_started, 6);
        assert!(radio.0.borrow().ap_running);
    }

    #[test]
    fn test_ap_rescan_backs_off_and_rejoins() {
        let (mut connector, radio, _rx) = access_point();
        let scans = radio.0.borrow().scans_started;

        // AP came up at 4800. First rescan after the base delay, each miss
        // pushes the next one further out.
        run(&mut connector, 5010, 14_790);
        assert_eq!(radio.0.borrow().scans_started, scans);
        run(&mut connector, 14_800, 14_810);
        assert_eq!(radio.0.borrow().scans_started, scans + 1);
        run(&mut connector, 14_820, 29_800);
        assert_eq!(radio.0.borrow().scans_started, scans + 1);
        run(&mut connector, 29_810, 29_820);
        assert_eq!(radio.0.borrow().scans_started, scans + 2);

        radio.0.borrow_mut().networks = vec![NetworkInfo {
            ssid: "morse-transceiver".to_string(),
            channel: 11,
            rssi: -65,
        }];
        run(&mut connector, 29_830, 50_000);
        assert_eq!(connector.state(), TransportState::Connecting);
        assert!(!radio.0.borrow().ap_running);
        assert_eq!(radio.0.borrow().joins.last(), Some(&Some(11)));
    }

    #[test]
    fn test_no_rescan_while_station_attached() {
        let (mut connector, radio, _rx) = access_point();
        let scans = radio.0.borrow().scans_started;
        radio.0.borrow_mut().stations = 1;

        run(&mut connector, 5010, 40_000);
        assert_eq!(radio.0.borrow().scans_started, scans);
    }

    #[test]
    fn test_signal_bars() {
        let (connector, radio, _rx) = connected_client();
        assert_eq!(connector.signal_bars(), Some(3));
        radio.0.borrow_mut().associated = false;
        assert_eq!(connector.signal_bars(), None);
    }

    #[test]
    fn test_accept_errors_are_not_fatal() {
        let (mut connector, radio, _rx) = access_point();
        radio.0.borrow_mut().accept_fails = true;
        run(&mut connector, 5010, 6000);
        assert_eq!(connector.state(), TransportState::ApMode);
    }
}
