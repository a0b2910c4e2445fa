//! Radio for running a node on an ordinary host.
//!
//! There is no WiFi here, so the air is played by UDP: the node running the
//! "access point" answers probes on the beacon port with its SSID, and a
//! scanning node sends a probe and waits briefly for that answer. The TCP
//! side is real, with the well known access point address mapped onto the
//! configured peer host.

use std::{
    cell::Cell,
    io::{ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Error};
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::oneshot::{self, error::TryRecvError};

use super::radio::{Link, NetworkInfo, Radio, ReadStatus, ScanStatus};
use crate::config::{HostConfig, NetworkConfig};

const PROBE: &[u8] = b"probe";
/// How long a scan listens for beacons
const SCAN_WINDOW: Duration = Duration::from_millis(300);
/// Bound on a connect running on its helper thread
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Unsent bytes a link may hold before it reports itself busy
const MAX_PENDING: usize = 1024;

fn beacon(ssid: &str, channel: u8) -> String {
    format!("beacon;ssid:{};ch:{}", ssid, channel)
}

fn parse_beacon(msg: &str) -> Option<NetworkInfo> {
    let mut fields = msg.trim().split(';');
    if fields.next()? != "beacon" {
        return None;
    }
    let mut ssid = None;
    let mut channel = 1;
    for field in fields {
        if let Some(value) = field.strip_prefix("ssid:") {
            ssid = Some(value.to_string());
        } else if let Some(value) = field.strip_prefix("ch:") {
            channel = value.parse().ok()?;
        }
    }
    Some(NetworkInfo {
        ssid: ssid?,
        channel,
        rssi: -40,
    })
}

struct Scan {
    socket: Option<UdpSocket>,
    started: Instant,
}

/// TCP connect running on a helper thread
struct PendingConnect {
    target: SocketAddr,
    result: oneshot::Receiver<std::io::Result<TcpStream>>,
}

struct AccessPoint {
    ssid: String,
    channel: u8,
    listener: TcpListener,
    beacon: UdpSocket,
    stations: Vec<Arc<AtomicBool>>,
}

pub struct HostRadio {
    host: HostConfig,
    ap_ip: Ipv4Addr,
    port: u16,
    local_id: String,

    scan: Option<Scan>,
    target: Option<String>,
    /// Probe socket of an association in progress
    joining: Option<UdpSocket>,
    associated: Cell<bool>,
    connecting: Option<PendingConnect>,
    ap: Option<AccessPoint>,
}

impl HostRadio {
    pub fn new(network: &NetworkConfig, host: &HostConfig) -> Self {
        let local_id = host.node_id.clone().unwrap_or_else(|| {
            // Locally administered MAC address
            let mut rng = rand::thread_rng();
            let bytes: [u8; 5] = rng.gen();
            format!(
                "02:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
            )
        });

        Self {
            host: host.clone(),
            ap_ip: network.ap_ip,
            port: network.port,
            local_id,
            scan: None,
            target: None,
            joining: None,
            associated: Cell::new(false),
            connecting: None,
            ap: None,
        }
    }

    fn probe(&self) -> Result<UdpSocket, Error> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_nonblocking(true)?;
        socket.send_to(PROBE, (self.host.peer_host, self.host.beacon_port))?;
        Ok(socket)
    }

    /// Answer any pending probes with our beacon
    fn answer_probes(&mut self) {
        let Some(ap) = self.ap.as_mut() else {
            return;
        };
        let mut buf = [0u8; 64];
        loop {
            match ap.beacon.recv_from(&mut buf) {
                Ok((n, from)) if &buf[..n] == PROBE => {
                    debug!("host: probe from {}", from);
                    let reply = beacon(&ap.ssid, ap.channel);
                    if let Err(e) = ap.beacon.send_to(reply.as_bytes(), from) {
                        warn!("host: failed to answer probe: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("host: beacon socket: {}", e);
                    break;
                }
            }
        }
        ap.stations.retain(|alive| alive.load(Ordering::Relaxed));
    }
}

/// Reads a beacon off a probe socket, if one has arrived
fn recv_beacon(socket: &UdpSocket) -> Option<NetworkInfo> {
    let mut buf = [0u8; 128];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, _)) => {
                if let Some(info) = parse_beacon(&String::from_utf8_lossy(&buf[..n])) {
                    return Some(info);
                }
            }
            // Nothing yet, or the probe bounced off a closed port
            Err(_) => return None,
        }
    }
}

impl Radio for HostRadio {
    type Link = HostLink;

    fn local_id(&self) -> String {
        self.local_id.clone()
    }

    fn start_scan(&mut self) -> Result<(), Error> {
        // We'd only hear ourselves
        let socket = if self.ap.is_some() {
            None
        } else {
            Some(self.probe()?)
        };
        self.scan = Some(Scan {
            socket,
            started: Instant::now(),
        });
        Ok(())
    }

    fn scan_status(&mut self) -> ScanStatus {
        let Some(scan) = self.scan.as_ref() else {
            return ScanStatus::Failed;
        };

        if let Some(info) = scan.socket.as_ref().and_then(recv_beacon) {
            self.scan = None;
            return ScanStatus::Complete(vec![info]);
        }
        if scan.started.elapsed() < SCAN_WINDOW {
            return ScanStatus::Running;
        }
        self.scan = None;
        ScanStatus::Complete(Vec::new())
    }

    fn cancel_scan(&mut self) {
        self.scan = None;
    }

    fn join(&mut self, ssid: &str, _password: &str, channel: Option<u8>) -> Result<(), Error> {
        self.target = Some(ssid.to_string());
        self.connecting = None;
        // Just heard its beacon
        if channel.is_some() {
            self.joining = None;
            self.associated.set(true);
            info!("host: joined {}", ssid);
            return Ok(());
        }
        self.associated.set(false);
        self.joining = Some(self.probe()?);
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), Error> {
        let ssid = self
            .target
            .clone()
            .ok_or_else(|| anyhow!("never joined a network"))?;
        self.join(&ssid, "", None)
    }

    fn is_associated(&self) -> bool {
        if !self.associated.get() {
            let heard = self
                .joining
                .as_ref()
                .and_then(recv_beacon)
                .map_or(false, |info| Some(&info.ssid) == self.target.as_ref());
            if heard {
                self.associated.set(true);
            }
        }
        self.associated.get()
    }

    fn local_ip(&self) -> Option<IpAddr> {
        if self.associated.get() {
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            None
        }
    }

    fn rssi(&self) -> Option<i8> {
        None
    }

    fn start_access_point(&mut self, ssid: &str, _password: &str, channel: u8) -> Result<(), Error> {
        let listener = TcpListener::bind((self.host.listen_host, self.port))?;
        listener.set_nonblocking(true)?;
        let beacon = UdpSocket::bind((self.host.listen_host, self.host.beacon_port))?;
        beacon.set_nonblocking(true)?;

        info!(
            "host: access point {} listening on {}:{}",
            ssid, self.host.listen_host, self.port
        );
        self.associated.set(false);
        self.joining = None;
        self.ap = Some(AccessPoint {
            ssid: ssid.to_string(),
            channel,
            listener,
            beacon,
            stations: Vec::new(),
        });
        Ok(())
    }

    fn stop_access_point(&mut self) {
        if self.ap.take().is_some() {
            info!("host: access point stopped");
        }
    }

    fn station_count(&self) -> usize {
        self.ap.as_ref().map_or(0, |ap| {
            ap.stations
                .iter()
                .filter(|alive| alive.load(Ordering::Relaxed))
                .count()
        })
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<Option<HostLink>, Error> {
        let target = if addr.ip() == IpAddr::V4(self.ap_ip) {
            SocketAddr::new(IpAddr::V4(self.host.peer_host), addr.port())
        } else {
            addr
        };

        if self
            .connecting
            .as_ref()
            .map_or(true, |pending| pending.target != target)
        {
            let (tx, rx) = oneshot::channel();
            std::thread::Builder::new()
                .name("host-connect".to_string())
                .spawn(move || {
                    let _ = tx.send(TcpStream::connect_timeout(&target, CONNECT_TIMEOUT));
                })?;
            debug!("host: connecting to {}", target);
            self.connecting = Some(PendingConnect { target, result: rx });
            return Ok(None);
        }
        let Some(pending) = self.connecting.as_mut() else {
            return Ok(None);
        };

        match pending.result.try_recv() {
            Ok(result) => {
                self.connecting = None;
                let stream = result?;
                Ok(Some(HostLink::new(stream, Arc::new(AtomicBool::new(true)))?))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => {
                self.connecting = None;
                Err(anyhow!("connect to {} was abandoned", target))
            }
        }
    }

    fn accept(&mut self) -> Result<Option<(HostLink, IpAddr)>, Error> {
        self.answer_probes();
        let Some(ap) = self.ap.as_mut() else {
            return Ok(None);
        };

        match ap.listener.accept() {
            Ok((stream, from)) => {
                let alive = Arc::new(AtomicBool::new(true));
                ap.stations.push(alive.clone());
                Ok(Some((HostLink::new(stream, alive)?, from.ip())))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct HostLink {
    stream: TcpStream,
    pending: Vec<u8>,
    connected: bool,
    alive: Arc<AtomicBool>,
}

impl HostLink {
    fn new(stream: TcpStream, alive: Arc<AtomicBool>) -> Result<Self, Error> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            pending: Vec::new(),
            connected: true,
            alive,
        })
    }

    fn flush_pending(&mut self) -> Result<(), Error> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    self.mark_closed();
                    return Err(anyhow!("connection closed"));
                }
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.mark_closed();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn mark_closed(&mut self) {
        self.connected = false;
        self.alive.store(false, Ordering::Relaxed);
    }
}

impl Link for HostLink {
    fn send_line(&mut self, line: &str) -> Result<bool, Error> {
        self.flush_pending()?;
        if self.pending.len() + line.len() + 1 > MAX_PENDING {
            return Ok(false);
        }
        self.pending.extend_from_slice(line.as_bytes());
        self.pending.push(b'\n');
        self.flush_pending()?;
        Ok(true)
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, Error> {
        self.flush_pending()?;
        match self.stream.read(buf) {
            Ok(0) => {
                self.mark_closed();
                Ok(ReadStatus::Closed)
            }
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ReadStatus::Empty),
            Err(e) => {
                self.mark_closed();
                Err(e.into())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.mark_closed();
    }
}
