//! The hardware seam of the transport. A [`Radio`] is the WiFi interface
//! (scan, station join, soft access point) plus the TCP stack on top of it.
//! Every call must return promptly; anything slow is started here and polled
//! on later ticks.

use std::net::{IpAddr, SocketAddr};

use anyhow::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    pub ssid: String,
    pub channel: u8,
    pub rssi: i8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanStatus {
    Running,
    Complete(Vec<NetworkInfo>),
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were read into the buffer
    Data(usize),
    /// Nothing pending right now
    Empty,
    /// The peer closed the connection
    Closed,
}

/// One TCP connection to the peer
pub trait Link {
    /// Queue one line (the `\n` is appended here). `Ok(false)` means the
    /// socket can't take it yet and the line should be retried later.
    fn send_line(&mut self, line: &str) -> Result<bool, Error>;

    fn poll_read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, Error>;

    fn is_connected(&self) -> bool;

    fn close(&mut self);
}

pub trait Radio {
    type Link: Link;

    /// Identifier tagged onto outgoing lines, usually the MAC address
    fn local_id(&self) -> String;

    fn start_scan(&mut self) -> Result<(), Error>;

    fn scan_status(&mut self) -> ScanStatus;

    fn cancel_scan(&mut self);

    /// Start associating as a station. `channel` skips the channel search
    /// when the network was just seen in a scan.
    fn join(&mut self, ssid: &str, password: &str, channel: Option<u8>) -> Result<(), Error>;

    /// Re-associate with the last joined network
    fn reconnect(&mut self) -> Result<(), Error>;

    fn is_associated(&self) -> bool;

    fn local_ip(&self) -> Option<IpAddr>;

    /// Signal strength of the current association
    fn rssi(&self) -> Option<i8>;

    fn start_access_point(&mut self, ssid: &str, password: &str, channel: u8)
        -> Result<(), Error>;

    fn stop_access_point(&mut self);

    /// Stations currently attached to our access point
    fn station_count(&self) -> usize;

    /// Start a TCP connect, or poll the one already under way. `Ok(None)`
    /// means it hasn't resolved yet and should be asked again next tick.
    fn connect(&mut self, addr: SocketAddr) -> Result<Option<Self::Link>, Error>;

    /// Accept a pending connection on the listening port, if there is one
    fn accept(&mut self) -> Result<Option<(Self::Link, IpAddr)>, Error>;
}
