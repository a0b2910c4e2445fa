use std::{net::Ipv4Addr, path::Path};

use anyhow::Error;
use log::warn;
use pi_pinout::{GpioPin, PhysicalPin, WiringPiPin};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config.ron";

/// Everything that used to be a scattered timing constant. Built once at
/// boot and handed to every component.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub timing: LinkTiming,
    pub network: NetworkConfig,
    pub key: KeyConfig,
    pub host: HostConfig,
    /// Period of the cooperative main loop
    pub tick_ms: u64,
    /// Upper bound of the random delay before the radio starts, so two
    /// units powered on together don't scan in lockstep
    pub startup_jitter_ms: u64,
}

/// Key classification and arbitration thresholds, in milliseconds
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LinkTiming {
    /// Presses shorter than this are contact bounce
    pub min_down_ms: u64,
    /// Presses up to and including this are dots, longer ones dashes
    pub dot_max_ms: u64,
    /// Silence after a release that finishes the current letter
    pub letter_gap_ms: u64,
    /// Hold time that turns a press into a long press
    pub long_press_ms: u64,
    /// Long presses are not reported this soon after boot
    pub boot_grace_ms: u64,
    /// Symbols shorter than this are ignored by the arbitrator
    pub min_symbol_ms: u64,
    /// Idle time after which a held channel falls back to FREE
    pub activity_timeout_ms: u64,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            min_down_ms: 35,
            dot_max_ms: 200,
            letter_gap_ms: 500,
            long_press_ms: 3000,
            boot_grace_ms: 5000,
            min_symbol_ms: 40,
            activity_timeout_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: String,
    /// Address the access point side always has; clients connect here
    pub ap_ip: Ipv4Addr,
    pub port: u16,
    pub ap_channel: u8,
    pub scan_interval_ms: u64,
    pub scan_timeout_ms: u64,
    pub max_scan_attempts: u32,
    pub connect_retry_ms: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub queue_capacity: usize,
    pub ap_rescan_base_ms: u64,
    pub ap_rescan_step_ms: u64,
    pub ap_rescan_max_ms: u64,
    pub status_log_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: "morse-transceiver".to_string(),
            password: String::new(),
            ap_ip: Ipv4Addr::new(192, 168, 4, 1),
            port: 5000,
            ap_channel: 1,
            scan_interval_ms: 800,
            scan_timeout_ms: 7000,
            max_scan_attempts: 3,
            connect_retry_ms: 4000,
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 1500,
            heartbeat_timeout_ms: 6000,
            queue_capacity: 32,
            ap_rescan_base_ms: 10_000,
            ap_rescan_step_ms: 5000,
            ap_rescan_max_ms: 60_000,
            status_log_interval_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct KeyConfig {
    /// GPIO line the straight key is wired to
    pub pin: Pin,
    /// Key shorts the line to ground (internal pull-up) when true
    pub pullup: bool,
    /// Edges closer together than this are discarded at the source
    pub debounce_us: u64,
    /// Press lengths used when keying from the terminal
    pub dot_ms: u64,
    pub dash_ms: u64,
    pub gap_ms: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            pin: Pin::Gpio(GpioPin(14)),
            pullup: true,
            debounce_us: 20_000,
            dot_ms: 80,
            dash_ms: 400,
            gap_ms: 120,
        }
    }
}

/// Settings of the std-net radio used when running on a regular host
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// Host the other node runs on
    pub peer_host: Ipv4Addr,
    /// Local address the access point side listens on
    pub listen_host: Ipv4Addr,
    /// UDP port used for scan probes and beacons
    pub beacon_port: u16,
    /// Overrides the generated node id
    pub node_id: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_host: Ipv4Addr::LOCALHOST,
            listen_host: Ipv4Addr::UNSPECIFIED,
            beacon_port: 5001,
            node_id: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub enum Pin {
    Physical(PhysicalPin),
    Gpio(GpioPin),
    WiringPi(WiringPiPin),
}

impl Pin {
    /// BCM number of the pin, whatever scheme it was written in
    pub fn gpio(self) -> GpioPin {
        match self {
            Pin::Physical(pin) => pin.into(),
            Pin::Gpio(pin) => pin,
            Pin::WiringPi(pin) => pin.into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timing: LinkTiming::default(),
            network: NetworkConfig::default(),
            key: KeyConfig::default(),
            host: HostConfig::default(),
            tick_ms: 5,
            startup_jitter_ms: 1500,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        let config = std::fs::read_to_string(path)?;
        let config: Config = ron::from_str(&config)?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file just means defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Config, Error> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("config: {} not found, using defaults", path.display());
            return Ok(Config::default());
        }
        Config::load(path)
    }
}
