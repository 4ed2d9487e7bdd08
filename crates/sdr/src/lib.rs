// Copyright 2025-2026 CEMAXECUTER LLC

pub mod replay;
pub mod spectran;

#[cfg(feature = "aaronia")]
pub mod aaronia;

use num_complex::Complex32;

/// One enumerated receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    /// Not claimed by another process and fully booted.
    pub ready: bool,
    pub superspeed: bool,
}

/// Value written to a device config node.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Float(f64),
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Str(s.to_string())
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HwError {
    #[error("{call} failed: 0x{code:08x}")]
    Vendor { call: &'static str, code: u32 },

    #[error("no device with serial '{0}'")]
    NotFound(String),

    #[error("no config node '{0}'")]
    UnknownKey(String),

    #[error("invalid value for '{key}': {value:?}")]
    InvalidValue { key: String, value: ConfigValue },

    #[error("timed out waiting for the first packet")]
    Timeout,

    #[error("end of stream")]
    EndOfStream,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;

/// Entry point of a receiver driver library.
pub trait HardwareApi: Send + Sync {
    /// Refresh the device list; blocks for at most `timeout_ms`.
    fn rescan(&self, timeout_ms: u32) -> Result<()>;

    fn enumerate(&self) -> Vec<DeviceInfo>;

    /// Open a device in raw IQ mode. Dropping the handle closes it.
    fn open(&self, serial: &str) -> Result<Box<dyn PacketDevice>>;
}

/// An opened receiver that delivers IQ in driver-sized packets.
pub trait PacketDevice: Send {
    /// Set a config node, e.g. `main/centerfreq`.
    fn configure(&mut self, key: &str, value: ConfigValue) -> Result<()>;

    /// Bitmask of options of an enumerated node that the hardware rejects.
    fn disabled_options(&mut self, key: &str) -> Result<u64>;

    fn connect(&mut self) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;

    /// Peek the oldest queued packet without blocking. The same packet is
    /// returned until `consume_packet` is called.
    fn poll_packet(&mut self) -> Result<Option<&[Complex32]>>;

    fn consume_packet(&mut self) -> Result<()>;
}
