use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use thiserror::Error;

use crate::transport::TransportOpener;

pub mod descriptor;
pub mod usb;

pub use descriptor::TestDescriptor;
pub use usb::UsbTestDevice;

/// Power state of the device as driven by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePowerState {
    Streaming,
    Suspending,
    Suspended,
    Resuming,
}

impl fmt::Display for DevicePowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DevicePowerState::Streaming => "streaming",
            DevicePowerState::Suspending => "suspending",
            DevicePowerState::Suspended => "suspended",
            DevicePowerState::Resuming => "resuming",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no device {vid:04x}:{pid:04x}{} found", at(.location))]
    NotFound {
        vid: u16,
        pid: u16,
        location: Option<DeviceLocation>,
    },
    #[error("usb: {0}")]
    Usb(#[from] rusb::Error),
    #[error("device is not open")]
    NotOpen,
    #[error("malformed test descriptor: {0}")]
    BadDescriptor(String),
    #[error("power control via {}: {source}", .path.display())]
    Power {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn at(location: &Option<DeviceLocation>) -> String {
    location.map(|l| format!(" at {l}")).unwrap_or_default()
}

/// Bus number and device address, as listed by `lsusb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLocation {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.address)
    }
}

impl FromStr for DeviceLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let Some((bus, address)) = s.split_once(':') else {
            bail!("expected <bus>:<address>, got '{s}'");
        };
        let byte = |v: &str| {
            v.parse::<u8>()
                .map_err(|_| anyhow!("'{v}' is not a number in 0..=255"))
        };
        Ok(Self {
            bus: byte(bus)?,
            address: byte(address)?,
        })
    }
}

/// The device as seen by the test loop once it is open and has reported its
/// test descriptor.
pub trait TestDevice: TransportOpener {
    fn state(&self) -> DevicePowerState;

    fn set_state(&mut self, state: DevicePowerState);

    /// Asks for the device to be suspended; the state becomes `Suspending`.
    fn suspend(&mut self) -> Result<(), DeviceError>;

    /// Asks for the device to be resumed; the state becomes `Resuming`.
    fn resume(&mut self) -> Result<(), DeviceError>;

    /// Handles pending transfer completion events. Must be called on every
    /// loop iteration or in-flight transfers stall.
    fn service(&mut self) -> Result<(), DeviceError>;
}
