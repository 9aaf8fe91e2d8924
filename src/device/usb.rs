use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use rusb::{Context, Device, Direction, Recipient, RequestType, UsbContext};
use tracing::{debug, info, warn};

use super::descriptor::{TEST_DESC_LEN, TEST_DESC_REQUEST};
use super::{DeviceError, DeviceLocation, DevicePowerState, TestDescriptor, TestDevice};
use crate::stream::TransferType;
use crate::transport::usb::claimed_interface;
use crate::transport::{
    PortPair, SerialTransport, SharedHandle, Transport, TransportError, TransportOpener,
    UsbTransport,
};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// The device under test, reached through libusb.
///
/// Interfaces are claimed one stream at a time as transports are opened, so
/// the kernel keeps the ones serial streams rely on.
pub struct UsbTestDevice {
    context: Context,
    device: Device<Context>,
    handle: Option<SharedHandle>,
    claimed: Vec<u8>,
    // interfaces whose kernel driver we unbound and must hand back
    detached: Vec<u8>,
    state: DevicePowerState,
}

impl UsbTestDevice {
    /// Locates the device by vendor and product ID. When more than one
    /// matching device is attached, `location` picks one by bus and address.
    pub fn init(
        vid: u16,
        pid: u16,
        location: Option<DeviceLocation>,
    ) -> Result<Self, DeviceError> {
        let context = Context::new()?;
        let mut found = None;
        for device in context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    debug!("skipping device without descriptor: {}", e);
                    continue;
                }
            };
            if desc.vendor_id() != vid || desc.product_id() != pid {
                continue;
            }
            if let Some(loc) = location
                && (device.bus_number() != loc.bus || device.address() != loc.address)
            {
                continue;
            }
            found = Some(device);
            break;
        }
        let device = found.ok_or(DeviceError::NotFound { vid, pid, location })?;
        info!(
            bus = device.bus_number(),
            address = device.address(),
            "found device {:04x}:{:04x}",
            vid,
            pid
        );
        Ok(Self {
            context,
            device,
            handle: None,
            claimed: Vec::new(),
            detached: Vec::new(),
            state: DevicePowerState::Streaming,
        })
    }

    /// Opens the device. Interfaces are claimed later, per stream.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self.device.open()?;
        debug!("device open");
        self.handle = Some(Rc::new(handle));
        Ok(())
    }

    /// Reads the vendor test descriptor from the device-side software.
    pub fn read_test_descriptor(&self) -> Result<TestDescriptor, DeviceError> {
        let handle = self.handle.as_deref().ok_or(DeviceError::NotOpen)?;
        let mut buf = [0u8; TEST_DESC_LEN];
        let request_type =
            rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let n = handle.read_control(
            request_type,
            TEST_DESC_REQUEST,
            0,
            0,
            &mut buf,
            CONTROL_TIMEOUT,
        )?;
        let desc = TestDescriptor::parse(&buf[..n])?;
        info!(
            test = ?desc.test_number(),
            args = ?[desc.test_arg(0), desc.test_arg(1), desc.test_arg(2), desc.test_arg(3)],
            "test descriptor"
        );
        Ok(desc)
    }

    /// Takes `interface` from its kernel driver and claims it.
    fn claim(&mut self, interface: u8) -> Result<(), TransportError> {
        if self.claimed.contains(&interface) {
            return Ok(());
        }
        let handle = self.handle.as_deref().ok_or(TransportError::NotOpen)?;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(interface, "detaching kernel driver");
                handle.detach_kernel_driver(interface)?;
                self.detached.push(interface);
            }
            Ok(false) => {}
            Err(e) => debug!(interface, "kernel driver state unknown: {}", e),
        }
        handle.claim_interface(interface)?;
        self.claimed.push(interface);
        Ok(())
    }

    /// Releases the claimed interfaces, rebinds any kernel drivers that
    /// were detached and closes the device.
    ///
    /// Streams must have been stopped first; a handle still shared with a
    /// transport is simply dropped.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match Rc::try_unwrap(handle) {
            Ok(handle) => {
                for &interface in &self.claimed {
                    if let Err(e) = handle.release_interface(interface) {
                        warn!(interface, "failed to release interface: {}", e);
                    }
                }
                for &interface in &self.detached {
                    if let Err(e) = handle.attach_kernel_driver(interface) {
                        warn!(interface, "failed to reattach kernel driver: {}", e);
                    }
                }
            }
            Err(_) => warn!("device closed with streams still holding it"),
        }
        self.claimed.clear();
        self.detached.clear();
        debug!("device closed");
    }

    /// sysfs power directory of the device, e.g.
    /// `/sys/bus/usb/devices/1-4.2/power`.
    fn power_dir(&self) -> Result<PathBuf, DeviceError> {
        let ports = self.device.port_numbers()?;
        let path: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
        Ok(PathBuf::from(SYSFS_USB_DEVICES)
            .join(format!("{}-{}", self.device.bus_number(), path.join(".")))
            .join("power"))
    }

    fn write_power(&self, attr: &str, value: &str) -> Result<(), DeviceError> {
        let path = self.power_dir()?.join(attr);
        debug!(path = %path.display(), value, "power control");
        fs::write(&path, value).map_err(|source| DeviceError::Power { path, source })
    }
}

impl TransportOpener for UsbTestDevice {
    fn open_transport(
        &mut self,
        stream: usize,
        kind: TransferType,
        ports: &PortPair,
    ) -> Result<Box<dyn Transport>, TransportError> {
        if kind == TransferType::Serial {
            return Ok(Box::new(SerialTransport::open(ports)?));
        }
        let handle = self.handle.clone().ok_or(TransportError::NotOpen)?;
        if let Some(interface) = claimed_interface(stream, kind) {
            self.claim(interface)?;
        }
        Ok(Box::new(UsbTransport::new(handle, stream, kind)?))
    }
}

impl TestDevice for UsbTestDevice {
    fn state(&self) -> DevicePowerState {
        self.state
    }

    fn set_state(&mut self, state: DevicePowerState) {
        debug!(from = %self.state, to = %state, "device state");
        self.state = state;
    }

    fn suspend(&mut self) -> Result<(), DeviceError> {
        // let the kernel autosuspend the idle device straight away
        self.write_power("autosuspend_delay_ms", "0")?;
        self.write_power("control", "auto")?;
        self.set_state(DevicePowerState::Suspending);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        self.write_power("control", "on")?;
        self.set_state(DevicePowerState::Resuming);
        Ok(())
    }

    fn service(&mut self) -> Result<(), DeviceError> {
        match self.context.handle_events(Some(Duration::ZERO)) {
            Ok(()) | Err(rusb::Error::Interrupted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for UsbTestDevice {
    fn drop(&mut self) {
        self.close();
    }
}
