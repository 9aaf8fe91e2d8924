use std::time::Duration;

use crate::cli::Cli;
use crate::device::DeviceLocation;
use crate::transport::PortPair;
use crate::transport::serial::DEFAULT_PORT;

/// Total data moved by a test, shared out across its streams.
///
/// 16MiB takes about 40s with no LFSR work on a CW310 board; the device's
/// stream signatures normally override it.
pub const DEFAULT_TRANSFER_BYTES: u64 = 0x10 << 20;

/// How long the device spends in each phase of the suspend/resume cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerCycleTimings {
    /// Streaming before a suspend is requested.
    pub run: Duration,
    /// Waiting for the bus to go idle.
    pub suspending: Duration,
    /// Time spent suspended.
    pub suspended: Duration,
    /// Resume signalling lasts at least 20ms and we have no control over
    /// it, so traffic waits a little longer.
    pub resuming: Duration,
}

impl Default for PowerCycleTimings {
    fn default() -> Self {
        Self {
            run: Duration::from_secs(5),
            suspending: Duration::from_millis(5),
            suspended: Duration::from_secs(5),
            resuming: Duration::from_millis(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestConfig {
    pub verbose: bool,
    /// Retrieve data from the device.
    pub retrieve: bool,
    /// Check retrieved data against the expected sequence.
    pub check: bool,
    /// Send data to the device.
    pub send: bool,
    /// Prefer ttyUSB serial ports to raw Bulk transfers.
    pub serial: bool,
    /// Cycle the device through suspend/resume during the test.
    pub suspending: bool,
    /// Any of retrieve/check/send came from the user, so the device may not
    /// override them.
    pub override_flags: bool,
    pub transfer_bytes: u64,
    pub timings: PowerCycleTimings,
    /// Serial ports of the first stream.
    pub ports: PortPair,
    pub vid: u16,
    pub pid: u16,
    pub location: Option<DeviceLocation>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            retrieve: true,
            check: true,
            send: true,
            serial: false,
            suspending: false,
            override_flags: false,
            transfer_bytes: DEFAULT_TRANSFER_BYTES,
            timings: PowerCycleTimings::default(),
            ports: PortPair::default(),
            vid: crate::cli::DEFAULT_VID,
            pid: crate::cli::DEFAULT_PID,
            location: None,
        }
    }
}

impl TestConfig {
    pub fn from_cli(args: &Cli) -> Self {
        let defaults = Self::default();
        let output = args.output.clone().unwrap_or_else(|| DEFAULT_PORT.into());
        let input = args.input.clone().unwrap_or_else(|| DEFAULT_PORT.into());
        Self {
            verbose: args.verbose.unwrap_or(defaults.verbose),
            retrieve: args.retrieve.unwrap_or(defaults.retrieve),
            check: args.check.unwrap_or(defaults.check),
            send: args.send.unwrap_or(defaults.send),
            serial: args.serial.unwrap_or(defaults.serial),
            suspending: args.suspend.unwrap_or(defaults.suspending),
            override_flags: args.retrieve.is_some() || args.check.is_some() || args.send.is_some(),
            transfer_bytes: args.bytes,
            timings: defaults.timings,
            ports: PortPair::new(input, output),
            vid: args.vid,
            pid: args.pid,
            location: args.device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> TestConfig {
        let argv = std::iter::once("usbdev-stream").chain(args.iter().copied());
        TestConfig::from_cli(&Cli::try_parse_args(argv).unwrap())
    }

    #[test]
    fn device_chooses_directions_by_default() {
        let cfg = config(&[]);
        assert!(cfg.retrieve && cfg.check && cfg.send);
        assert!(!cfg.override_flags);
    }

    #[test]
    fn any_direction_switch_pins_all_directions() {
        for args in [&["-c0"][..], &["-r"], &["--send=0"], &["-s1", "-c"]] {
            let cfg = config(args);
            assert!(cfg.override_flags, "{args:?}");
        }
        let cfg = config(&["-c0"]);
        assert!(!cfg.check);
        assert!(cfg.retrieve && cfg.send);
    }

    #[test]
    fn other_switches_leave_directions_to_the_device() {
        let cfg = config(&["-t", "-z", "-v"]);
        assert!(cfg.serial && cfg.suspending && cfg.verbose);
        assert!(!cfg.override_flags);
    }

    #[test]
    fn ports_device_and_ids_carry_over() {
        let cfg = config(&["-d", "3:17", "--vid", "1234", "/dev/ttyUSB4", "/dev/ttyUSB5"]);
        assert_eq!(cfg.ports, PortPair::new("/dev/ttyUSB5", "/dev/ttyUSB4"));
        assert_eq!(cfg.location, Some(DeviceLocation { bus: 3, address: 17 }));
        assert_eq!(cfg.vid, 0x1234);
        assert_eq!(cfg.pid, crate::cli::DEFAULT_PID);
    }
}
