//! Vendor-specific test descriptor reported by the device-side test software.
//!
//! Layout (16 bytes):
//! `7E 57 C0 F1 | length u16 LE | test number u16 LE | arg0..arg3 | 1F 0C 3E F2`

use super::DeviceError;
use crate::stream::TransferType;
use crate::test::test_config::TestConfig;

/// Vendor IN request (device recipient) returning the descriptor.
pub const TEST_DESC_REQUEST: u8 = 0x7c;
pub const TEST_DESC_LEN: usize = 16;

const HEAD: [u8; 4] = [0x7e, 0x57, 0xc0, 0xf1];
const TAIL: [u8; 4] = [0x1f, 0x0c, 0x3e, 0xf2];

pub const TEST_NUMBER_STREAMS: u8 = 0x01;
pub const TEST_NUMBER_ISO: u8 = 0x02;
pub const TEST_NUMBER_MIXED: u8 = 0x03;

/// Streams assumed by tests that do not describe their own.
const DEFAULT_STREAMS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestNumber {
    Streams,
    Isochronous,
    Mixed,
    Other(u8),
}

impl From<u8> for TestNumber {
    fn from(n: u8) -> Self {
        match n {
            TEST_NUMBER_STREAMS => TestNumber::Streams,
            TEST_NUMBER_ISO => TestNumber::Isochronous,
            TEST_NUMBER_MIXED => TestNumber::Mixed,
            other => TestNumber::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestDescriptor {
    number: u8,
    args: [u8; 4],
}

impl TestDescriptor {
    #[cfg(test)]
    pub fn new(number: u8, args: [u8; 4]) -> Self {
        Self { number, args }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DeviceError> {
        if buf.len() < TEST_DESC_LEN {
            return Err(DeviceError::BadDescriptor(format!(
                "{} bytes, expected {TEST_DESC_LEN}",
                buf.len()
            )));
        }
        if buf[0..4] != HEAD || buf[12..16] != TAIL {
            return Err(DeviceError::BadDescriptor("signature mismatch".into()));
        }
        let len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        if len != TEST_DESC_LEN {
            return Err(DeviceError::BadDescriptor(format!("length field {len}")));
        }
        let number = u16::from_le_bytes([buf[6], buf[7]]);
        Ok(Self {
            // test numbers above 0xff are not stream tests
            number: u8::try_from(number).unwrap_or(0xff),
            args: [buf[8], buf[9], buf[10], buf[11]],
        })
    }

    pub fn test_number(&self) -> TestNumber {
        self.number.into()
    }

    pub fn test_arg(&self, arg: usize) -> u8 {
        self.args[arg]
    }

    pub fn stream_count(&self) -> usize {
        match self.test_number() {
            TestNumber::Streams | TestNumber::Isochronous | TestNumber::Mixed => {
                (self.args[0] & 0xf) as usize
            }
            TestNumber::Other(_) => DEFAULT_STREAMS,
        }
    }

    /// Transfer type of stream `idx` in a Mixed test: two bits per stream,
    /// in USB endpoint-type order.
    pub fn mixed_type(&self, idx: usize) -> TransferType {
        let packed = u32::from(self.args[3]) << 16
            | u32::from(self.args[2]) << 8
            | u32::from(self.args[1]);
        match packed.checked_shr(2 * idx as u32).unwrap_or(0) & 3 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub fn stream_type(&self, idx: usize, cfg: &TestConfig) -> TransferType {
        match self.test_number() {
            // Serial ports buffer data inside the host's driver stack, which
            // is lost when a suspend closes them; only raw Bulk survives.
            TestNumber::Streams if cfg.serial && !cfg.suspending => TransferType::Serial,
            TestNumber::Streams => TransferType::Bulk,
            TestNumber::Isochronous => TransferType::Isochronous,
            TestNumber::Mixed => self.mixed_type(idx),
            TestNumber::Other(_) => TransferType::Bulk,
        }
    }

    /// Transfer types of all the streams the test uses.
    pub fn stream_types(&self, cfg: &TestConfig) -> Vec<TransferType> {
        (0..self.stream_count())
            .map(|idx| self.stream_type(idx, cfg))
            .collect()
    }
}
