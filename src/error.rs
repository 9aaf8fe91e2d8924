use thiserror::Error;

use crate::device::DeviceError;
use crate::stream::TransferType;
use crate::transport::TransportError;

/// Process exit status for command lines that cannot be parsed.
pub const EXIT_BAD_OPTION: u8 = 6;
/// Process exit status for option values that cannot be parsed.
pub const EXIT_BAD_PARAMETER: u8 = 7;

/// Why a test run stopped early.
#[derive(Debug, Error)]
pub enum TestError {
    #[error(transparent)]
    DeviceNotFound(DeviceError),
    #[error("failed to open device")]
    DeviceOpen(#[source] DeviceError),
    #[error("failed to read test descriptor")]
    Descriptor(#[source] DeviceError),
    #[error("test descriptor describes no streams")]
    NoStreams,
    #[error("failed to open stream {stream} ({kind})")]
    StreamOpen {
        stream: usize,
        kind: TransferType,
        #[source]
        source: TransportError,
    },
    #[error("stream {stream} failed")]
    StreamService {
        stream: usize,
        #[source]
        source: TransportError,
    },
    #[error("device service failed")]
    DeviceService(#[source] DeviceError),
    #[error("power state change failed")]
    PowerCycle(#[source] DeviceError),
}

impl TestError {
    /// Errors from locating the device: a missing device has its own exit
    /// status, anything else counts as failing to open it.
    pub fn from_init(e: DeviceError) -> Self {
        match e {
            DeviceError::NotFound { .. } => TestError::DeviceNotFound(e),
            other => TestError::DeviceOpen(other),
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            TestError::StreamOpen { .. } => 1,
            TestError::DeviceNotFound(_) => 2,
            TestError::DeviceOpen(_) => 3,
            TestError::Descriptor(_) | TestError::NoStreams => 4,
            TestError::StreamService { .. }
            | TestError::DeviceService(_)
            | TestError::PowerCycle(_) => 5,
        }
    }
}
