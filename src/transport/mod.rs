use thiserror::Error;

use crate::stream::TransferType;

pub mod serial;
mod transfer;
pub mod usb;

pub use serial::{PortPair, SerialTransport};
pub use usb::{SharedHandle, UsbTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("usb transfer failed: {0}")]
    Usb(#[from] rusb::Error),
    #[error("serial port {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} transfers are not supported by this transport")]
    Unsupported(TransferType),
    #[error("device is not open")]
    NotOpen,
}

/// Data path of one stream: a pair of endpoints on the device, or a pair of
/// serial ports.
///
/// All calls are non-blocking (or bounded by a millisecond timeout): "nothing
/// ready yet" is `Ok(0)`, never an error.
pub trait Transport {
    /// Largest packet the transport carries in one transaction.
    fn max_packet(&self) -> usize;

    /// Offers `data` towards the device. Returns the number of bytes accepted,
    /// which may be zero when the transport is busy.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Starts an IN transfer of up to `len` bytes unless one is already
    /// outstanding.
    fn request(&mut self, len: usize) -> Result<(), TransportError>;

    /// Collects data from a completed IN transfer into `buf`.
    fn poll(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Releases the underlying resource. Later calls do nothing.
    fn close(&mut self);
}

/// Acquires the transport for a stream.
pub trait TransportOpener {
    /// `ports` is only consulted for [`TransferType::Serial`] streams.
    fn open_transport(
        &mut self,
        stream: usize,
        kind: TransferType,
        ports: &PortPair,
    ) -> Result<Box<dyn Transport>, TransportError>;
}
