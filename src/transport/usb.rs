use std::collections::VecDeque;
use std::rc::Rc;

use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType};
use tracing::{debug, warn};

use super::transfer::{AsyncTransfer, control_setup};
use super::{Transport, TransportError};
use crate::stream::TransferType;

/// Device handle shared by the device and the transports of its streams.
pub type SharedHandle = Rc<DeviceHandle<Context>>;

const MAX_PACKET: usize = 64;
/// Largest Bulk transfer a stream asks for.
const BULK_TRANSFER: usize = MAX_PACKET * 8;
/// Packets collected by one isochronous IN transfer.
const ISO_PACKETS_PER_TRANSFER: usize = 8;

/// Vendor requests carrying Control stream data on the default pipe.
pub const REQ_STREAM_IN: u8 = 0x7d;
pub const REQ_STREAM_OUT: u8 = 0x7e;

/// Endpoint pair of stream `idx`: interface `idx`, IN `0x81 + idx`,
/// OUT `0x01 + idx`.
pub fn endpoints(idx: usize) -> (u8, u8) {
    (0x81 + idx as u8, 0x01 + idx as u8)
}

/// Interface a stream needs claimed from the kernel. Serial streams go
/// through the kernel's usb-serial driver, which must keep its interface.
pub fn claimed_interface(stream: usize, kind: TransferType) -> Option<u8> {
    (kind != TransferType::Serial).then_some(stream as u8)
}

/// Control, Isochronous, Bulk or Interrupt stream over an open device handle.
///
/// One IN and one OUT transfer are kept per stream. Both are submitted and
/// left to complete while the device services its events; nothing here
/// waits on the bus.
pub struct UsbTransport {
    stream: u16,
    kind: TransferType,
    rx: Option<AsyncTransfer>,
    tx: Option<AsyncTransfer>,
    rx_ready: VecDeque<Vec<u8>>,
    tx_len: usize,
}

impl UsbTransport {
    pub fn new(
        handle: SharedHandle,
        stream: usize,
        kind: TransferType,
    ) -> Result<Self, TransportError> {
        let (ep_in, ep_out) = match kind {
            TransferType::Control => (0x80, 0x00),
            TransferType::Bulk | TransferType::Interrupt | TransferType::Isochronous => {
                endpoints(stream)
            }
            TransferType::Serial => return Err(TransportError::Unsupported(kind)),
        };
        let (rx, tx) = match kind {
            TransferType::Isochronous => (
                AsyncTransfer::new(
                    Rc::clone(&handle),
                    kind,
                    ep_in,
                    MAX_PACKET * ISO_PACKETS_PER_TRANSFER,
                    ISO_PACKETS_PER_TRANSFER,
                    MAX_PACKET,
                )?,
                AsyncTransfer::new(handle, kind, ep_out, MAX_PACKET, 1, MAX_PACKET)?,
            ),
            TransferType::Bulk => (
                AsyncTransfer::new(Rc::clone(&handle), kind, ep_in, BULK_TRANSFER, 0, 0)?,
                AsyncTransfer::new(handle, kind, ep_out, BULK_TRANSFER, 0, 0)?,
            ),
            _ => (
                AsyncTransfer::new(Rc::clone(&handle), kind, ep_in, MAX_PACKET, 0, 0)?,
                AsyncTransfer::new(handle, kind, ep_out, MAX_PACKET, 0, 0)?,
            ),
        };
        debug!(stream, %kind, ep_in, ep_out, "usb endpoints bound");
        Ok(Self {
            stream: stream as u16,
            kind,
            rx: Some(rx),
            tx: Some(tx),
            rx_ready: VecDeque::new(),
            tx_len: 0,
        })
    }

    fn setup(&self, direction: Direction, len: usize) -> Option<[u8; 8]> {
        if self.kind != TransferType::Control {
            return None;
        }
        let request = match direction {
            Direction::In => REQ_STREAM_IN,
            Direction::Out => REQ_STREAM_OUT,
        };
        let request_type = rusb::request_type(direction, RequestType::Vendor, Recipient::Interface);
        Some(control_setup(request_type, request, 0, self.stream, len))
    }
}

impl Transport for UsbTransport {
    fn max_packet(&self) -> usize {
        MAX_PACKET
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let setup = self.setup(Direction::Out, data.len().min(MAX_PACKET));
        let tx = self.tx.as_mut().ok_or(TransportError::NotOpen)?;
        if let Some(chunks) = tx.reap()? {
            let moved: usize = chunks.iter().map(Vec::len).sum();
            if moved < self.tx_len {
                warn!(stream = self.stream, moved, expected = self.tx_len, "short OUT transfer");
            }
        }
        if tx.is_busy() {
            return Ok(0);
        }
        let len = data.len().min(tx.capacity());
        tx.submit_out(&data[..len], setup)?;
        self.tx_len = len;
        Ok(len)
    }

    fn request(&mut self, len: usize) -> Result<(), TransportError> {
        let setup = self.setup(Direction::In, len.min(MAX_PACKET));
        let rx = self.rx.as_mut().ok_or(TransportError::NotOpen)?;
        if rx.is_busy() || !self.rx_ready.is_empty() || len == 0 {
            return Ok(());
        }
        rx.submit_in(len, setup)
    }

    fn poll(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let rx = self.rx.as_mut().ok_or(TransportError::NotOpen)?;
        if let Some(chunks) = rx.reap()? {
            self.rx_ready.extend(chunks.into_iter().filter(|c| !c.is_empty()));
        }
        let Some(mut chunk) = self.rx_ready.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.rx_ready.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn close(&mut self) {
        // dropping the transfers cancels anything still in flight
        let rx = self.rx.take();
        let tx = self.tx.take();
        if rx.is_some() || tx.is_some() {
            drop((rx, tx));
            self.rx_ready.clear();
            debug!(stream = self.stream, "usb endpoints released");
        }
    }
}
