//! Submitted libusb transfers.
//!
//! A transfer is filled in, submitted and left alone. libusb completes it
//! from inside `handle_events`, which the device runs once per loop
//! iteration, and the owner collects the result on a later poll. Everything
//! runs on the loop thread, so completion state needs no locking.

use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};

use rusb::UsbContext;
use tracing::warn;

use super::TransportError;
use super::usb::SharedHandle;
use crate::stream::TransferType;

/// libusb transfer type codes
mod transfer_type {
    pub const CONTROL: u8 = 0;
    pub const ISOCHRONOUS: u8 = 1;
    pub const BULK: u8 = 2;
    pub const INTERRUPT: u8 = 3;
}

/// libusb transfer status codes
mod status {
    pub const COMPLETED: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const TIMED_OUT: i32 = 2;
    pub const CANCELLED: i32 = 3;
    pub const STALL: i32 = 4;
    pub const NO_DEVICE: i32 = 5;
    pub const OVERFLOW: i32 = 6;
}

const LIBUSB_ERROR_NOT_FOUND: i32 = -5;

pub const SETUP_LEN: usize = 8;

/// How long a cancelled transfer may take to be handed back before its
/// memory is abandoned to libusb.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Written by [`transfer_done`] when libusb hands a transfer back.
#[derive(Debug, Default)]
struct Completion {
    done: bool,
    status: i32,
    actual: usize,
    /// `(status, actual_length)` of each isochronous packet.
    packets: Vec<(i32, usize)>,
}

extern "system" fn transfer_done(xfr: *mut libusb1_sys::libusb_transfer) {
    // SAFETY: libusb passes back the transfer we submitted. Its user_data is
    // the Completion owned by the AsyncTransfer, which is not freed while the
    // transfer is in flight.
    unsafe {
        let done = &mut *((*xfr).user_data as *mut Completion);
        done.status = (*xfr).status;
        done.actual = (*xfr).actual_length.max(0) as usize;
        done.packets.clear();
        let descs = ptr::addr_of!((*xfr).iso_packet_desc)
            .cast::<libusb1_sys::libusb_iso_packet_descriptor>();
        for i in 0..(*xfr).num_iso_packets.max(0) as usize {
            let desc = &*descs.add(i);
            done.packets.push((desc.status, desc.actual_length as usize));
        }
        done.done = true;
    }
}

/// Maps a libusb error return code.
pub fn usb_error(code: i32) -> rusb::Error {
    match code {
        -1 => rusb::Error::Io,
        -2 => rusb::Error::InvalidParam,
        -3 => rusb::Error::Access,
        -4 => rusb::Error::NoDevice,
        -5 => rusb::Error::NotFound,
        -6 => rusb::Error::Busy,
        -7 => rusb::Error::Timeout,
        -8 => rusb::Error::Overflow,
        -9 => rusb::Error::Pipe,
        -10 => rusb::Error::Interrupted,
        -11 => rusb::Error::NoMem,
        -12 => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

/// Outcome of a completed transfer. Timeouts and cancellations simply carry
/// whatever data arrived.
fn check_status(code: i32) -> Result<(), rusb::Error> {
    match code {
        status::COMPLETED | status::TIMED_OUT | status::CANCELLED => Ok(()),
        status::STALL => Err(rusb::Error::Pipe),
        status::NO_DEVICE => Err(rusb::Error::NoDevice),
        status::OVERFLOW => Err(rusb::Error::Overflow),
        status::ERROR => Err(rusb::Error::Io),
        _ => Err(rusb::Error::Other),
    }
}

/// Setup packet of a control transfer.
pub fn control_setup(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    len: usize,
) -> [u8; SETUP_LEN] {
    let mut setup = [0u8; SETUP_LEN];
    setup[0] = request_type;
    setup[1] = request;
    setup[2..4].copy_from_slice(&value.to_le_bytes());
    setup[4..6].copy_from_slice(&index.to_le_bytes());
    setup[6..8].copy_from_slice(&(len as u16).to_le_bytes());
    setup
}

/// One reusable libusb transfer with its own buffer.
pub struct AsyncTransfer {
    handle: SharedHandle,
    xfr: NonNull<libusb1_sys::libusb_transfer>,
    done: NonNull<Completion>,
    buf: Vec<u8>,
    kind: TransferType,
    endpoint: u8,
    iso_packets: usize,
    packet_len: usize,
    in_flight: bool,
}

impl AsyncTransfer {
    /// `capacity` is the largest data stage; isochronous transfers carry up
    /// to `iso_packets` packets of `packet_len` bytes.
    pub fn new(
        handle: SharedHandle,
        kind: TransferType,
        endpoint: u8,
        capacity: usize,
        iso_packets: usize,
        packet_len: usize,
    ) -> Result<Self, TransportError> {
        // SAFETY: plain allocation, released in Drop.
        let raw = unsafe { libusb1_sys::libusb_alloc_transfer(iso_packets as i32) };
        let xfr = NonNull::new(raw).ok_or(TransportError::Usb(rusb::Error::NoMem))?;
        let done = NonNull::from(Box::leak(Box::<Completion>::default()));
        let setup = if kind == TransferType::Control { SETUP_LEN } else { 0 };
        Ok(Self {
            handle,
            xfr,
            done,
            buf: vec![0u8; setup + capacity],
            kind,
            endpoint,
            iso_packets,
            packet_len,
            in_flight: false,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    fn data_offset(&self) -> usize {
        if self.kind == TransferType::Control { SETUP_LEN } else { 0 }
    }

    /// Largest data stage one submission can carry.
    pub fn capacity(&self) -> usize {
        self.buf.len() - self.data_offset()
    }

    /// Starts an IN transfer of up to `len` bytes.
    pub fn submit_in(
        &mut self,
        len: usize,
        setup: Option<[u8; SETUP_LEN]>,
    ) -> Result<(), TransportError> {
        self.ensure_idle()?;
        let len = len.min(self.capacity());
        if let Some(setup) = setup {
            self.buf[..SETUP_LEN].copy_from_slice(&setup);
        }
        let packets = if self.kind == TransferType::Isochronous {
            self.iso_packets
        } else {
            0
        };
        self.fire(len, packets, self.packet_len)
    }

    /// Starts an OUT transfer carrying `data`, which must fit the capacity.
    /// An isochronous OUT transfer is a single packet.
    pub fn submit_out(
        &mut self,
        data: &[u8],
        setup: Option<[u8; SETUP_LEN]>,
    ) -> Result<(), TransportError> {
        self.ensure_idle()?;
        let off = self.data_offset();
        let len = data.len().min(self.capacity());
        if let Some(setup) = setup {
            self.buf[..SETUP_LEN].copy_from_slice(&setup);
        }
        self.buf[off..off + len].copy_from_slice(&data[..len]);
        let packets = usize::from(self.kind == TransferType::Isochronous);
        self.fire(len, packets, len)
    }

    // the buffer belongs to libusb until the transfer is handed back
    fn ensure_idle(&self) -> Result<(), TransportError> {
        if self.in_flight {
            return Err(TransportError::Usb(rusb::Error::Busy));
        }
        Ok(())
    }

    fn fire(
        &mut self,
        len: usize,
        packets: usize,
        packet_len: usize,
    ) -> Result<(), TransportError> {
        let transfer_type = match self.kind {
            TransferType::Control => transfer_type::CONTROL,
            TransferType::Isochronous => transfer_type::ISOCHRONOUS,
            TransferType::Interrupt => transfer_type::INTERRUPT,
            TransferType::Bulk | TransferType::Serial => transfer_type::BULK,
        };
        let total = if packets > 0 {
            packets * packet_len
        } else {
            self.data_offset() + len
        };
        let dev_handle = self.handle.as_raw();
        // SAFETY: the transfer is idle, so libusb holds no reference to it or
        // to the buffer. Neither is moved or freed until it is handed back.
        unsafe {
            *self.done.as_ptr() = Completion::default();
            let x = self.xfr.as_ptr();
            (*x).dev_handle = dev_handle;
            (*x).flags = 0;
            (*x).endpoint = self.endpoint;
            (*x).transfer_type = transfer_type;
            (*x).timeout = 0;
            (*x).length = total as i32;
            (*x).buffer = self.buf.as_mut_ptr();
            (*x).num_iso_packets = packets as i32;
            (*x).callback = transfer_done;
            (*x).user_data = self.done.as_ptr().cast();
            if packets > 0 {
                libusb1_sys::libusb_set_iso_packet_lengths(x, packet_len as u32);
            }
            let ret = libusb1_sys::libusb_submit_transfer(x);
            if ret < 0 {
                return Err(TransportError::Usb(usb_error(ret)));
            }
        }
        self.in_flight = true;
        Ok(())
    }

    fn completed(&self) -> bool {
        // SAFETY: only written from transfer_done, which runs on this thread
        // inside handle_events, never concurrently with us.
        unsafe { (*self.done.as_ptr()).done }
    }

    /// Collects a finished transfer. Returns `None` while it is still in
    /// flight, otherwise the data that moved: one chunk for an ordinary
    /// transfer, one per delivered packet for an isochronous one. Lost
    /// isochronous packets are left out.
    pub fn reap(&mut self) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        if !self.in_flight || !self.completed() {
            return Ok(None);
        }
        self.in_flight = false;
        // SAFETY: the transfer has been handed back; see `completed`.
        let done = unsafe { &*self.done.as_ptr() };
        check_status(done.status)?;

        if self.kind == TransferType::Isochronous {
            let mut chunks = Vec::new();
            for (i, &(pkt_status, actual)) in done.packets.iter().enumerate() {
                if pkt_status != status::COMPLETED || actual == 0 {
                    continue;
                }
                let start = i * self.packet_len;
                chunks.push(self.buf[start..start + actual.min(self.packet_len)].to_vec());
            }
            return Ok(Some(chunks));
        }
        let off = self.data_offset();
        let end = (off + done.actual).min(self.buf.len());
        Ok(Some(vec![self.buf[off..end].to_vec()]))
    }
}

impl Drop for AsyncTransfer {
    fn drop(&mut self) {
        if self.in_flight && !self.completed() {
            // SAFETY: the transfer is ours and was submitted.
            let ret = unsafe { libusb1_sys::libusb_cancel_transfer(self.xfr.as_ptr()) };
            if ret < 0 && ret != LIBUSB_ERROR_NOT_FOUND {
                warn!(endpoint = self.endpoint, "failed to cancel transfer: {}", usb_error(ret));
            }
            let context = self.handle.context().clone();
            let deadline = Instant::now() + CANCEL_GRACE;
            while !self.completed() && Instant::now() < deadline {
                match context.handle_events(Some(Duration::from_millis(10))) {
                    Ok(()) | Err(rusb::Error::Interrupted) => {}
                    Err(_) => break,
                }
            }
            if !self.completed() {
                // libusb may still write into these; leaking beats a use-after-free
                warn!(endpoint = self.endpoint, "transfer not handed back after cancel");
                std::mem::forget(std::mem::take(&mut self.buf));
                return;
            }
        }
        // SAFETY: the transfer is idle and both allocations are ours.
        unsafe {
            libusb1_sys::libusb_free_transfer(self.xfr.as_ptr());
            drop(Box::from_raw(self.done.as_ptr()));
        }
    }
}
