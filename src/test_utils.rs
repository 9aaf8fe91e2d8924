//! Scripted stand-ins for the device and its transports.
//!
//! A [`MockDevice`] opens one [`MockTransport`] per stream. Each transport
//! plays the device's side of the stream: it hands out the device's LFSR
//! sequence in response to IN requests and records everything the host
//! sends. Every call is written to a shared [`Journal`] so tests can assert
//! on ordering.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::device::{DeviceError, DevicePowerState, TestDevice};
use crate::stream::TransferType;
use crate::stream::lfsr::Lfsr;
use crate::stream::signature::{
    FLAG_CHECK, FLAG_END, FLAG_RETRIEVE, FLAG_SEND, SIGNATURE_LEN, Signature,
};
use crate::test::test_config::TestConfig;
use crate::transport::usb::claimed_interface;
use crate::transport::{PortPair, Transport, TransportError, TransportOpener};

const MAX_PACKET: usize = 64;

pub fn test_config() -> TestConfig {
    TestConfig::default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Open(usize),
    Claim(u8),
    Request(usize),
    Poll(usize),
    Send(usize),
    Close(usize),
    Suspend,
    Resume,
    SetState(DevicePowerState),
}

/// Shared record of transport and device calls, each tagged with the device
/// power state at the time.
#[derive(Clone)]
pub struct Journal {
    events: Rc<RefCell<Vec<(DevicePowerState, Event)>>>,
    state: Rc<Cell<DevicePowerState>>,
}

impl Default for Journal {
    fn default() -> Self {
        Self {
            events: Rc::default(),
            state: Rc::new(Cell::new(DevicePowerState::Streaming)),
        }
    }
}

impl Journal {
    fn record(&self, event: Event) {
        self.events.borrow_mut().push((self.state.get(), event));
    }

    fn events(&self) -> Vec<Event> {
        self.events.borrow().iter().map(|&(_, e)| e).collect()
    }

    fn indices(&self, pick: impl Fn(Event) -> Option<usize>) -> Vec<usize> {
        self.events().into_iter().filter_map(pick).collect()
    }

    pub fn opens(&self) -> Vec<usize> {
        self.indices(|e| match e {
            Event::Open(idx) => Some(idx),
            _ => None,
        })
    }

    pub fn claims(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Claim(interface) => Some(interface),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<usize> {
        self.indices(|e| match e {
            Event::Close(idx) => Some(idx),
            _ => None,
        })
    }

    pub fn count_polls(&self, stream: usize) -> usize {
        self.events()
            .into_iter()
            .filter(|e| *e == Event::Poll(stream))
            .count()
    }

    pub fn count_requests(&self, stream: usize) -> usize {
        self.events()
            .into_iter()
            .filter(|e| *e == Event::Request(stream))
            .count()
    }

    pub fn power_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Suspend | Event::Resume | Event::SetState(_)))
            .collect()
    }

    pub fn states_at_polls(&self) -> Vec<(DevicePowerState, Event)> {
        self.events
            .borrow()
            .iter()
            .filter(|(_, e)| matches!(e, Event::Poll(_)))
            .copied()
            .collect()
    }
}

/// How the device behaves on one stream.
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// Payload bytes the device sends.
    pub device_bytes: u64,
    /// Prefix the data with a signature carrying this LFSR seed.
    pub signature: Option<u8>,
    /// Direction flags of that signature; all directions when unset.
    pub signature_flags: Option<u8>,
    /// Flip a bit of the payload at this offset.
    pub corrupt_at: Option<u64>,
    /// Lose every n-th isochronous packet (never the last one).
    pub drop_every: Option<usize>,
    /// Fail every poll after this many.
    pub fail_poll_after: Option<usize>,
    /// Accept at most this many bytes per send.
    pub max_accept: Option<usize>,
    /// Report busy on every n-th send.
    pub busy_every: Option<usize>,
    /// Hand back at most this many bytes per poll.
    pub max_reply: Option<usize>,
}

impl LinkConfig {
    pub fn bytes(device_bytes: u64) -> Self {
        Self {
            device_bytes,
            ..Self::default()
        }
    }
}

/// Device end of one stream.
#[derive(Debug, Default)]
pub struct Link {
    /// Everything the host has sent.
    pub from_host: Vec<u8>,
    to_host: VecDeque<u8>,
    packets: VecDeque<Vec<u8>>,
}

impl Link {
    fn new(idx: usize, kind: TransferType, cfg: &LinkConfig) -> Self {
        let mut link = Link::default();
        let seed = cfg.signature.unwrap_or(Lfsr::device(idx).state());
        let mut data = vec![0u8; cfg.device_bytes as usize];
        Lfsr::new(seed).fill(&mut data);
        if let Some(at) = cfg.corrupt_at
            && let Some(b) = data.get_mut(at as usize)
        {
            *b ^= 0x01;
        }

        if kind == TransferType::Isochronous {
            let mut lfsr = Lfsr::new(seed);
            let chunks: Vec<&[u8]> = data.chunks(MAX_PACKET - SIGNATURE_LEN).collect();
            for (k, chunk) in chunks.iter().enumerate() {
                let last = k + 1 == chunks.len();
                let sig = Signature {
                    init_lfsr: lfsr.state(),
                    stream: idx as u8,
                    flags: if last { FLAG_END } else { 0 },
                    seq: k as u8,
                    num_bytes: chunk.len() as u32,
                };
                lfsr.advance(chunk.len());
                if let Some(every) = cfg.drop_every
                    && (k + 1) % every == 0
                    && !last
                {
                    continue;
                }
                let mut packet = sig.encode().to_vec();
                packet.extend_from_slice(chunk);
                link.packets.push_back(packet);
            }
        } else {
            if let Some(seed) = cfg.signature {
                let sig = Signature {
                    init_lfsr: seed,
                    stream: idx as u8,
                    flags: cfg
                        .signature_flags
                        .unwrap_or(FLAG_RETRIEVE | FLAG_CHECK | FLAG_SEND),
                    seq: 0,
                    num_bytes: cfg.device_bytes as u32,
                };
                link.to_host.extend(sig.encode());
            }
            link.to_host.extend(data);
        }
        link
    }
}

pub struct MockTransport {
    idx: usize,
    kind: TransferType,
    journal: Journal,
    link: Rc<RefCell<Link>>,
    cfg: LinkConfig,
    polls: usize,
    sends: usize,
    outstanding: usize,
    closed: bool,
}

impl Transport for MockTransport {
    fn max_packet(&self) -> usize {
        MAX_PACKET
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::NotOpen);
        }
        self.journal.record(Event::Send(self.idx));
        self.sends += 1;
        if let Some(every) = self.cfg.busy_every
            && self.sends % every == 0
        {
            return Ok(0);
        }
        let n = data.len().min(self.cfg.max_accept.unwrap_or(usize::MAX));
        self.link.borrow_mut().from_host.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn request(&mut self, len: usize) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotOpen);
        }
        self.journal.record(Event::Request(self.idx));
        if self.outstanding == 0 {
            self.outstanding = len;
        }
        Ok(())
    }

    fn poll(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::NotOpen);
        }
        self.journal.record(Event::Poll(self.idx));
        self.polls += 1;
        if let Some(limit) = self.cfg.fail_poll_after
            && self.polls > limit
        {
            return Err(TransportError::Usb(rusb::Error::NoDevice));
        }
        if self.outstanding == 0 {
            return Ok(0);
        }
        let mut link = self.link.borrow_mut();
        let n = if self.kind == TransferType::Isochronous {
            let Some(packet) = link.packets.pop_front() else {
                return Ok(0);
            };
            buf[..packet.len()].copy_from_slice(&packet);
            packet.len()
        } else {
            let n = self
                .outstanding
                .min(buf.len())
                .min(link.to_host.len())
                .min(self.cfg.max_reply.unwrap_or(usize::MAX));
            for (dst, src) in buf.iter_mut().zip(link.to_host.drain(..n)) {
                *dst = src;
            }
            n
        };
        if n > 0 {
            self.outstanding = 0;
        }
        Ok(n)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.journal.record(Event::Close(self.idx));
        }
    }
}

/// Device whose streams are [`MockTransport`]s.
pub struct MockDevice {
    journal: Journal,
    link_cfg: LinkConfig,
    links: BTreeMap<usize, Rc<RefCell<Link>>>,
    serial_outputs: Vec<String>,
    services: usize,
    /// Refuse to open this stream.
    pub fail_open: Option<usize>,
    /// Use a different link configuration for one stream.
    pub link_for: Option<(usize, LinkConfig)>,
    /// Fail every device service call after this many.
    pub fail_service_after: Option<usize>,
    pub fail_suspend: bool,
}

impl MockDevice {
    pub fn new(link_cfg: LinkConfig) -> Self {
        Self {
            journal: Journal::default(),
            link_cfg,
            links: BTreeMap::new(),
            serial_outputs: Vec::new(),
            services: 0,
            fail_open: None,
            link_for: None,
            fail_service_after: None,
            fail_suspend: false,
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn link(&self, idx: usize) -> Rc<RefCell<Link>> {
        Rc::clone(&self.links[&idx])
    }

    /// Output port names of the serial streams, in open order.
    pub fn serial_outputs(&self) -> Vec<&str> {
        self.serial_outputs.iter().map(String::as_str).collect()
    }

    fn record_state(&mut self, state: DevicePowerState) {
        self.journal.state.set(state);
    }
}

impl TransportOpener for MockDevice {
    fn open_transport(
        &mut self,
        stream: usize,
        kind: TransferType,
        ports: &PortPair,
    ) -> Result<Box<dyn Transport>, TransportError> {
        if self.fail_open == Some(stream) {
            return Err(TransportError::Usb(rusb::Error::Busy));
        }
        if let Some(interface) = claimed_interface(stream, kind) {
            self.journal.record(Event::Claim(interface));
        }
        self.journal.record(Event::Open(stream));
        if kind == TransferType::Serial {
            self.serial_outputs.push(ports.output.clone());
        }
        let cfg = match &self.link_for {
            Some((idx, cfg)) if *idx == stream => cfg.clone(),
            _ => self.link_cfg.clone(),
        };
        let link = Rc::new(RefCell::new(Link::new(stream, kind, &cfg)));
        self.links.insert(stream, Rc::clone(&link));
        Ok(Box::new(MockTransport {
            idx: stream,
            kind,
            journal: self.journal.clone(),
            link,
            cfg,
            polls: 0,
            sends: 0,
            outstanding: 0,
            closed: false,
        }))
    }
}

impl TestDevice for MockDevice {
    fn state(&self) -> DevicePowerState {
        self.journal.state.get()
    }

    fn set_state(&mut self, state: DevicePowerState) {
        self.journal.record(Event::SetState(state));
        self.record_state(state);
    }

    fn suspend(&mut self) -> Result<(), DeviceError> {
        if self.fail_suspend {
            return Err(DeviceError::Usb(rusb::Error::NoDevice));
        }
        self.journal.record(Event::Suspend);
        self.record_state(DevicePowerState::Suspending);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        self.journal.record(Event::Resume);
        self.record_state(DevicePowerState::Resuming);
        Ok(())
    }

    fn service(&mut self) -> Result<(), DeviceError> {
        self.services += 1;
        match self.fail_service_after {
            Some(limit) if self.services > limit => Err(DeviceError::Usb(rusb::Error::NoDevice)),
            _ => Ok(()),
        }
    }
}
