//! One logical data channel between the host and the device.
//!
//! A stream receives LFSR-generated data from the device, optionally checks
//! it, and sends host LFSR data back (XORed with what it received when both
//! directions are active). The transfer type is fixed at construction and
//! selects the completion rule and packetisation; the transport behind it is
//! only reached through [`Transport`].

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, info, warn};

use crate::test::test_config::TestConfig;
use crate::transport::{PortPair, Transport, TransportError, TransportOpener};

pub mod lfsr;
pub mod signature;

use lfsr::Lfsr;
use signature::{SIGNATURE_LEN, Signature};

/// Forward sequence distance still counted as loss; anything further
/// ahead is taken to be behind the expected number instead.
const SEQ_WINDOW: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
    /// Bulk endpoints reached through the host's serial (ttyUSB) driver.
    Serial,
}

impl TransferType {
    pub fn name(self) -> &'static str {
        match self {
            TransferType::Control => "Control",
            TransferType::Isochronous => "Isochronous",
            TransferType::Bulk => "Bulk",
            TransferType::Interrupt => "Interrupt",
            TransferType::Serial => "Serial",
        }
    }

    /// Packets moved per transfer.
    fn packets_per_transfer(self) -> usize {
        match self {
            TransferType::Bulk | TransferType::Serial => 8,
            _ => 1,
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which directions a stream exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directions {
    pub retrieve: bool,
    pub check: bool,
    pub send: bool,
}

pub struct Stream {
    idx: usize,
    kind: TransferType,
    dirs: Directions,
    // user chose the directions, so device signatures may not change them
    dirs_fixed: bool,
    verbose: bool,

    transfer_bytes: u64,
    bytes_sent: u64,
    bytes_recvd: u64,
    completed: bool,
    paused: bool,
    end_of_test: bool,

    transport: Option<Box<dyn Transport>>,
    rx_buf: Vec<u8>,
    rx_lfsr: Lfsr,
    tx_lfsr: Lfsr,
    // received payload awaiting its echo
    echo: VecDeque<u8>,
    // generated OUT data not yet accepted by the transport
    staged: Vec<u8>,
    staged_payload: usize,
    tx_seq: u8,

    // leading bytes held back until we know whether they form a signature
    sig_pending: Vec<u8>,
    sig_resolved: bool,
    rx_seq: Option<u8>,

    check_errors: u64,
    dropped_packets: u64,
}

impl Stream {
    pub fn new(idx: usize, kind: TransferType, transfer_bytes: u64, cfg: &TestConfig) -> Self {
        Self {
            idx,
            kind,
            dirs: Directions {
                retrieve: cfg.retrieve,
                check: cfg.check,
                send: cfg.send,
            },
            dirs_fixed: cfg.override_flags,
            verbose: cfg.verbose,
            transfer_bytes,
            bytes_sent: 0,
            bytes_recvd: 0,
            completed: false,
            paused: false,
            end_of_test: false,
            transport: None,
            rx_buf: Vec::new(),
            rx_lfsr: Lfsr::device(idx),
            tx_lfsr: Lfsr::host(idx),
            echo: VecDeque::new(),
            staged: Vec::new(),
            staged_payload: 0,
            tx_seq: 0,
            sig_pending: Vec::new(),
            sig_resolved: false,
            rx_seq: None,
            check_errors: 0,
            dropped_packets: 0,
        }
    }

    /// Acquires the transport for this stream.
    pub fn open(
        &mut self,
        opener: &mut dyn TransportOpener,
        ports: &PortPair,
    ) -> Result<(), TransportError> {
        let transport = opener.open_transport(self.idx, self.kind, ports)?;
        self.rx_buf = vec![0u8; transport.max_packet() * self.kind.packets_per_transfer()];
        self.transport = Some(transport);
        debug!(stream = self.idx, kind = %self.kind, "stream open");
        Ok(())
    }

    /// Performs one non-blocking unit of work in each enabled direction.
    ///
    /// A stopped stream does nothing. While paused no new transfers are
    /// started, but data from outstanding ones is still collected.
    pub fn service(&mut self) -> Result<(), TransportError> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        let result = self.service_with(transport.as_mut());
        self.transport = Some(transport);
        result
    }

    fn service_with(&mut self, t: &mut dyn Transport) -> Result<(), TransportError> {
        if self.dirs.retrieve {
            self.receive(t)?;
        }
        if self.dirs.send {
            self.transmit(t)?;
        }
        if !self.completed && self.finished() {
            self.completed = true;
            info!(
                stream = self.idx,
                sent = self.bytes_sent,
                recvd = self.bytes_recvd,
                "stream completed"
            );
        }
        Ok(())
    }

    fn receive(&mut self, t: &mut dyn Transport) -> Result<(), TransportError> {
        if !self.paused && !self.rx_done() {
            t.request(self.rx_len())?;
        }
        let mut buf = std::mem::take(&mut self.rx_buf);
        let result = t.poll(&mut buf);
        if let Ok(n) = result
            && n > 0
        {
            if self.kind == TransferType::Isochronous {
                self.absorb_packet(&buf[..n]);
            } else {
                self.absorb(&buf[..n]);
            }
        }
        self.rx_buf = buf;
        result.map(|_| ())
    }

    fn rx_done(&self) -> bool {
        let enough = self.bytes_recvd >= self.transfer_bytes;
        match self.kind {
            TransferType::Isochronous => self.end_of_test || enough,
            _ => enough && self.sig_pending.is_empty(),
        }
    }

    fn rx_len(&self) -> usize {
        let max = self.rx_buf.len();
        if self.kind == TransferType::Isochronous {
            return max;
        }
        let mut left = self.transfer_bytes.saturating_sub(self.bytes_recvd);
        if !self.sig_resolved {
            left += (SIGNATURE_LEN - self.sig_pending.len()) as u64;
        }
        left.min(max as u64) as usize
    }

    fn absorb(&mut self, data: &[u8]) {
        if self.sig_resolved {
            self.accept_payload(data);
            return;
        }
        self.sig_pending.extend_from_slice(data);
        let held = self.sig_pending.len();
        if held < SIGNATURE_LEN
            && Signature::could_start(&self.sig_pending)
            && (held as u64) < self.transfer_bytes
        {
            return;
        }
        self.sig_resolved = true;
        let pending = std::mem::take(&mut self.sig_pending);
        match Signature::parse(&pending) {
            Some(sig) => {
                self.apply_signature(&sig);
                self.accept_payload(&pending[SIGNATURE_LEN..]);
            }
            None => self.accept_payload(&pending),
        }
    }

    fn apply_signature(&mut self, sig: &Signature) {
        info!(
            stream = self.idx,
            lfsr = sig.init_lfsr,
            bytes = sig.num_bytes,
            flags = sig.flags,
            "stream signature"
        );
        self.rx_lfsr = Lfsr::new(sig.init_lfsr);
        // a shorter count must not strand bytes already handed over
        let committed = self.bytes_sent + self.staged.len() as u64;
        self.transfer_bytes = u64::from(sig.num_bytes).max(committed);
        if !self.dirs_fixed {
            self.dirs = Directions {
                retrieve: sig.retrieve(),
                check: sig.check(),
                send: sig.send(),
            };
        }
    }

    fn absorb_packet(&mut self, packet: &[u8]) {
        let Some(sig) = Signature::parse(packet) else {
            warn!(stream = self.idx, len = packet.len(), "isochronous packet without signature");
            self.check_errors += 1;
            return;
        };
        if let Some(expected) = self.rx_seq
            && sig.seq != expected
        {
            let gap = sig.seq.wrapping_sub(expected);
            if gap >= SEQ_WINDOW {
                // behind the window: a duplicate or a late arrival
                debug!(stream = self.idx, expected, got = sig.seq, "stale isochronous packet");
                return;
            }
            self.dropped_packets += u64::from(gap);
            debug!(stream = self.idx, expected, got = sig.seq, "isochronous packets dropped");
        }
        self.rx_seq = Some(sig.seq.wrapping_add(1));
        self.rx_lfsr = Lfsr::new(sig.init_lfsr);
        self.accept_payload(&packet[SIGNATURE_LEN..]);
        if sig.end_of_test() {
            debug!(stream = self.idx, "end of test signalled");
            self.end_of_test = true;
        }
    }

    fn accept_payload(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.dirs.check {
            let bad = self.rx_lfsr.check(data);
            if bad > 0 {
                self.check_errors += bad as u64;
                warn!(
                    stream = self.idx,
                    offset = self.bytes_recvd,
                    mismatches = bad,
                    "received data does not match expected sequence"
                );
            }
        } else {
            self.rx_lfsr.advance(data.len());
        }
        if self.dirs.send {
            self.echo.extend(data);
        }
        self.bytes_recvd += data.len() as u64;
        if self.verbose {
            debug!(stream = self.idx, len = data.len(), total = self.bytes_recvd, "received");
        }
    }

    fn transmit(&mut self, t: &mut dyn Transport) -> Result<(), TransportError> {
        if self.paused {
            return Ok(());
        }
        if self.staged.is_empty() {
            self.stage(t.max_packet());
        }
        if self.staged.is_empty() {
            return Ok(());
        }
        let n = t.send(&self.staged)?;
        if n == 0 {
            return Ok(());
        }
        if self.kind == TransferType::Isochronous {
            // packets go out whole or not at all
            self.bytes_sent += self.staged_payload as u64;
            self.staged.clear();
        } else {
            let n = n.min(self.staged.len());
            self.staged.drain(..n);
            self.bytes_sent += n as u64;
        }
        if self.verbose {
            debug!(stream = self.idx, len = n, total = self.bytes_sent, "sent");
        }
        Ok(())
    }

    /// Generates the next OUT transfer into `staged`.
    fn stage(&mut self, max_packet: usize) {
        let room = self.transfer_bytes.saturating_sub(self.bytes_sent);
        let mut len = if self.kind == TransferType::Isochronous {
            max_packet - SIGNATURE_LEN
        } else {
            max_packet * self.kind.packets_per_transfer()
        };
        len = len.min(room as usize);
        if self.dirs.retrieve {
            len = len.min(self.echo.len());
        }
        if len == 0 {
            return;
        }

        if self.kind == TransferType::Isochronous {
            let sig = Signature {
                init_lfsr: self.tx_lfsr.state(),
                stream: self.idx as u8,
                flags: 0,
                seq: self.tx_seq,
                num_bytes: len as u32,
            };
            self.tx_seq = self.tx_seq.wrapping_add(1);
            self.staged.extend_from_slice(&sig.encode());
        }
        for _ in 0..len {
            let mut b = self.tx_lfsr.next_byte();
            if self.dirs.retrieve
                && let Some(rx) = self.echo.pop_front()
            {
                b ^= rx;
            }
            self.staged.push(b);
        }
        self.staged_payload = len;
    }

    fn finished(&self) -> bool {
        let rx_done = !self.dirs.retrieve || self.rx_done();
        let tx_done = !self.dirs.send || self.bytes_sent >= self.transfer_bytes;
        (rx_done && tx_done) || (self.kind == TransferType::Isochronous && self.end_of_test)
    }

    /// Stops initiating transfers until [`Stream::resume`].
    pub fn pause(&mut self) {
        self.paused = true;
        debug!(stream = self.idx, "paused");
    }

    pub fn resume(&mut self) {
        self.paused = false;
        debug!(stream = self.idx, "resumed");
    }

    /// Releases the transport. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            debug!(stream = self.idx, "stopped");
        }
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    #[cfg(test)]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn kind(&self) -> TransferType {
        self.kind
    }

    pub fn transfer_bytes(&self) -> u64 {
        self.transfer_bytes
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_recvd(&self) -> u64 {
        self.bytes_recvd
    }

    pub fn check_errors(&self) -> u64 {
        self.check_errors
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }
}
