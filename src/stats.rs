use std::io::Write;
use std::time::Duration;

use tracing::info;

use crate::stream::{Stream, TransferType};

/// Sent-byte movement between progress lines.
const REPORT_DELTA: u64 = 0x1000;

/// Byte counts summed over all streams for one loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub target: u64,
    pub recvd: u64,
    pub sent: u64,
}

impl Totals {
    pub fn add(&mut self, stream: &Stream) {
        self.target += stream.transfer_bytes();
        self.recvd += stream.bytes_recvd();
        self.sent += stream.bytes_sent();
    }

    /// Bytes still to be sent. With isochronous streams this can reach zero
    /// before the device finishes, since packet delivery is not guaranteed.
    pub fn left_to_send(&self) -> u64 {
        self.target.saturating_sub(self.sent)
    }
}

/// Live progress line on stderr.
#[derive(Debug, Default)]
pub struct Progress {
    prev_sent: u64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prints the running totals once enough data has moved, or when the
    /// test is done. Returns whether a line was printed.
    pub fn maybe_print(&mut self, totals: &Totals, done: bool) -> bool {
        if totals.sent.abs_diff(self.prev_sent) < REPORT_DELTA && !done {
            return false;
        }
        let mut err = std::io::stderr().lock();
        let _ = write!(
            err,
            "Bytes received: 0x{:x} -- Left to send: 0x{:x}         \r",
            totals.recvd,
            totals.left_to_send()
        );
        if done {
            let _ = writeln!(err);
        }
        let _ = err.flush();
        self.prev_sent = totals.sent;
        true
    }
}

/// Final figures for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub idx: usize,
    pub kind: TransferType,
    pub transfer_bytes: u64,
    pub sent: u64,
    pub recvd: u64,
    pub check_errors: u64,
    pub dropped_packets: u64,
}

impl StreamReport {
    pub fn from_stream(stream: &Stream) -> Self {
        Self {
            idx: stream.index(),
            kind: stream.kind(),
            transfer_bytes: stream.transfer_bytes(),
            sent: stream.bytes_sent(),
            recvd: stream.bytes_recvd(),
            check_errors: stream.check_errors(),
            dropped_packets: stream.dropped_packets(),
        }
    }
}

/// Result of a completed test run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub streams: Vec<StreamReport>,
}

impl RunSummary {
    pub fn total_sent(&self) -> u64 {
        self.streams.iter().map(|s| s.sent).sum()
    }

    pub fn total_recvd(&self) -> u64 {
        self.streams.iter().map(|s| s.recvd).sum()
    }

    pub fn check_errors(&self) -> u64 {
        self.streams.iter().map(|s| s.check_errors).sum()
    }

    pub fn log(&self) {
        for s in &self.streams {
            info!(
                "S{}: {} target=0x{:x} sent=0x{:x} recvd=0x{:x} check_errors={} dropped={}",
                s.idx, s.kind, s.transfer_bytes, s.sent, s.recvd, s.check_errors, s.dropped_packets
            );
        }
        let secs = self.elapsed.as_secs_f64();
        let rate = (self.total_sent() + self.total_recvd()) as f64 / secs.max(1e-3);
        info!(
            "Test completed in {:.2} seconds ({}us), {:.1}kB/s",
            secs,
            self.elapsed.as_micros(),
            rate / 1000.0
        );
    }
}
