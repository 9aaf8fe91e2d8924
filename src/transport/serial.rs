use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use super::{Transport, TransportError};

pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

// The ttyUSB devices are USB serial functions; the line rate is nominal.
const BAUD: u32 = 115_200;
const MAX_PACKET: usize = 64;

/// Input and output serial port names for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPair {
    pub input: String,
    pub output: String,
}

impl PortPair {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Moves both names on to the ports of the next stream.
    pub fn advance(&mut self) {
        self.input = port_next(&self.input);
        self.output = port_next(&self.output);
    }
}

impl Default for PortPair {
    fn default() -> Self {
        Self::new(DEFAULT_PORT, DEFAULT_PORT)
    }
}

/// Name of the port following `name`, by incrementing its first number
/// (`/dev/ttyUSB3` -> `/dev/ttyUSB4`). Names without a number are returned
/// unchanged.
pub fn port_next(name: &str) -> String {
    let Some(start) = name.find(|c: char| c.is_ascii_digit()) else {
        return name.to_string();
    };
    let len = name[start..]
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(name.len() - start);
    let end = start + len;
    match name[start..end].parse::<u32>() {
        Ok(n) => format!("{}{}{}", &name[..start], n.wrapping_add(1), &name[end..]),
        Err(_) => name.to_string(),
    }
}

fn open_port(path: &str) -> Result<Box<dyn SerialPort>, TransportError> {
    let builder = serialport::new(path, BAUD)
        .timeout(Duration::from_millis(1))
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None);

    let port = builder.open().map_err(|source| TransportError::Serial {
        port: path.to_string(),
        source,
    })?;
    // stale data from an earlier run would throw the checker off
    port.clear(ClearBuffer::All)
        .map_err(|source| TransportError::Serial {
            port: path.to_string(),
            source,
        })?;
    Ok(port)
}

/// Bulk stream tunnelled through the device's USB serial functions.
pub struct SerialTransport {
    input: Option<Box<dyn SerialPort>>,
    output: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn open(ports: &PortPair) -> Result<Self, TransportError> {
        let output = open_port(&ports.output)?;
        let input = if ports.input == ports.output {
            output.try_clone().map_err(|source| TransportError::Serial {
                port: ports.input.clone(),
                source,
            })?
        } else {
            open_port(&ports.input)?
        };
        debug!(input = %ports.input, output = %ports.output, "serial ports open");
        Ok(Self {
            input: Some(input),
            output: Some(output),
        })
    }
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

impl Transport for SerialTransport {
    fn max_packet(&self) -> usize {
        MAX_PACKET
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.output.as_mut().ok_or(TransportError::NotOpen)?;
        match port.write(data) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn request(&mut self, _len: usize) -> Result<(), TransportError> {
        // the tty layer keeps reading on our behalf
        if self.input.is_none() {
            return Err(TransportError::NotOpen);
        }
        Ok(())
    }

    fn poll(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let port = self.input.as_mut().ok_or(TransportError::NotOpen)?;
        let avail = port.bytes_to_read().map_err(|source| TransportError::Serial {
            port: port.name().unwrap_or_default(),
            source,
        })? as usize;
        if avail == 0 {
            return Ok(0);
        }
        let n = avail.min(buf.len());
        match port.read(&mut buf[..n]) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if self.input.take().is_some() | self.output.take().is_some() {
            debug!("serial ports closed");
        }
    }
}
