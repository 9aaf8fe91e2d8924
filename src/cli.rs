use std::ffi::OsString;

use anyhow::{anyhow, bail};
use clap::Parser;

use crate::device::DeviceLocation;
use crate::test::test_config::DEFAULT_TRANSFER_BYTES;

pub const DEFAULT_VID: u16 = 0x18d1;
pub const DEFAULT_PID: u16 = 0x503a;

/// Boolean switches, as `(short, long)`. Each takes an attached value
/// (`-c0`, `-zy`) and means "on" when given bare.
const BOOL_FLAGS: [(char, &str); 6] = [
    ('c', "check"),
    ('r', "retrieve"),
    ('s', "send"),
    ('t', "serial"),
    ('v', "verbose"),
    ('z', "suspend"),
];

#[derive(Parser, Debug, Clone)]
#[command(
    name = "usbdev-stream",
    about = "Host side of the usbdev streaming tests",
    after_help = "Boolean switches take 0/1/n/y attached (e.g. -c0); given bare they mean 1."
)]
pub struct Cli {
    /// Check retrieved data against the expected sequence
    #[arg(short = 'c', long, value_name = "BOOL", num_args = 0..=1, require_equals = true,
          default_missing_value = "1", value_parser = parse_bool)]
    pub check: Option<bool>,
    /// Retrieve data from the device
    #[arg(short = 'r', long, value_name = "BOOL", num_args = 0..=1, require_equals = true,
          default_missing_value = "1", value_parser = parse_bool)]
    pub retrieve: Option<bool>,
    /// Send data to the device
    #[arg(short = 's', long, value_name = "BOOL", num_args = 0..=1, require_equals = true,
          default_missing_value = "1", value_parser = parse_bool)]
    pub send: Option<bool>,
    /// Use ttyUSB serial ports in preference to raw Bulk transfers
    #[arg(short = 't', long, value_name = "BOOL", num_args = 0..=1, require_equals = true,
          default_missing_value = "1", value_parser = parse_bool)]
    pub serial: Option<bool>,
    /// Verbose reporting
    #[arg(short = 'v', long, value_name = "BOOL", num_args = 0..=1, require_equals = true,
          default_missing_value = "1", value_parser = parse_bool)]
    pub verbose: Option<bool>,
    /// Cycle the device through suspend/resume while streaming
    #[arg(short = 'z', long, value_name = "BOOL", num_args = 0..=1, require_equals = true,
          default_missing_value = "1", value_parser = parse_bool)]
    pub suspend: Option<bool>,

    /// Device location when several matching devices are attached
    #[arg(short = 'd', long, value_name = "BUS:ADDRESS")]
    pub device: Option<DeviceLocation>,
    /// USB vendor ID (hex)
    #[arg(long, default_value = "18d1", value_parser = parse_hex_u16)]
    pub vid: u16,
    /// USB product ID (hex)
    #[arg(long, default_value = "503a", value_parser = parse_hex_u16)]
    pub pid: u16,
    /// Total bytes to transfer across all streams (suffix k or m allowed)
    #[arg(long, default_value_t = DEFAULT_TRANSFER_BYTES, value_parser = parse_size)]
    pub bytes: u64,

    /// Serial port for the first stream's host-to-device data
    pub output: Option<String>,
    /// Serial port for the first stream's device-to-host data
    pub input: Option<String>,
    /// Anything after the two port names is rejected
    #[arg(hide = true)]
    pub extra: Vec<String>,
}

impl Cli {
    /// Parses the command line after rewriting attached boolean values
    /// (`-c0`) into the `--check=0` form.
    pub fn try_parse_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::try_parse_from(expand_bool_flags(args))
    }
}

fn expand_bool_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut out = Vec::new();
    let mut positional_only = false;
    for arg in args.into_iter().map(Into::into) {
        if positional_only {
            out.push(arg);
            continue;
        }
        if arg == "--" {
            positional_only = true;
            out.push(arg);
            continue;
        }
        let rewritten = arg.to_str().and_then(|s| {
            let rest = s.strip_prefix('-')?;
            let mut chars = rest.chars();
            let flag = chars.next()?.to_ascii_lowercase();
            let value = chars.as_str();
            if value.is_empty() || value.starts_with('=') {
                return None;
            }
            let (_, long) = BOOL_FLAGS.iter().find(|(short, _)| *short == flag)?;
            Some(OsString::from(format!("--{long}={value}")))
        });
        out.push(rewritten.unwrap_or(arg));
    }
    out
}

pub fn parse_bool(s: &str) -> anyhow::Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "true" => Ok(true),
        "0" | "n" | "no" | "false" => Ok(false),
        _ => bail!("expected 0, 1, n or y"),
    }
}

pub fn parse_hex_u16(s: &str) -> anyhow::Result<u16> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|_| anyhow!("'{s}' is not a 16-bit hex number"))
}

/// Byte count: decimal, or hex with `0x`, optionally followed by `k` or `m`
/// (binary multiples).
pub fn parse_size(s: &str) -> anyhow::Result<u64> {
    let lower = s.to_ascii_lowercase();
    let (num, shift) = match lower.as_bytes().last() {
        Some(b'k') => (&lower[..lower.len() - 1], 10),
        Some(b'm') => (&lower[..lower.len() - 1], 20),
        _ => (lower.as_str(), 0),
    };
    let n = match num.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => num.parse::<u64>(),
    }
    .map_err(|_| anyhow!("'{s}' is not a byte count"))?;
    n.checked_mul(1 << shift)
        .ok_or_else(|| anyhow!("'{s}' is too large"))
}
