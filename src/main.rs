use std::process::ExitCode;

use clap::error::ErrorKind;
use tracing::{error, info, warn};

mod cli;
mod device;
mod error;
mod logging;
mod stats;
mod stream;
mod test;
mod transport;

#[cfg(test)]
mod test_utils;

use cli::Cli;
use device::UsbTestDevice;
use error::{EXIT_BAD_OPTION, EXIT_BAD_PARAMETER, TestError};
use test::runner::run_test;
use test::test_config::TestConfig;

fn main() -> ExitCode {
    let args = match Cli::try_parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                ErrorKind::ValueValidation | ErrorKind::InvalidValue => EXIT_BAD_PARAMETER,
                _ => EXIT_BAD_OPTION,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };
    if let Some(extra) = args.extra.first() {
        eprintln!("error: unexpected parameter '{extra}'");
        return ExitCode::from(EXIT_BAD_PARAMETER);
    }

    let cfg = TestConfig::from_cli(&args);
    if let Err(e) = logging::setup_logging(cfg.verbose) {
        eprintln!("warning: {e:#}");
    }

    match run(&cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.exit_code();
            error!("{:#}", anyhow::Error::new(e));
            ExitCode::from(code)
        }
    }
}

fn run(cfg: &TestConfig) -> Result<(), TestError> {
    info!("USB streaming test (host side)");
    let mut dev =
        UsbTestDevice::init(cfg.vid, cfg.pid, cfg.location).map_err(TestError::from_init)?;
    dev.open().map_err(TestError::DeviceOpen)?;
    let desc = dev.read_test_descriptor().map_err(TestError::Descriptor)?;

    let summary = run_test(&mut dev, &desc, cfg);
    dev.close();
    let summary = summary?;
    summary.log();
    if summary.check_errors() > 0 {
        warn!("{} received bytes did not match", summary.check_errors());
    }
    Ok(())
}
