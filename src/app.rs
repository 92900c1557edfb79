use crate::compat::BinaryVersion;
use crate::harness::run_upgrade_downgrade;
use crate::logging::{LogHandle, LogLevel};
use anyhow::{bail, Result};

/// Runs the rolling upgrade/downgrade scenario for both 4.0 release lines
/// and prints one JSON report per cycle.
///
/// `--verbose` lowers the log level to DEBUG and dumps the log to stderr.
pub fn run() -> Result<()> {
    let mut verbose = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--verbose" | "-v" => verbose = true,
            other => bail!("unknown argument {other:?}"),
        }
    }
    let logger = LogHandle::default();
    if verbose {
        logger.set_level(LogLevel::Debug);
    }
    let result = run_scenarios(&logger);
    if verbose {
        for line in logger.lines() {
            eprintln!("{line}");
        }
    }
    result
}

fn run_scenarios(logger: &LogHandle) -> Result<()> {
    for old in [BinaryVersion::Release40, BinaryVersion::Release40Backport] {
        let report = run_upgrade_downgrade(old, logger.clone())?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
