//! Omniview plugin host binary.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use omniview_host::{StructuredHealthReporter, SystemConfigLoader, SystemShutdownSignal, run_host};

fn main() -> ExitCode {
    match run_host(
        &SystemConfigLoader,
        Arc::new(StructuredHealthReporter),
        &SystemShutdownSignal,
    ) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            // Telemetry may not be installed yet.
            drop(writeln!(io::stderr(), "omniview-host: {error}"));
            ExitCode::FAILURE
        }
    }
}
