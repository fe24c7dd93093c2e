//! Demo Omniview plugin binary. Launched by the host, never by hand.

use std::io::{self, Write};
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use omniview_plugin_demo::{PLUGIN_ID, plugin_handle};
use omniview_plugins::{PluginServeConfig, serve};

const MAIN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::main");

fn main() -> ExitCode {
    // Stdout carries the RPC stream, so logs go to stderr where the host
    // collects them.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .compact()
        .try_init()
        .is_err()
    {
        drop(writeln!(io::stderr(), "{PLUGIN_ID}: logging already initialised"));
    }

    let handle = match plugin_handle() {
        Ok(handle) => handle,
        Err(err) => {
            error!(target: MAIN_TARGET, error = %err, "plugin could not be assembled");
            return ExitCode::FAILURE;
        }
    };
    info!(
        target: MAIN_TARGET,
        capabilities = ?handle.capabilities(),
        "serving"
    );
    match serve(PluginServeConfig::new(handle)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(target: MAIN_TARGET, error = %err, "plugin stopped with an error");
            ExitCode::FAILURE
        }
    }
}
