//! Starting plugin processes and verifying their handshake.
//!
//! [`Launcher::launch`] checks the binary, spawns it with the handshake
//! cookie in its environment, waits a bounded time for the handshake frame on
//! stdout and then hands the same stream to an [`RpcClient`]. The returned
//! [`PluginProcess`] owns the child: dropping it kills the process, so every
//! exit path, unwinding included, releases the plugin.

use std::fs;
use std::io;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capability::CapabilityClient;
use crate::descriptor::{Capability, PluginDescriptor};
use crate::error::PluginError;
use crate::handshake::{HandshakeConfig, HandshakeError, HandshakeFrame};
use crate::rpc::{Frame, FrameReader, HEALTH_SERVICE, RpcClient};

mod stderr;

use stderr::StderrLog;

/// Log target for process management.
pub(crate) const LAUNCHER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::launcher");

/// Handshake budget used when none is configured.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a failed launch waits for the rest of the plugin's stderr.
const DIAGNOSTIC_SETTLE: Duration = Duration::from_millis(500);

/// Spawns plugin binaries.
#[derive(Debug, Clone)]
pub struct Launcher {
    handshake_timeout: Duration,
    env: Vec<(String, String)>,
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

impl Launcher {
    /// A launcher waiting at most `handshake_timeout` for each handshake.
    #[must_use]
    pub const fn new(handshake_timeout: Duration) -> Self {
        Self {
            handshake_timeout,
            env: Vec::new(),
        }
    }

    /// Adds an environment variable for every launched plugin.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Handshake budget.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Starts the plugin described by `descriptor` and completes the
    /// handshake.
    ///
    /// # Errors
    ///
    /// [`PluginError::BinaryNotFound`], [`PluginError::NotExecutable`],
    /// [`PluginError::SpawnFailed`], [`PluginError::HandshakeFailed`] and
    /// [`PluginError::HandshakeTimeout`] are fatal for the plugin.
    pub fn launch(&self, descriptor: &PluginDescriptor) -> Result<PluginProcess, PluginError> {
        let id = descriptor.id();
        check_binary(id, descriptor.binary())?;
        let handshake = HandshakeConfig::for_plugin(id, descriptor.version());

        let mut command = Command::new(descriptor.binary());
        command
            .envs(self.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .envs(handshake.environment())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = descriptor.binary().parent() {
            command.current_dir(dir);
        }

        info!(
            target: LAUNCHER_TARGET,
            plugin = id,
            version = descriptor.version(),
            binary = %descriptor.binary().display(),
            dev_mode = descriptor.flags().dev_mode,
            "starting plugin"
        );
        let mut child = command.spawn().map_err(|err| spawn_failed(id, "cannot spawn binary", err))?;
        let stderr = StderrLog::capture(id, child.stderr.take());
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let mut process = PluginProcess {
            id: id.to_owned(),
            capabilities: Vec::new(),
            rpc: None,
            child,
            stderr,
        };

        let (Some(input), Some(output)) = (stdin, stdout) else {
            return Err(PluginError::SpawnFailed {
                id: id.to_owned(),
                message: String::from("failed to capture plugin stdio"),
                source: None,
            });
        };

        let (frame, reader) = match self.await_handshake(id, output) {
            Ok(Ok(received)) => received,
            Ok(Err(reason)) => {
                process.kill();
                return Err(PluginError::HandshakeFailed {
                    id: id.to_owned(),
                    reason,
                    diagnostic: process.stderr.settle(DIAGNOSTIC_SETTLE),
                });
            }
            Err(timeout_ms) => {
                process.kill();
                return Err(PluginError::HandshakeTimeout {
                    id: id.to_owned(),
                    timeout_ms,
                    diagnostic: process.stderr.settle(DIAGNOSTIC_SETTLE),
                });
            }
        };

        if let Err(reason) = handshake.verify(&frame) {
            process.kill();
            return Err(PluginError::HandshakeFailed {
                id: id.to_owned(),
                reason,
                diagnostic: process.stderr.settle(DIAGNOSTIC_SETTLE),
            });
        }
        for declared in descriptor.capabilities() {
            if !frame.capabilities.contains(declared) {
                warn!(
                    target: LAUNCHER_TARGET,
                    plugin = id,
                    capability = %declared,
                    "declared capability is not served"
                );
            }
        }

        let rpc = RpcClient::start(reader, input).map_err(|source| PluginError::Rpc {
            id: id.to_owned(),
            source,
        })?;
        process.capabilities = frame.capabilities;
        process.rpc = Some(rpc);
        info!(
            target: LAUNCHER_TARGET,
            plugin = id,
            pid = process.pid(),
            capabilities = ?process.capabilities,
            "plugin ready"
        );
        Ok(process)
    }

    /// Reads the first frame on a helper thread, bounded by the handshake
    /// timeout. The outer error carries the elapsed budget in milliseconds.
    fn await_handshake(
        &self,
        id: &str,
        stdout: ChildStdout,
    ) -> Result<Result<(HandshakeFrame, FrameReader<ChildStdout>), HandshakeError>, u64> {
        let (outcome, received) = mpsc::sync_channel(1);
        let spawned = thread::Builder::new()
            .name(format!("omniview-handshake-{id}"))
            .spawn(move || {
                let mut reader = FrameReader::new(stdout);
                let frame = read_handshake(&mut reader);
                drop(outcome.send(frame.map(|handshake| (handshake, reader))));
            });
        let timeout_ms = u64::try_from(self.handshake_timeout.as_millis()).unwrap_or(u64::MAX);
        if let Err(error) = spawned {
            return Ok(Err(HandshakeError::Malformed {
                message: format!("cannot read handshake: {error}"),
            }));
        }
        match received.recv_timeout(self.handshake_timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(timeout_ms),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(HandshakeError::Closed)),
        }
    }
}

fn read_handshake(reader: &mut FrameReader<ChildStdout>) -> Result<HandshakeFrame, HandshakeError> {
    match reader.read_frame() {
        Ok(Some(Frame::Handshake(frame))) => Ok(frame),
        Ok(Some(other)) => Err(HandshakeError::UnexpectedFrame {
            kind: other.kind().to_owned(),
        }),
        Ok(None) => Err(HandshakeError::Closed),
        Err(error) => Err(HandshakeError::Malformed {
            message: error.to_string(),
        }),
    }
}

fn spawn_failed(id: &str, message: &str, error: io::Error) -> PluginError {
    PluginError::SpawnFailed {
        id: id.to_owned(),
        message: format!("{message}: {error}"),
        source: Some(Arc::new(error)),
    }
}

fn check_binary(id: &str, path: &Path) -> Result<(), PluginError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(PluginError::BinaryNotFound {
                id: id.to_owned(),
                path: path.to_path_buf(),
            });
        }
        Err(error) => return Err(spawn_failed(id, "cannot inspect binary", error)),
    };
    if metadata.is_file() && is_executable(&metadata) {
        Ok(())
    } else {
        Err(PluginError::NotExecutable {
            id: id.to_owned(),
            path: path.to_path_buf(),
        })
    }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    true
}

/// A running plugin process and its RPC connection.
///
/// Dropping the value kills the process.
pub struct PluginProcess {
    id: String,
    capabilities: Vec<Capability>,
    rpc: Option<RpcClient>,
    child: Child,
    stderr: StderrLog,
}

impl PluginProcess {
    /// Plugin ID.
    #[must_use]
    pub const fn id(&self) -> &str {
        self.id.as_str()
    }

    /// OS process ID.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Capabilities announced in the handshake.
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Whether the handshake announced `capability`.
    #[must_use]
    pub fn serves(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Recent stderr output.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        self.stderr.snapshot()
    }

    /// The raw RPC connection.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotRunning`] if the process has been killed.
    pub fn rpc(&self) -> Result<&RpcClient, PluginError> {
        self.rpc
            .as_ref()
            .filter(|rpc| !rpc.is_closed())
            .ok_or_else(|| PluginError::NotRunning { id: self.id.clone() })
    }

    /// A client shim for capability `C`.
    ///
    /// # Errors
    ///
    /// [`PluginError::InterfaceViolation`] when the plugin does not serve the
    /// capability, [`PluginError::NotRunning`] when the connection is gone.
    pub fn dispense<C: CapabilityClient>(&self) -> Result<C, PluginError> {
        if !self.serves(C::CAPABILITY) {
            return Err(PluginError::InterfaceViolation {
                id: self.id.clone(),
                capability: C::CAPABILITY,
            });
        }
        Ok(C::from_rpc(self.rpc()?.clone()))
    }

    /// Probes the built-in health service.
    ///
    /// # Errors
    ///
    /// [`PluginError::Rpc`] if the probe fails or times out.
    pub fn check_health(&self, timeout: Duration) -> Result<(), PluginError> {
        self.rpc()?
            .call(HEALTH_SERVICE, "Check", None, Value::Null, timeout)
            .map(drop)
            .map_err(|source| PluginError::Rpc {
                id: self.id.clone(),
                source,
            })
    }

    /// Whether the process is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kills the process and reaps it. Safe to call repeatedly.
    pub fn kill(&mut self) {
        self.rpc = None;
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(target: LAUNCHER_TARGET, plugin = %self.id, %status, "plugin already exited");
                return;
            }
            Ok(None) => {}
            Err(error) => warn!(target: LAUNCHER_TARGET, plugin = %self.id, %error, "cannot poll plugin"),
        }
        if let Err(error) = self.child.kill() {
            warn!(target: LAUNCHER_TARGET, plugin = %self.id, %error, "cannot kill plugin");
        }
        match self.child.wait() {
            Ok(status) => info!(target: LAUNCHER_TARGET, plugin = %self.id, %status, "plugin stopped"),
            Err(error) => warn!(target: LAUNCHER_TARGET, plugin = %self.id, %error, "cannot reap plugin"),
        }
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests;
