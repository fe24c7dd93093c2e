//! Native pseudo-terminals via `portable-pty`.

use std::io;

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};

use super::{CommandSpec, ExecError, PtyBackend, PtyControl, PtyProcess, TerminalSize};

/// Starts processes on the platform's native pty implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl NativePtyBackend {
    /// Creates the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

const fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, spec: &CommandSpec, size: TerminalSize) -> Result<PtyProcess, ExecError> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|err| ExecError::spawn(format!("failed to open pty: {err}")))?;

        let mut command = CommandBuilder::new(&spec.program);
        command.args(&spec.args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|err| ExecError::spawn(format!("failed to spawn '{}': {err}", spec.program)))?;
        // The child holds its own copy; keeping ours would delay EOF on exit.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|err| ExecError::spawn(format!("failed to get pty writer: {err}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| ExecError::spawn(format!("failed to get pty reader: {err}")))?;

        Ok(PtyProcess {
            reader,
            writer,
            control: Box::new(NativeControl {
                master: pair.master,
                child,
            }),
        })
    }
}

struct NativeControl {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyControl for NativeControl {
    fn resize(&mut self, size: TerminalSize) -> io::Result<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|err| io::Error::other(err.to_string()))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()?;
        self.child.wait().map(drop)
    }
}

impl Drop for NativeControl {
    fn drop(&mut self) {
        // Reap an already-exited child.
        drop(self.child.try_wait());
    }
}
