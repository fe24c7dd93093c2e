//! Plugin stderr forwarding.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use super::LAUNCHER_TARGET;

/// Lines kept for startup diagnostics.
const DIAGNOSTIC_LINES: usize = 32;

/// Forwards a plugin's stderr to `tracing` line by line and keeps the most
/// recent lines for error reports.
pub(crate) struct StderrLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    done: Receiver<()>,
}

impl StderrLog {
    /// Starts forwarding `stderr` on a helper thread.
    pub(crate) fn capture<R: Read + Send + 'static>(plugin: &str, stderr: Option<R>) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_LINES)));
        let (finished, done) = mpsc::channel();
        let Some(source) = stderr else {
            return Self { lines, done };
        };
        let ring = Arc::clone(&lines);
        let plugin_id = plugin.to_owned();
        let spawned = thread::Builder::new()
            .name(format!("omniview-stderr-{plugin}"))
            .spawn(move || {
                for line in BufReader::new(source).lines().map_while(Result::ok) {
                    info!(target: LAUNCHER_TARGET, plugin = %plugin_id, "{line}");
                    let mut recent = lock(&ring);
                    if recent.len() == DIAGNOSTIC_LINES {
                        recent.pop_front();
                    }
                    recent.push_back(line);
                }
                drop(finished);
            });
        if let Err(error) = spawned {
            warn!(target: LAUNCHER_TARGET, plugin, %error, "cannot forward plugin stderr");
        }
        Self { lines, done }
    }

    /// Recent lines joined with newlines.
    pub(crate) fn snapshot(&self) -> String {
        lock(&self.lines).iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Waits up to `wait` for the stream to end, then snapshots it.
    pub(crate) fn settle(&self, wait: Duration) -> String {
        drop(self.done.recv_timeout(wait));
        self.snapshot()
    }
}

fn lock(lines: &Mutex<VecDeque<String>>) -> MutexGuard<'_, VecDeque<String>> {
    lines.lock().unwrap_or_else(|poison| poison.into_inner())
}
