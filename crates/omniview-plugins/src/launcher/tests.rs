//! Launcher failure modes, exercised with small shell scripts.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::handshake::MAGIC_COOKIE_KEY;

#[fixture]
fn dir() -> TempDir {
    tempfile::tempdir().expect("temp dir")
}

fn script(dir: &TempDir, name: &str, body: &str, mode: u32) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("chmod script");
    path
}

/// A shell `printf` emitting one framed JSON body.
fn framed(body: &str) -> String {
    format!(
        "printf 'Content-Length: {}\\r\\n\\r\\n%s' '{body}'",
        body.len()
    )
}

fn launcher() -> Launcher {
    Launcher::new(Duration::from_millis(300))
}

#[rstest]
fn missing_binary_is_not_found(dir: TempDir) {
    let descriptor = PluginDescriptor::new("ghost", "1.0.0", dir.path().join("absent"));
    let error = launcher().launch(&descriptor).err().expect("launch fails");
    assert!(matches!(error, PluginError::BinaryNotFound { .. }));
    assert!(error.is_fatal());
    assert!(error.to_string().contains("plugin 'ghost' not found"));
}

#[rstest]
fn binary_without_execute_bit_is_rejected(dir: TempDir) {
    let binary = script(&dir, "plugin", "exit 0", 0o644);
    let descriptor = PluginDescriptor::new("plain", "1.0.0", binary);
    let error = launcher().launch(&descriptor).err().expect("launch fails");
    assert!(matches!(error, PluginError::NotExecutable { .. }));
}

#[rstest]
fn silent_plugin_times_out_with_stderr_diagnostic(dir: TempDir) {
    let binary = script(&dir, "plugin", "echo 'waiting for godot' >&2\nexec sleep 5", 0o755);
    let descriptor = PluginDescriptor::new("slow", "1.0.0", binary);
    let error = launcher().launch(&descriptor).err().expect("launch fails");
    let PluginError::HandshakeTimeout {
        timeout_ms,
        diagnostic,
        ..
    } = error
    else {
        panic!("expected a handshake timeout");
    };
    assert_eq!(timeout_ms, 300);
    assert!(diagnostic.contains("waiting for godot"));
}

#[rstest]
fn exiting_plugin_fails_the_handshake(dir: TempDir) {
    let binary = script(&dir, "plugin", "echo 'config missing' >&2\nexit 3", 0o755);
    let descriptor = PluginDescriptor::new("crashy", "1.0.0", binary);
    let error = launcher().launch(&descriptor).err().expect("launch fails");
    let PluginError::HandshakeFailed {
        reason, diagnostic, ..
    } = error
    else {
        panic!("expected a handshake failure");
    };
    assert_eq!(reason, HandshakeError::Closed);
    assert!(diagnostic.contains("config missing"));
}

#[rstest]
fn wrong_cookie_fails_the_handshake(dir: TempDir) {
    let frame = format!(
        r#"{{"type":"handshake","protocol_version":1,"cookie_key":"{MAGIC_COOKIE_KEY}","cookie_value":"forged","capabilities":[]}}"#
    );
    let binary = script(&dir, "plugin", &format!("{}\nexec sleep 5", framed(&frame)), 0o755);
    let descriptor = PluginDescriptor::new("forger", "1.0.0", binary);
    let error = launcher().launch(&descriptor).err().expect("launch fails");
    assert!(matches!(
        error,
        PluginError::HandshakeFailed {
            reason: HandshakeError::CookieValueMismatch,
            ..
        }
    ));
    assert!(error.to_string().contains("plugin handshake failed"));
}

#[rstest]
fn matching_cookie_completes_the_handshake(dir: TempDir) {
    let expected = HandshakeConfig::for_plugin("honest", "1.0.0");
    let frame = format!(
        r#"{{"type":"handshake","protocol_version":1,"cookie_key":"{MAGIC_COOKIE_KEY}","cookie_value":"{}","capabilities":["command"]}}"#,
        expected.cookie_value()
    );
    let binary = script(&dir, "plugin", &format!("{}\nexec sleep 5", framed(&frame)), 0o755);
    let descriptor = PluginDescriptor::new("honest", "1.0.0", binary);
    let mut process = launcher().launch(&descriptor).expect("handshake succeeds");
    assert!(process.serves(Capability::Command));
    assert!(process.is_running());

    let error = process
        .dispense::<crate::capability::SettingsClient>()
        .err()
        .expect("settings not served");
    assert!(matches!(error, PluginError::InterfaceViolation { .. }));
    assert!(error.to_string().contains("shared interface violation"));

    process.kill();
    assert!(!process.is_running());
    assert!(matches!(process.rpc(), Err(PluginError::NotRunning { .. })));
}
