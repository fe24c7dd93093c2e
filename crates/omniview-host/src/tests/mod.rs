//! Unit tests for bootstrap, plugin management and the run loop.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use serde_json::json;
use tempfile::TempDir;

use omniview_config::Config;
use omniview_plugins::handshake::MAGIC_COOKIE_KEY;
use omniview_plugins::{
    CommandClient, HandshakeConfig, PluginContext, PluginDescriptor, PluginError, PluginProcess,
};

use super::*;

#[derive(Default)]
struct RecordingReporter {
    events: Mutex<Vec<String>>,
}

impl RecordingReporter {
    fn push(&self, event: String) {
        self.events
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

impl HealthReporter for RecordingReporter {
    fn bootstrap_starting(&self) {
        self.push(String::from("bootstrap_starting"));
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.push(String::from("bootstrap_succeeded"));
    }

    fn bootstrap_failed(&self, _error: &BootstrapError) {
        self.push(String::from("bootstrap_failed"));
    }

    fn plugin_starting(&self, descriptor: &PluginDescriptor) {
        self.push(format!("starting:{}", descriptor.id()));
    }

    fn plugin_ready(&self, process: &PluginProcess) {
        self.push(format!("ready:{}", process.id()));
    }

    fn plugin_failed(&self, id: &str, _error: &PluginError) {
        self.push(format!("failed:{id}"));
    }

    fn plugin_stopped(&self, id: &str) {
        self.push(format!("stopped:{id}"));
    }
}

struct Immediate;

impl ShutdownSignal for Immediate {
    fn wait(&self) -> Result<(), ShutdownError> {
        Ok(())
    }
}

#[fixture]
fn root() -> TempDir {
    tempfile::tempdir().expect("temp dir")
}

fn utf8(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).expect("utf8 path")
}

fn config(root: &TempDir) -> Config {
    Config {
        plugins_dir: Some(utf8(&root.path().join("plugins"))),
        sso_cache_dir: Some(utf8(&root.path().join("sso"))),
        log_filter: Some(String::from("warn")),
        handshake_timeout_ms: Some(2_000),
        ..Config::default()
    }
}

fn install_descriptor(plugins: &Path, id: &str) -> std::path::PathBuf {
    let dir = plugins.join(id);
    fs::create_dir_all(&dir).expect("plugin dir");
    fs::write(
        dir.join("plugin.json"),
        json!({ "id": id, "version": "1.0.0", "binary": "plugin", "capabilities": ["command"] })
            .to_string(),
    )
    .expect("descriptor");
    dir
}

/// A plugin binary that answers the handshake with the command capability
/// and then idles.
fn install_runnable(plugins: &Path, id: &str) {
    let dir = install_descriptor(plugins, id);
    let frame = json!({
        "type": "handshake",
        "protocol_version": 1,
        "cookie_key": MAGIC_COOKIE_KEY,
        "cookie_value": HandshakeConfig::for_plugin(id, "1.0.0").cookie_value(),
        "capabilities": ["command"],
    })
    .to_string();
    let script = format!(
        "#!/bin/sh\nprintf 'Content-Length: {}\\r\\n\\r\\n%s' '{frame}'\nexec sleep 30\n",
        frame.len()
    );
    let binary = dir.join("plugin");
    fs::write(&binary, script).expect("binary");
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).expect("chmod");
}

// -----------------------------------------------------------------------
// Bootstrap
// -----------------------------------------------------------------------

#[rstest]
fn bootstrap_prepares_directories_and_discovers(root: TempDir) {
    let plugins = root.path().join("plugins");
    install_descriptor(&plugins, "aws");
    let reporter = Arc::new(RecordingReporter::default());

    let host = bootstrap_with(&StaticConfigLoader::new(config(&root)), reporter.clone())
        .expect("bootstrap");

    assert_eq!(reporter.events(), ["bootstrap_starting", "bootstrap_succeeded"]);
    assert!(plugins.is_dir());
    assert_eq!(host.plugins().registry().len(), 1);
    assert!(host.token_cache().dir().ends_with("sso"));
    assert_eq!(host.config().log_filter(), "warn");
}

#[rstest]
fn bootstrap_rejects_a_bad_log_filter(root: TempDir) {
    let reporter = Arc::new(RecordingReporter::default());
    let loader = StaticConfigLoader::new(Config {
        log_filter: Some(String::from("omniview=shouting")),
        ..config(&root)
    });

    let Err(error) = bootstrap_with(&loader, reporter.clone()) else {
        panic!("bootstrap should fail");
    };
    assert!(matches!(error, BootstrapError::Telemetry { .. }));
    assert_eq!(reporter.events(), ["bootstrap_starting", "bootstrap_failed"]);
}

#[rstest]
fn bootstrap_rejects_a_file_as_plugins_dir(root: TempDir) {
    let file = root.path().join("plugins");
    fs::write(&file, "not a directory").expect("write file");
    let reporter = Arc::new(RecordingReporter::default());

    let Err(error) = bootstrap_with(&StaticConfigLoader::new(config(&root)), reporter.clone())
    else {
        panic!("bootstrap should fail");
    };
    assert!(matches!(error, BootstrapError::PluginsDirectory { .. }));
    assert_eq!(reporter.events().last().map(String::as_str), Some("bootstrap_failed"));
}

// -----------------------------------------------------------------------
// Plugin manager
// -----------------------------------------------------------------------

#[rstest]
fn manager_reports_failed_starts(root: TempDir) {
    let plugins = root.path().join("plugins");
    install_descriptor(&plugins, "aws");
    install_runnable(&plugins, "demo");
    let reporter = Arc::new(RecordingReporter::default());
    let mut manager = PluginManager::new(
        omniview_plugins::Launcher::new(std::time::Duration::from_secs(2)),
        reporter.clone(),
    );
    manager.discover(&plugins).expect("discover");

    let failures = manager.start_all();
    assert_eq!(failures.len(), 1);
    assert!(failures.iter().all(PluginError::is_fatal));
    assert_eq!(
        reporter.events(),
        ["starting:aws", "failed:aws", "starting:demo", "ready:demo"]
    );
    manager.dispense::<CommandClient>("demo").expect("command client");

    manager.shutdown();
    assert_eq!(reporter.events().last().map(String::as_str), Some("stopped:demo"));
    assert!(!manager.registry().is_running("demo"));
}

#[rstest]
fn event_routing_requires_the_resource_capability(root: TempDir) {
    let plugins = root.path().join("plugins");
    install_runnable(&plugins, "demo");
    let mut manager = PluginManager::new(
        omniview_plugins::Launcher::new(std::time::Duration::from_secs(2)),
        Arc::new(StructuredHealthReporter),
    );
    manager.discover(&plugins).expect("discover");
    manager.start("demo").expect("start");

    let Err(error) = manager.events("demo", PluginContext::new("host")) else {
        panic!("command-only plugins have no event stream");
    };
    assert!(matches!(error, PluginError::InterfaceViolation { .. }));
}

#[rstest]
fn disabling_stops_and_reload_restarts(root: TempDir) {
    let plugins = root.path().join("plugins");
    install_runnable(&plugins, "demo");
    let reporter = Arc::new(RecordingReporter::default());
    let mut manager = PluginManager::new(
        omniview_plugins::Launcher::new(std::time::Duration::from_secs(2)),
        reporter.clone(),
    );
    manager.discover(&plugins).expect("discover");
    manager.start("demo").expect("start");

    manager.reload("demo").expect("reload");
    assert!(manager.registry().is_running("demo"));
    manager.set_enabled("demo", false).expect("disable");
    assert!(!manager.registry().is_running("demo"));
    assert!(manager.start_all().is_empty());
    assert_eq!(
        reporter.events(),
        [
            "starting:demo",
            "ready:demo",
            "stopped:demo",
            "starting:demo",
            "ready:demo",
            "stopped:demo",
        ]
    );
}

// -----------------------------------------------------------------------
// Run loop
// -----------------------------------------------------------------------

#[rstest]
fn run_host_starts_then_stops_plugins(root: TempDir) {
    install_runnable(&root.path().join("plugins"), "demo");
    let reporter = Arc::new(RecordingReporter::default());

    let host = run_host(
        &StaticConfigLoader::new(config(&root)),
        reporter.clone(),
        &Immediate,
    )
    .expect("run");

    assert!(!host.plugins().registry().is_running("demo"));
    assert_eq!(
        reporter.events(),
        [
            "bootstrap_starting",
            "bootstrap_succeeded",
            "starting:demo",
            "ready:demo",
            "stopped:demo",
        ]
    );
}
