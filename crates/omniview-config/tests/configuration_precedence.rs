//! Behaviour tests for layered configuration loading.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use omniview_config::Config;
use ortho_config::OrthoConfig;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct Harness {
    temp_dir: TempDir,
    cli_args: RefCell<Vec<OsString>>,
    env_overrides: RefCell<Vec<(String, Option<OsString>)>>,
    loaded: RefCell<Option<Result<Config, String>>>,
    _env_guard: MutexGuard<'static, ()>,
}

impl Harness {
    fn new() -> Self {
        let guard = ENV_MUTEX
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        Self {
            temp_dir: TempDir::new().expect("create temporary directory"),
            cli_args: RefCell::new(vec![OsString::from("omniview-host")]),
            env_overrides: RefCell::new(Vec::new()),
            loaded: RefCell::new(None),
            _env_guard: guard,
        }
    }

    fn write_config(&self, contents: &str) {
        let path = self.temp_dir.path().join("omniview.toml");
        fs::write(&path, contents).expect("write configuration");
        let mut args = self.cli_args.borrow_mut();
        args.push(OsString::from("--config-path"));
        args.push(path.into_os_string());
    }

    fn set_env(&self, key: &str, value: &str) {
        let previous = std::env::var_os(key);
        // Restored in `Drop`; the env mutex keeps scenarios from racing.
        unsafe { std::env::set_var(key, value) };
        self.env_overrides
            .borrow_mut()
            .push((key.to_owned(), previous));
    }

    fn load(&self) -> Config {
        if self.loaded.borrow().is_none() {
            let args = self.cli_args.borrow().clone();
            let result = Config::load_from_iter(args).map_err(|error| error.to_string());
            *self.loaded.borrow_mut() = Some(result);
        }
        match self.loaded.borrow().as_ref() {
            Some(Ok(config)) => config.clone(),
            Some(Err(error)) => panic!("configuration failed to load: {error}"),
            None => panic!("configuration was not loaded"),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let mut overrides = self.env_overrides.borrow_mut();
        while let Some((key, value)) = overrides.pop() {
            match value {
                Some(previous) => unsafe { std::env::set_var(&key, previous) },
                None => unsafe { std::env::remove_var(&key) },
            }
        }
    }
}

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

#[given("a configuration file setting the log filter to {filter}")]
fn given_config_file(harness: &Harness, filter: String) {
    let value = filter.trim_matches('"');
    harness.write_config(&format!("log_filter = \"{value}\"\n"));
}

#[given("the environment overrides the log filter to {filter}")]
fn given_env_override(harness: &Harness, filter: String) {
    harness.set_env("OMNIVIEW_LOG_FILTER", filter.trim_matches('"'));
}

#[when("the CLI sets the log filter to {filter}")]
fn when_cli_override(harness: &Harness, filter: String) {
    let mut args = harness.cli_args.borrow_mut();
    args.push(OsString::from("--log-filter"));
    args.push(OsString::from(filter.trim_matches('"')));
}

#[when("the configuration loads without overrides")]
fn when_load_without_overrides(harness: &Harness) {
    let _config = harness.load();
}

#[then("the log filter resolves to {filter}")]
fn then_filter_resolves(harness: &Harness, filter: String) {
    let config = harness.load();
    assert_eq!(config.log_filter(), filter.trim_matches('"'));
}

#[scenario(path = "tests/features/configuration_precedence.feature", index = 0)]
fn defaults_apply(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/configuration_precedence.feature", index = 1)]
fn file_overrides_defaults(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/configuration_precedence.feature", index = 2)]
fn environment_overrides_file(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/configuration_precedence.feature", index = 3)]
fn cli_overrides_environment(#[from(harness)] harness: Harness) {
    let _ = harness;
}
