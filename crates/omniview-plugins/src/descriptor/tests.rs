//! Unit tests for plugin descriptors.

use std::fs;
use std::path::PathBuf;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

#[fixture]
fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new("kubernetes", "1.2.3", PathBuf::from("/opt/omniview/kube"))
        .with_capabilities(vec![Capability::Resource, Capability::Exec])
}

#[rstest]
fn valid_descriptor_passes(descriptor: PluginDescriptor) {
    assert!(descriptor.validate().is_ok());
    assert!(descriptor.flags().enabled);
    assert!(!descriptor.flags().running);
}

#[rstest]
#[case::empty_id("", "1.0.0", "/opt/p")]
#[case::separator("a/b", "1.0.0", "/opt/p")]
#[case::short_version("kube", "1.0", "/opt/p")]
#[case::alpha_version("kube", "one.two.three", "/opt/p")]
#[case::relative_binary("kube", "1.0.0", "bin/p")]
fn invalid_descriptors_are_rejected(#[case] id: &str, #[case] version: &str, #[case] binary: &str) {
    let descriptor = PluginDescriptor::new(id, version, PathBuf::from(binary));
    let err = descriptor.validate().expect_err("should be invalid");
    assert!(matches!(err, PluginError::Descriptor { .. }));
}

#[rstest]
#[case("1.0.0-rc.1")]
#[case("0.4.1+build.7")]
fn prerelease_versions_are_accepted(#[case] version: &str) {
    let descriptor = PluginDescriptor::new("kube", version, PathBuf::from("/opt/p"));
    assert!(descriptor.validate().is_ok());
}

#[rstest]
fn capability_parses_from_key() {
    for capability in Capability::ALL {
        assert_eq!(capability.as_str().parse::<Capability>().ok(), Some(capability));
    }
    assert!("telepathy".parse::<Capability>().is_err());
}

#[rstest]
fn load_resolves_relative_binary() {
    let temp = TempDir::new().expect("temp dir");
    fs::write(
        temp.path().join(DESCRIPTOR_FILE),
        r#"{"id":"aws","version":"0.1.0","capabilities":["resource","settings"],"binary":"plugin","dev_mode":true}"#,
    )
    .expect("write descriptor");

    let loaded = PluginDescriptor::load(temp.path()).expect("load");
    assert_eq!(loaded.id(), "aws");
    assert_eq!(loaded.binary(), temp.path().join("plugin"));
    assert!(loaded.supports(Capability::Settings));
    assert!(loaded.flags().dev_mode);
    assert!(loaded.flags().enabled);
}

#[rstest]
fn load_reports_malformed_json() {
    let temp = TempDir::new().expect("temp dir");
    fs::write(temp.path().join(DESCRIPTOR_FILE), "{not json").expect("write descriptor");
    let err = PluginDescriptor::load(temp.path()).expect_err("malformed");
    assert!(err.to_string().contains("invalid descriptor"));
}
