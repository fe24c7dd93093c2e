//! Unit tests for plugin error classification.

use std::path::PathBuf;

use rstest::rstest;

use super::*;
use crate::rpc::{RpcStatus, StatusCode};

#[rstest]
#[case::missing(PluginError::BinaryNotFound { id: "k".into(), path: PathBuf::from("/x") }, true)]
#[case::perms(PluginError::NotExecutable { id: "k".into(), path: PathBuf::from("/x") }, true)]
#[case::handshake(PluginError::HandshakeFailed {
    id: "k".into(),
    reason: HandshakeError::Closed,
    diagnostic: String::new(),
}, true)]
#[case::timeout(PluginError::HandshakeTimeout {
    id: "k".into(),
    timeout_ms: 10,
    diagnostic: String::new(),
}, true)]
#[case::interface(PluginError::InterfaceViolation { id: "k".into(), capability: Capability::Exec }, true)]
#[case::not_found(PluginError::NotFound { id: "k".into() }, false)]
#[case::rpc(PluginError::Rpc {
    id: "k".into(),
    source: RpcError::Status(RpcStatus::new(StatusCode::Unavailable, "gone")),
}, false)]
fn fatal_errors_are_classified(#[case] error: PluginError, #[case] fatal: bool) {
    assert_eq!(error.is_fatal(), fatal);
}

#[rstest]
fn handshake_message_includes_stderr_diagnostic() {
    let error = PluginError::HandshakeTimeout {
        id: String::from("aws"),
        timeout_ms: 5000,
        diagnostic: String::from("panic: missing credentials\n"),
    };
    assert_eq!(
        error.to_string(),
        "plugin 'aws' handshake timed out after 5000ms (plugin stderr: panic: missing credentials)"
    );
}

#[rstest]
fn interface_violation_names_capability() {
    let error = PluginError::InterfaceViolation {
        id: String::from("aws"),
        capability: Capability::Networker,
    };
    assert!(error.to_string().starts_with("shared interface violation"));
    assert!(error.to_string().contains("networker"));
}
