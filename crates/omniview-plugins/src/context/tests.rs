//! Unit tests for plugin context propagation.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};
use serde_json::{Value, json};
use time::OffsetDateTime;

use super::*;
use crate::settings::{SettingDefinition, SettingKind, SettingsStore};

fn settings() -> Arc<SettingsStore> {
    Arc::new(
        SettingsStore::new([SettingDefinition::new(
            "watch",
            "Watch",
            SettingKind::Toggle,
            json!(true),
        )])
        .expect("valid definitions"),
    )
}

#[fixture]
fn connection() -> Connection {
    let mut connection = Connection::new("prod", "Production");
    connection
        .data
        .insert(String::from("namespace"), json!("payments"));
    connection
        .sensitive_data
        .insert(String::from("token"), json!("s3cret"));
    connection
        .labels
        .insert(String::from("env"), String::from("prod"));
    connection.mark_refreshed(
        OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("timestamp"),
        Duration::from_secs(3600),
    );
    connection
}

#[rstest]
#[case::bare(false, false)]
#[case::with_connection(true, false)]
#[case::with_resource(false, true)]
#[case::full(true, true)]
fn metadata_round_trip_preserves_wire_fields(
    connection: Connection,
    #[case] with_connection: bool,
    #[case] with_resource: bool,
) {
    let mut ctx = PluginContext::new("ui").with_options(RequestOptions {
        timeout: Duration::from_millis(2500),
        max_retries: 1,
        backoff_interval: Duration::from_millis(5),
    });
    if with_connection {
        ctx = ctx.with_connection(connection);
    }
    if with_resource {
        ctx = ctx.with_resource_context(ResourceContext::new("core::v1::Pod"));
    }
    let ctx = ctx
        .with_lifetime(CancellationToken::new())
        .with_settings(settings());

    let metadata = ctx.to_metadata().expect("encode");
    let decoded = PluginContext::from_metadata(&metadata).expect("decode");

    assert_eq!(decoded, ctx);
    assert_eq!(decoded.request_id(), ctx.request_id());
    assert_eq!(decoded.connection().is_some(), with_connection);
    assert_eq!(decoded.resource_context().is_some(), with_resource);
    assert!(decoded.lifetime().is_none());
    assert!(decoded.settings().is_none());
}

#[rstest]
fn encoded_metadata_omits_local_handles() {
    let ctx = PluginContext::new("ui").with_lifetime(CancellationToken::new());
    let metadata = ctx.to_metadata().expect("encode");
    let wire: Value = serde_json::from_str(&metadata).expect("json");
    assert!(wire.get("lifetime").is_none());
    assert!(wire.get("settings").is_none());
    assert!(ctx.lifetime().is_some(), "encoding must not mutate the caller");
}

#[rstest]
fn decoding_garbage_fails() {
    assert!(matches!(
        PluginContext::from_metadata("{not json"),
        Err(ContextError::Decode(_))
    ));
}

#[rstest]
fn request_ids_are_unique() {
    assert_ne!(
        PluginContext::new("ui").request_id(),
        PluginContext::new("ui").request_id()
    );
}

#[rstest]
fn defaults_match_documented_policy() {
    let options = RequestOptions::default();
    assert_eq!(options.timeout, Duration::from_secs(10));
    assert_eq!(options.max_retries, 3);
    assert_eq!(options.backoff_interval, Duration::from_secs(1));
}

#[rstest]
fn authed_only_inside_expiry_window(connection: Connection) {
    let refreshed = connection.last_refresh;
    assert!(connection.is_authed_at(refreshed + time::Duration::minutes(59)));
    assert!(!connection.is_authed_at(refreshed + time::Duration::minutes(60)));
}

#[rstest]
fn zero_expiry_is_never_authed(mut connection: Connection) {
    connection.expiry_time = Duration::ZERO;
    assert!(!connection.is_authed_at(connection.last_refresh));
}

#[rstest]
fn redaction_strips_sensitive_data(connection: Connection) {
    let redacted = connection.redacted();
    assert!(redacted.sensitive_data.is_empty());
    assert_eq!(redacted.data, connection.data);
}

#[rstest]
fn retry_stops_after_budget() {
    let options = RequestOptions {
        timeout: Duration::from_secs(1),
        max_retries: 2,
        backoff_interval: Duration::ZERO,
    };
    let attempts = Cell::new(0);
    let result: Result<(), &str> = options.retry(
        |_| {
            attempts.set(attempts.get() + 1);
            Err("unavailable")
        },
        |_| true,
    );
    assert!(result.is_err());
    assert_eq!(attempts.get(), 3);
}

#[rstest]
fn retry_skips_non_retryable_errors() {
    let options = RequestOptions {
        backoff_interval: Duration::ZERO,
        ..RequestOptions::default()
    };
    let attempts = Cell::new(0);
    let result: Result<(), &str> = options.retry(
        |_| {
            attempts.set(attempts.get() + 1);
            Err("invalid")
        },
        |_| false,
    );
    assert!(result.is_err());
    assert_eq!(attempts.get(), 1);
}

#[rstest]
fn retry_returns_first_success() {
    let options = RequestOptions {
        backoff_interval: Duration::ZERO,
        ..RequestOptions::default()
    };
    let result: Result<u32, &str> =
        options.retry(|attempt| if attempt < 1 { Err("busy") } else { Ok(attempt) }, |_| true);
    assert_eq!(result, Ok(1));
}
