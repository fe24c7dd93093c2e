//! Unit tests for pending device authorisation flows.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mockall::mock;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use time::OffsetDateTime;

use super::*;

mock! {
    Authorizer {}
    impl DeviceAuthorizer for Authorizer {
        fn register_client(&self, region: &str) -> Result<ClientRegistration, DeviceAuthError>;
        fn start_device_authorization(
            &self,
            registration: &ClientRegistration,
            region: &str,
            start_url: &str,
        ) -> Result<DeviceAuthorization, DeviceAuthError>;
        fn create_token(
            &self,
            registration: &ClientRegistration,
            region: &str,
            device_code: &str,
        ) -> Result<TokenPoll, DeviceAuthError>;
    }
}

const CONNECTION: &str = "prod-account";
const SESSION: &str = "my-sso";
const INTERVAL: Duration = Duration::from_secs(5);
const CODE_LIFETIME: Duration = Duration::from_secs(600);

#[fixture]
fn cache_dir() -> TempDir {
    tempfile::tempdir().expect("temp dir")
}

fn registration() -> ClientRegistration {
    ClientRegistration {
        client_id: String::from("client"),
        client_secret: String::from("secret"),
        expires_at: OffsetDateTime::now_utc() + time::Duration::days(90),
    }
}

fn request() -> DeviceAuthRequest {
    DeviceAuthRequest {
        connection_id: String::from(CONNECTION),
        session: String::from(SESSION),
        start_url: String::from("https://example.awsapps.com/start"),
        region: String::from("eu-west-1"),
    }
}

/// An authorizer that registers once, authorises once and answers token
/// polls from `replies` in order.
fn authorizer(replies: Vec<Result<TokenPoll, DeviceAuthError>>) -> MockAuthorizer {
    let mut mock = MockAuthorizer::new();
    mock.expect_register_client()
        .withf(|region| region == "eu-west-1")
        .times(1)
        .returning(|_| Ok(registration()));
    expect_authorization(&mut mock);
    let polls = replies.len();
    let mut queue = VecDeque::from(replies);
    mock.expect_create_token()
        .withf(|_, _, device_code| device_code == "device-123")
        .times(polls)
        .returning(move |_, _, _| queue.pop_front().unwrap_or(Ok(TokenPoll::Pending)));
    mock
}

fn expect_authorization(mock: &mut MockAuthorizer) {
    mock.expect_start_device_authorization()
        .times(1)
        .returning(|_, _, _| {
            Ok(DeviceAuthorization {
                device_code: String::from("device-123"),
                user_code: String::from("ABCD-EFGH"),
                verification_uri: String::from("https://device.sso.example.com/"),
                verification_uri_complete: Some(String::from(
                    "https://device.sso.example.com/?user_code=ABCD-EFGH",
                )),
                expires_in: CODE_LIFETIME,
                interval: INTERVAL,
            })
        });
}

fn flows(cache_dir: &TempDir, mock: MockAuthorizer) -> PendingDeviceAuthFlows {
    PendingDeviceAuthFlows::new(TokenCache::new(cache_dir.path()), Arc::new(mock))
}

fn grant() -> TokenGrant {
    TokenGrant {
        access_token: String::from("access"),
        refresh_token: Some(String::from("refresh")),
        expires_in: Duration::from_secs(3_600),
    }
}

// -----------------------------------------------------------------------
// Starting flows
// -----------------------------------------------------------------------

#[rstest]
fn begin_returns_the_user_prompt(cache_dir: TempDir) {
    let pending = flows(&cache_dir, authorizer(Vec::new()));
    let prompt = pending.begin(request()).expect("begin");

    assert_eq!(prompt.user_code, "ABCD-EFGH");
    assert_eq!(prompt.expires_in, CODE_LIFETIME);
    assert!(pending.is_pending(CONNECTION));
    assert_eq!(pending.prompt(CONNECTION), Some(prompt));
    assert_eq!(pending.len(), 1);
}

#[rstest]
fn cached_registration_is_reused(cache_dir: TempDir) {
    let cache = TokenCache::new(cache_dir.path());
    let previous = registration();
    cache
        .save(
            SESSION,
            &SsoToken {
                start_url: String::from("https://example.awsapps.com/start"),
                region: String::from("eu-west-1"),
                access_token: String::from("stale"),
                expires_at: OffsetDateTime::now_utc() - time::Duration::hours(1),
                client_id: Some(previous.client_id.clone()),
                client_secret: Some(previous.client_secret.clone()),
                refresh_token: None,
                registration_expires_at: Some(previous.expires_at),
            },
        )
        .expect("seed cache");

    let mut mock = MockAuthorizer::new();
    mock.expect_register_client().never();
    expect_authorization(&mut mock);
    let pending = PendingDeviceAuthFlows::new(cache, Arc::new(mock));
    pending.begin(request()).expect("begin");
}

#[rstest]
fn service_failures_do_not_leave_a_flow(cache_dir: TempDir) {
    let mut mock = MockAuthorizer::new();
    mock.expect_register_client()
        .returning(|_| Err(DeviceAuthError::Service(String::from("throttled"))));
    let pending = flows(&cache_dir, mock);

    let error = pending.begin(request()).expect_err("register fails");
    assert!(matches!(error, DeviceAuthError::Service(_)));
    assert!(pending.is_empty());
}

// -----------------------------------------------------------------------
// Polling
// -----------------------------------------------------------------------

#[rstest]
fn early_polls_are_answered_locally(cache_dir: TempDir) {
    let pending = flows(&cache_dir, authorizer(Vec::new()));
    let start = Instant::now();
    pending.begin_at(request(), start).expect("begin");

    let outcome = pending
        .poll_at(CONNECTION, start + Duration::from_secs(2))
        .expect("poll");
    assert_eq!(
        outcome,
        PollOutcome::Pending {
            retry_after: Duration::from_secs(3)
        }
    );
}

#[rstest]
fn granted_tokens_are_cached_and_the_flow_ends(cache_dir: TempDir) {
    let pending = flows(
        &cache_dir,
        authorizer(vec![Ok(TokenPoll::Pending), Ok(TokenPoll::Granted(grant()))]),
    );
    let start = Instant::now();
    pending.begin_at(request(), start).expect("begin");

    let first = pending.poll_at(CONNECTION, start + INTERVAL).expect("first poll");
    assert_eq!(first, PollOutcome::Pending { retry_after: INTERVAL });

    let second = pending
        .poll_at(CONNECTION, start + INTERVAL * 2)
        .expect("second poll");
    let PollOutcome::Authorized(token) = second else {
        panic!("expected a token, got {second:?}");
    };
    assert_eq!(token.access_token, "access");
    assert_eq!(token.client_id.as_deref(), Some("client"));
    assert_eq!(token.refresh_token.as_deref(), Some("refresh"));
    assert!(!token.is_expired_at(OffsetDateTime::now_utc()));

    assert!(!pending.is_pending(CONNECTION));
    assert_eq!(pending.cache().load(SESSION).expect("load"), Some(token));
}

#[rstest]
fn slow_down_widens_the_interval(cache_dir: TempDir) {
    let pending = flows(&cache_dir, authorizer(vec![Ok(TokenPoll::SlowDown)]));
    let start = Instant::now();
    pending.begin_at(request(), start).expect("begin");

    let slowed = pending.poll_at(CONNECTION, start + INTERVAL).expect("poll");
    assert_eq!(
        slowed,
        PollOutcome::Pending {
            retry_after: INTERVAL + SLOW_DOWN_STEP
        }
    );
    // Inside the widened interval: no second call reaches the service.
    let early = pending
        .poll_at(CONNECTION, start + INTERVAL * 2)
        .expect("poll");
    assert_eq!(early, PollOutcome::Pending { retry_after: INTERVAL });
}

#[rstest]
fn expired_flows_are_removed(cache_dir: TempDir) {
    let pending = flows(&cache_dir, authorizer(Vec::new()));
    let start = Instant::now();
    pending.begin_at(request(), start).expect("begin");

    let error = pending
        .poll_at(CONNECTION, start + CODE_LIFETIME)
        .expect_err("expired");
    assert!(matches!(error, DeviceAuthError::Expired { .. }));
    assert!(!pending.is_pending(CONNECTION));
}

#[rstest]
fn denied_flows_are_removed(cache_dir: TempDir) {
    let pending = flows(&cache_dir, authorizer(vec![Ok(TokenPoll::Denied)]));
    let start = Instant::now();
    pending.begin_at(request(), start).expect("begin");

    let error = pending.poll_at(CONNECTION, start + INTERVAL).expect_err("denied");
    assert!(matches!(error, DeviceAuthError::Denied { .. }));
    assert!(pending.is_empty());
    assert_eq!(pending.cache().load(SESSION).expect("load"), None);
}

#[rstest]
fn service_errors_keep_the_flow_pending(cache_dir: TempDir) {
    let pending = flows(
        &cache_dir,
        authorizer(vec![Err(DeviceAuthError::Service(String::from("timeout")))]),
    );
    let start = Instant::now();
    pending.begin_at(request(), start).expect("begin");

    let error = pending.poll_at(CONNECTION, start + INTERVAL).expect_err("transport");
    assert!(matches!(error, DeviceAuthError::Service(_)));
    assert!(pending.is_pending(CONNECTION));
}

#[rstest]
fn unknown_connections_have_no_flow(cache_dir: TempDir) {
    let pending = flows(&cache_dir, MockAuthorizer::new());
    let error = pending.poll("nobody").expect_err("no flow");
    assert!(matches!(error, DeviceAuthError::NoPendingFlow { connection } if connection == "nobody"));
}

// -----------------------------------------------------------------------
// Housekeeping
// -----------------------------------------------------------------------

#[rstest]
fn cancel_and_prune(cache_dir: TempDir) {
    let pending = flows(&cache_dir, authorizer(Vec::new()));
    let start = Instant::now();
    pending.begin_at(request(), start).expect("begin");

    assert_eq!(pending.prune_expired(start + INTERVAL), 0);
    assert!(pending.cancel(CONNECTION));
    assert!(!pending.cancel(CONNECTION));
    assert!(pending.is_empty());
}

#[rstest]
fn prune_drops_expired_flows(cache_dir: TempDir) {
    let pending = flows(&cache_dir, authorizer(Vec::new()));
    let start = Instant::now();
    pending.begin_at(request(), start).expect("begin");

    assert_eq!(pending.prune_expired(start + CODE_LIFETIME), 1);
    assert!(pending.is_empty());
}
