//! Behaviour tests for context propagation through the interceptor chain.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use serde_json::{Value, json};

use omniview_plugins::context::{Connection, PLUGIN_CONTEXT_KEY, PluginContext};
use omniview_plugins::interceptor::InterceptorChain;
use omniview_plugins::rpc::{
    CallContext, Frame, FrameReader, FrameWriter, RpcClient, RpcServer, RpcStatus, Service,
};

const WAIT: Duration = Duration::from_secs(5);

struct Identity;

impl Service for Identity {
    fn call(&self, call: &CallContext, _payload: Value) -> Result<Value, RpcStatus> {
        match call.method() {
            "Ping" => Ok(json!("pong")),
            "Whoami" => {
                let ctx = call.require_plugin_context()?;
                Ok(json!({
                    "requester": ctx.requester_id(),
                    "connection": ctx.connection().map(|connection| connection.id.clone()),
                }))
            }
            "Explode" => panic!("resourcer bug"),
            other => Err(RpcStatus::unimplemented(other.to_owned())),
        }
    }
}

fn start_plugin() -> UnixStream {
    let (host, plugin) = UnixStream::pair().expect("socket pair");
    let mut server = RpcServer::new(InterceptorChain::standard(None));
    server.register("identity", Arc::new(Identity));
    let plugin_reader = plugin.try_clone().expect("clone plugin end");
    thread::spawn(move || server.serve(plugin_reader, plugin));
    host
}

#[derive(Default)]
struct Harness {
    client: RefCell<Option<RpcClient>>,
    raw: RefCell<Option<UnixStream>>,
    outcome: RefCell<Option<Result<Value, RpcStatus>>>,
}

impl Harness {
    fn client(&self) -> RpcClient {
        self.client.borrow().clone().expect("plugin started")
    }

    fn record(&self, outcome: Result<Value, RpcStatus>) {
        *self.outcome.borrow_mut() = Some(outcome);
    }

    fn outcome(&self) -> Result<Value, RpcStatus> {
        self.outcome.borrow().clone().expect("a call was made")
    }
}

#[fixture]
fn harness() -> Harness {
    Harness::default()
}

#[given("a plugin serving the identity service")]
fn given_plugin(harness: &Harness) {
    let host = start_plugin();
    let raw_host = start_plugin();
    let client = RpcClient::start(
        FrameReader::new(host.try_clone().expect("clone host reader")),
        host,
    )
    .expect("client starts");
    *harness.client.borrow_mut() = Some(client);
    *harness.raw.borrow_mut() = Some(raw_host);
}

#[when("the host calls {method} as {requester} on connection {connection}")]
fn when_call_with_context(harness: &Harness, method: String, requester: String, connection: String) {
    let ctx = PluginContext::new(requester.trim_matches('"'))
        .with_connection(Connection::new(connection.trim_matches('"'), "Production"));
    let method_name = capitalised(&method);
    let outcome = harness
        .client()
        .call("identity", &method_name, Some(&ctx), Value::Null, WAIT)
        .map_err(RpcStatus::from);
    harness.record(outcome);
}

#[when("the host calls whoami without a context")]
fn when_call_without_context(harness: &Harness) {
    let outcome = harness
        .client()
        .call("identity", "Whoami", None, Value::Null, WAIT)
        .map_err(RpcStatus::from);
    harness.record(outcome);
}

#[when("the host sends ping with malformed context metadata")]
fn when_malformed_context(harness: &Harness) {
    let stream = harness.raw.borrow_mut().take().expect("raw connection");
    let mut writer = FrameWriter::new(stream.try_clone().expect("clone raw writer"));
    let mut metadata = BTreeMap::new();
    metadata.insert(PLUGIN_CONTEXT_KEY.to_owned(), String::from("{not json"));
    writer
        .write_frame(&Frame::Request {
            id: 1,
            service: String::from("identity"),
            method: String::from("Ping"),
            metadata,
            timeout_ms: Some(5_000),
            payload: Value::Null,
        })
        .expect("send request");
    let mut reader = FrameReader::new(stream);
    let outcome = match reader.read_frame().expect("read response") {
        Some(Frame::Response {
            status: Some(status), ..
        }) => Err(status),
        Some(Frame::Response { payload, .. }) => Ok(payload),
        other => panic!("unexpected frame {other:?}"),
    };
    harness.record(outcome);
}

#[then("the plugin sees requester {requester} on connection {connection}")]
fn then_plugin_sees(harness: &Harness, requester: String, connection: String) {
    let seen = harness.outcome().expect("call succeeds");
    assert_eq!(seen["requester"], json!(requester.trim_matches('"')));
    assert_eq!(seen["connection"], json!(connection.trim_matches('"')));
}

#[then("the call fails with {message}")]
fn then_call_fails(harness: &Harness, message: String) {
    let status = harness.outcome().expect_err("call fails");
    assert_eq!(status.message, message.trim_matches('"'));
}

#[then("the call succeeds with {value}")]
fn then_call_succeeds(harness: &Harness, value: String) {
    assert_eq!(harness.outcome().expect("call succeeds"), json!(value.trim_matches('"')));
}

#[then("the plugin still answers ping")]
fn then_still_answers(harness: &Harness) {
    let pong = harness
        .client()
        .call("identity", "Ping", None, Value::Null, WAIT)
        .expect("ping after panic");
    assert_eq!(pong, json!("pong"));
}

fn capitalised(method: &str) -> String {
    let mut chars = method.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

#[scenario(path = "tests/features/plugin_context.feature", index = 0)]
fn context_travels(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/plugin_context.feature", index = 1)]
fn missing_context_rejected(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/plugin_context.feature", index = 2)]
fn malformed_context_tolerated(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/plugin_context.feature", index = 3)]
fn panics_contained(#[from(harness)] harness: Harness) {
    let _ = harness;
}
