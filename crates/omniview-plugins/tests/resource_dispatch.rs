//! Behaviour tests for resource dispatch ordering and client resolution.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use serde_json::{Value, json};

use omniview_plugins::context::{Connection, PluginContext};
use omniview_plugins::controller::{
    ClientResolver, ConnectedClient, DispatchError, ResourceController, Resourcer,
};
use omniview_plugins::resource::{
    GetInput, GetResult, ListInput, ListResult, OperationResult, ResourceDefinition, ResourceMeta,
    ResourceProvider,
};
use omniview_plugins::rpc::RpcStatus;

struct ClusterClient {
    pods: Vec<Value>,
}

struct CloudClient;

#[derive(Default)]
struct CountingResolver {
    resolved: AtomicUsize,
    cloud: AtomicBool,
}

impl ClientResolver for CountingResolver {
    fn resolve(&self, ctx: &PluginContext) -> Result<ConnectedClient, DispatchError> {
        self.resolved.fetch_add(1, Ordering::SeqCst);
        ctx.connection().ok_or(DispatchError::NoConnection)?;
        if self.cloud.load(Ordering::SeqCst) {
            return Ok(ConnectedClient::new(CloudClient));
        }
        Ok(ConnectedClient::new(ClusterClient {
            pods: vec![json!({ "name": "web" }), json!({ "name": "db" })],
        }))
    }
}

struct Pods;

impl Resourcer<ClusterClient> for Pods {
    fn get(&self, _ctx: &PluginContext, client: &ClusterClient, input: GetInput) -> Result<GetResult, RpcStatus> {
        client
            .pods
            .iter()
            .find(|pod| pod["name"] == json!(input.id))
            .cloned()
            .map(OperationResult::ok)
            .ok_or_else(|| RpcStatus::not_found(input.id))
    }

    fn list(&self, _ctx: &PluginContext, client: &ClusterClient, _input: ListInput) -> Result<ListResult, RpcStatus> {
        Ok(OperationResult::ok(client.pods.clone()))
    }
}

struct Harness {
    resolver: Arc<CountingResolver>,
    controller: ResourceController,
    outcome: RefCell<Option<Result<GetResult, RpcStatus>>>,
}

impl Harness {
    fn outcome(&self) -> Result<GetResult, RpcStatus> {
        self.outcome.borrow().clone().expect("a call was made")
    }

    fn get(&self, key: &str, id: &str, connection: &str) {
        let ctx = PluginContext::new("ui").with_connection(Connection::new(connection, "Production"));
        let input = GetInput {
            id: id.to_owned(),
            namespace: String::new(),
        };
        *self.outcome.borrow_mut() = Some(self.controller.get(&ctx, key, input));
    }
}

#[fixture]
fn harness() -> Harness {
    let resolver = Arc::new(CountingResolver::default());
    let controller = ResourceController::with_resolver(Arc::clone(&resolver) as Arc<dyn ClientResolver>);
    Harness {
        resolver,
        controller,
        outcome: RefCell::new(None),
    }
}

fn unquote(text: &str) -> &str {
    text.trim_matches('"')
}

#[given("a controller with the {key} resource registered")]
fn given_controller(harness: &Harness, key: String) {
    let mut parts = unquote(&key).split("::");
    let meta = ResourceMeta::new(
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    );
    harness.controller.register(meta, ResourceDefinition::default(), Pods);
}

#[given("the {key} type is registered without a resourcer")]
fn given_bare_type(harness: &Harness, key: String) {
    let mut parts = unquote(&key).split("::");
    let meta = ResourceMeta::new(
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    );
    harness.controller.register_type(meta, ResourceDefinition::default());
}

#[given("the connection resolves to a cloud client")]
fn given_cloud_client(harness: &Harness) {
    harness.resolver.cloud.store(true, Ordering::SeqCst);
}

#[when("the UI gets {key} {id} on connection {connection}")]
fn when_get(harness: &Harness, key: String, id: String, connection: String) {
    harness.get(unquote(&key), unquote(&id), unquote(&connection));
}

#[then("the result contains pod {id}")]
fn then_result_contains(harness: &Harness, id: String) {
    let result = harness.outcome().expect("get succeeds");
    assert!(result.success);
    assert_eq!(result.result["name"], json!(unquote(&id)));
}

#[then("the call fails with {message}")]
fn then_call_fails(harness: &Harness, message: String) {
    let status = harness.outcome().expect_err("call fails");
    assert!(
        status.message.contains(unquote(&message)),
        "unexpected message: {}",
        status.message
    );
}

#[then("the resolver call count is {count}")]
fn then_resolver_calls(harness: &Harness, count: usize) {
    assert_eq!(harness.resolver.resolved.load(Ordering::SeqCst), count);
}

#[scenario(path = "tests/features/resource_dispatch.feature", index = 0)]
fn pods_fetched(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/resource_dispatch.feature", index = 1)]
fn unknown_type(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/resource_dispatch.feature", index = 2)]
fn missing_resourcer(#[from(harness)] harness: Harness) {
    let _ = harness;
}

#[scenario(path = "tests/features/resource_dispatch.feature", index = 3)]
fn client_type_mismatch(#[from(harness)] harness: Harness) {
    let _ = harness;
}
