//! Unit tests for resource dispatch and connection management.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use mockall::mock;
use rstest::{fixture, rstest};
use serde_json::{Value, json};

use super::*;
use crate::resource::OperationResult;

mock! {
    Resolver {}
    impl ClientResolver for Resolver {
        fn resolve(&self, ctx: &PluginContext) -> Result<ConnectedClient, DispatchError>;
    }
}

const POD: &str = "core::v1::Pod";
const WAIT: Duration = Duration::from_secs(5);

/// Stand-in for a cluster client.
struct KubeClient {
    pods: Vec<Value>,
}

struct PodResourcer;

fn in_namespace<'a>(pods: &'a [Value], namespaces: &'a [String]) -> impl Iterator<Item = &'a Value> {
    pods.iter().filter(move |pod| {
        namespaces.is_empty()
            || namespaces
                .iter()
                .any(|namespace| pod["namespace"] == json!(namespace))
    })
}

impl Resourcer<KubeClient> for PodResourcer {
    fn get(
        &self,
        _ctx: &PluginContext,
        client: &KubeClient,
        input: GetInput,
    ) -> Result<GetResult, RpcStatus> {
        client
            .pods
            .iter()
            .find(|pod| pod["name"] == json!(input.id) && pod["namespace"] == json!(input.namespace))
            .cloned()
            .map(OperationResult::ok)
            .ok_or_else(|| RpcStatus::not_found(format!("pod {} not found", input.id)))
    }

    fn list(
        &self,
        _ctx: &PluginContext,
        client: &KubeClient,
        input: ListInput,
    ) -> Result<ListResult, RpcStatus> {
        let mut result = OperationResult::ok(
            in_namespace(&client.pods, &input.namespaces)
                .cloned()
                .collect(),
        );
        if input.namespaces.iter().any(|namespace| namespace == "kube-system") {
            result.record_error("namespace kube-system: forbidden");
        }
        Ok(result)
    }
}

fn kube_client() -> ConnectedClient {
    ConnectedClient::new(KubeClient {
        pods: vec![
            json!({ "name": "web", "namespace": "payments" }),
            json!({ "name": "db", "namespace": "payments" }),
            json!({ "name": "dns", "namespace": "kube-system" }),
        ],
    })
}

fn connection() -> Connection {
    let mut connection = Connection::new("prod", "Production");
    connection
        .data
        .insert(NAMESPACE_KEY.to_owned(), json!("payments"));
    connection
        .sensitive_data
        .insert(String::from("token"), json!("s3cret"));
    connection
}

#[fixture]
fn ctx() -> PluginContext {
    PluginContext::new("ui").with_connection(connection())
}

fn controller_with(resolver: MockResolver) -> ResourceController {
    let controller = ResourceController::with_resolver(Arc::new(resolver));
    controller.register(
        ResourceMeta::new("core", "v1", "Pod").with_category("Workloads"),
        ResourceDefinition::default(),
        PodResourcer,
    );
    controller
}

fn resolving_kube() -> MockResolver {
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().returning(|_| Ok(kube_client()));
    resolver
}

#[rstest]
fn pod_list_uses_the_connection_namespace(ctx: PluginContext) {
    let controller = controller_with(resolving_kube());
    let result = controller
        .list(&ctx, POD, ListInput::default())
        .expect("list pods");
    assert!(result.success);
    assert_eq!(result.result.len(), 2);
}

#[rstest]
fn explicit_namespace_wins(ctx: PluginContext) {
    let controller = controller_with(resolving_kube());
    let result = controller
        .list(
            &ctx,
            POD,
            ListInput {
                namespaces: vec![String::from("kube-system")],
            },
        )
        .expect("list pods");
    assert_eq!(result.result, [json!({ "name": "dns", "namespace": "kube-system" })]);
    assert!(!result.success);
    assert_eq!(result.errors, ["namespace kube-system: forbidden"]);
}

#[rstest]
fn pod_get_round_trip(ctx: PluginContext) {
    let controller = controller_with(resolving_kube());
    let result = controller
        .get(
            &ctx,
            POD,
            GetInput {
                id: String::from("web"),
                namespace: String::new(),
            },
        )
        .expect("get pod");
    assert_eq!(result.result["name"], json!("web"));
}

#[rstest]
fn unknown_type_fails_before_resolving(ctx: PluginContext) {
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().times(0);
    let controller = controller_with(resolver);

    let status = controller
        .list(&ctx, "core::v1::Nope", ListInput::default())
        .expect_err("unknown type");
    assert_eq!(status.code, StatusCode::NotFound);
    assert_eq!(status.message, "resource type not found: core::v1::Nope");
}

#[rstest]
fn type_without_resourcer_fails_before_resolving(ctx: PluginContext) {
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().times(0);
    let controller = controller_with(resolver);
    controller.register_type(
        ResourceMeta::new("apps", "v1", "Deployment"),
        ResourceDefinition::default(),
    );

    let status = controller
        .list(&ctx, "apps::v1::Deployment", ListInput::default())
        .expect_err("no resourcer");
    assert_eq!(status.message, "resourcer not found: apps::v1::Deployment");
}

#[rstest]
fn mismatched_client_type_is_rejected(ctx: PluginContext) {
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .times(1)
        .returning(|_| Ok(ConnectedClient::new(String::from("aws session"))));
    let controller = controller_with(resolver);

    let status = controller
        .list(&ctx, POD, ListInput::default())
        .expect_err("mismatched client");
    assert_eq!(status.code, StatusCode::FailedPrecondition);
    assert!(status.message.contains("client type mismatch"));
}

#[rstest]
fn missing_operations_are_unimplemented(ctx: PluginContext) {
    let controller = controller_with(resolving_kube());
    let status = controller
        .create(&ctx, POD, CreateInput::default())
        .expect_err("create unsupported");
    assert_eq!(status.code, StatusCode::Unimplemented);
}

#[rstest]
fn informer_calls_are_no_ops_without_informers(ctx: PluginContext) {
    let controller = controller_with(MockResolver::new());
    controller
        .start_context_informer(&ctx)
        .expect("start is a no-op");
    controller
        .stop_context_informer(&ctx)
        .expect("stop is a no-op");
    controller
        .listen_for_events(&ctx, &mut |_| Ok(()), &CancellationToken::new())
        .expect("listen returns at once");
}

#[rstest]
fn type_metadata_is_queryable(ctx: PluginContext) {
    let controller = controller_with(MockResolver::new());
    controller.register_group(ResourceGroup {
        id: String::from("core"),
        name: String::from("Core"),
        description: String::new(),
        resources: BTreeMap::new(),
    });

    let types = controller.resource_types(&ctx).expect("types");
    assert_eq!(types.keys().collect::<Vec<_>>(), [POD]);
    assert_eq!(
        controller.resource_type(&ctx, POD).expect("pod type").category,
        "Workloads"
    );
    assert_eq!(controller.has_resource_type(&ctx, POD), Ok(true));
    assert_eq!(controller.has_resource_type(&ctx, "x::y::Z"), Ok(false));
    assert!(controller.resource_definition(&ctx, "x::y::Z").is_err());
    assert!(controller.resource_groups(&ctx).expect("groups").contains_key("core"));
}

#[rstest]
fn connection_operations_need_a_manager(ctx: PluginContext) {
    let controller = controller_with(MockResolver::new());
    let status = controller
        .list_connections(&ctx)
        .expect_err("no manager");
    assert_eq!(status.code, StatusCode::Unimplemented);
}

/// Parks every `get` between two barriers so a test can act mid-operation.
struct GatedResourcer {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl Resourcer<KubeClient> for GatedResourcer {
    fn get(
        &self,
        _ctx: &PluginContext,
        _client: &KubeClient,
        input: GetInput,
    ) -> Result<GetResult, RpcStatus> {
        self.entered.wait();
        self.release.wait();
        Ok(OperationResult::ok(json!({ "name": input.id, "gated": true })))
    }

    fn list(
        &self,
        _ctx: &PluginContext,
        _client: &KubeClient,
        _input: ListInput,
    ) -> Result<ListResult, RpcStatus> {
        Err(RpcStatus::unimplemented("list is not supported for this resource"))
    }
}

#[rstest]
fn registration_waits_for_in_flight_operations(ctx: PluginContext) {
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let controller = controller_with(resolving_kube());
    controller.register_resourcer::<KubeClient, _>(
        POD,
        GatedResourcer {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        },
    );
    let web = || GetInput {
        id: String::from("web"),
        namespace: String::new(),
    };
    let shared = &controller;
    let (registered_tx, registered_rx) = mpsc::channel();

    thread::scope(|scope| {
        let in_flight = scope.spawn(|| shared.get(&ctx, POD, web()));
        entered.wait();
        scope.spawn(move || {
            shared.register_resourcer::<KubeClient, _>(POD, PodResourcer);
            registered_tx.send(()).expect("signal registration");
        });
        assert!(
            registered_rx
                .recv_timeout(Duration::from_millis(200))
                .is_err(),
            "registration replaced the resourcer mid-operation"
        );
        release.wait();
        let gated = in_flight
            .join()
            .expect("get thread")
            .expect("gated get");
        assert_eq!(gated.result["gated"], json!(true));
        registered_rx
            .recv_timeout(WAIT)
            .expect("registration completes once the get returns");
    });

    let replaced = controller.get(&ctx, POD, web()).expect("get after registration");
    assert_eq!(replaced.result, json!({ "name": "web", "namespace": "payments" }));
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

struct Managed {
    controller: ResourceController,
    built: Arc<AtomicUsize>,
}

#[fixture]
fn managed() -> Managed {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    let manager = ConnectionManager::new(
        |_: &PluginContext| -> Result<Vec<Connection>, RpcStatus> {
            Ok(vec![connection(), Connection::new("dev", "Development")])
        },
        move |_: &PluginContext, connection: &Connection| -> Result<ConnectedClient, RpcStatus> {
            counter.fetch_add(1, Ordering::SeqCst);
            if connection.sensitive_data.contains_key("token") || connection.id == "dev" {
                Ok(kube_client())
            } else {
                Err(RpcStatus::new(StatusCode::Unauthenticated, "missing token"))
            }
        },
    );
    let controller = ResourceController::new(Arc::new(manager));
    controller.register(
        ResourceMeta::new("core", "v1", "Pod"),
        ResourceDefinition::default(),
        PodResourcer,
    );
    Managed { controller, built }
}

#[rstest]
fn loaded_connections_are_redacted(managed: Managed) {
    let ui = PluginContext::new("ui");
    let loaded = managed.controller.load_connections(&ui).expect("load");
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().all(|connection| connection.sensitive_data.is_empty()));
    let fetched = managed.controller.get_connection(&ui, "prod").expect("get");
    assert!(fetched.sensitive_data.is_empty());
    assert_eq!(fetched.data_str(NAMESPACE_KEY), Some("payments"));
}

#[rstest]
fn clients_are_built_from_the_stored_record_and_cached(managed: Managed) {
    let ui = PluginContext::new("ui");
    let redacted = managed
        .controller
        .load_connections(&ui)
        .expect("load")
        .into_iter()
        .find(|connection| connection.id == "prod")
        .expect("prod connection");
    let ctx = PluginContext::new("ui").with_connection(redacted);

    managed
        .controller
        .list(&ctx, POD, ListInput::default())
        .expect("first list");
    managed
        .controller
        .list(&ctx, POD, ListInput::default())
        .expect("second list");
    assert_eq!(managed.built.load(Ordering::SeqCst), 1);
}

#[rstest]
fn missing_connection_is_failed_precondition(managed: Managed) {
    let status = managed
        .controller
        .list(&PluginContext::new("ui"), POD, ListInput::default())
        .expect_err("no connection");
    assert_eq!(status.code, StatusCode::FailedPrecondition);
    assert_eq!(status.message, "no connection in plugin context");
}

#[rstest]
fn client_factory_failures_surface_their_code(managed: Managed) {
    let ctx = PluginContext::new("ui").with_connection(Connection::new("stranger", "Unknown"));
    let status = managed
        .controller
        .list(&ctx, POD, ListInput::default())
        .expect_err("factory fails");
    assert_eq!(status.code, StatusCode::Unauthenticated);
}

#[rstest]
fn unlisted_connections_get_uncached_clients_until_loaded(managed: Managed) {
    let dev = PluginContext::new("ui").with_connection(Connection::new("dev", "Development"));
    for _ in 0..2 {
        managed
            .controller
            .list(&dev, POD, ListInput::default())
            .expect("list before load");
    }
    assert_eq!(managed.built.load(Ordering::SeqCst), 2);

    managed
        .controller
        .load_connections(&PluginContext::new("ui"))
        .expect("load");
    for _ in 0..2 {
        managed
            .controller
            .list(&dev, POD, ListInput::default())
            .expect("list after load");
    }
    assert_eq!(managed.built.load(Ordering::SeqCst), 3);
}

#[rstest]
fn unknown_connections_are_rejected_once_loaded(managed: Managed) {
    managed
        .controller
        .load_connections(&PluginContext::new("ui"))
        .expect("load");
    let ctx = PluginContext::new("ui").with_connection(Connection::new("stranger", "Unknown"));
    let status = managed
        .controller
        .list(&ctx, POD, ListInput::default())
        .expect_err("unknown connection");
    assert_eq!(status.code, StatusCode::NotFound);
    assert_eq!(managed.built.load(Ordering::SeqCst), 0);
}

#[rstest]
fn update_keeps_secrets_and_drops_cached_client(managed: Managed) {
    let ui = PluginContext::new("ui");
    managed.controller.load_connections(&ui).expect("load");
    let ctx = PluginContext::new("ui").with_connection(connection());
    managed
        .controller
        .list(&ctx, POD, ListInput::default())
        .expect("list");

    let mut renamed = managed.controller.get_connection(&ui, "prod").expect("get");
    renamed.name = String::from("Production EU");
    let updated = managed
        .controller
        .update_connection(&ui, renamed)
        .expect("update");
    assert_eq!(updated.name, "Production EU");

    managed
        .controller
        .list(&ctx, POD, ListInput::default())
        .expect("list after update");
    assert_eq!(managed.built.load(Ordering::SeqCst), 2);
}

#[rstest]
fn removed_connections_are_gone(managed: Managed) {
    let ui = PluginContext::new("ui");
    managed.controller.load_connections(&ui).expect("load");
    managed
        .controller
        .remove_connection(&ui, "dev")
        .expect("remove");
    let status = managed
        .controller
        .get_connection(&ui, "dev")
        .expect_err("removed");
    assert_eq!(status.code, StatusCode::NotFound);
    assert_eq!(managed.controller.list_connections(&ui).expect("list").len(), 1);
}
