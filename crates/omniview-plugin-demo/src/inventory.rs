//! An in-memory item store served as the `demo::v1::Item` resource.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Value, json};

use omniview_plugins::controller::Resourcer;
use omniview_plugins::resource::{
    CreateInput, CreateResult, DeleteInput, DeleteResult, FindInput, FindResult, GetInput,
    GetResult, ListInput, ListResult, OperationResult, ResourceDefinition, ResourceMeta,
};
use omniview_plugins::{PluginContext, RpcStatus, StatusCode};

/// Namespace used when a request names none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Type metadata for demo items.
#[must_use]
pub fn item_meta() -> ResourceMeta {
    ResourceMeta::new("demo", "v1", "Item")
        .with_category("Demo")
        .with_description("Items held in memory by the demo plugin")
}

/// How the UI renders demo items.
#[must_use]
pub fn item_definition() -> ResourceDefinition {
    ResourceDefinition {
        id_accessor: String::from("id"),
        namespace_accessor: String::from("namespace"),
        columns: vec![
            json!({ "id": "id", "header": "Name", "accessor": "id" }),
            json!({ "id": "namespace", "header": "Namespace", "accessor": "namespace" }),
        ],
    }
}

/// Items for one connection, keyed by `(namespace, id)`.
#[derive(Debug, Default)]
pub struct Inventory {
    items: RwLock<BTreeMap<(String, String), Value>>,
}

impl Inventory {
    /// An inventory holding `alpha` and `beta` in the default namespace.
    #[must_use]
    pub fn seeded(connection: &str) -> Self {
        let inventory = Self::default();
        {
            let mut items = inventory.write();
            for id in ["alpha", "beta"] {
                items.insert(
                    (String::from(DEFAULT_NAMESPACE), String::from(id)),
                    json!({ "id": id, "namespace": DEFAULT_NAMESPACE, "connection": connection }),
                );
            }
        }
        inventory
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<(String, String), Value>> {
        self.items
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<(String, String), Value>> {
        self.items
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

fn namespace_or_default(namespace: &str) -> String {
    if namespace.is_empty() {
        String::from(DEFAULT_NAMESPACE)
    } else {
        namespace.to_owned()
    }
}

fn in_namespaces(namespaces: &[String], namespace: &str) -> bool {
    namespaces.is_empty() || namespaces.iter().any(|candidate| candidate == namespace)
}

/// CRUD over an [`Inventory`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ItemResourcer;

impl Resourcer<Inventory> for ItemResourcer {
    fn get(&self, _ctx: &PluginContext, client: &Inventory, input: GetInput) -> Result<GetResult, RpcStatus> {
        let key = (namespace_or_default(&input.namespace), input.id);
        client
            .read()
            .get(&key)
            .cloned()
            .map(OperationResult::ok)
            .ok_or_else(|| RpcStatus::not_found(format!("item '{}/{}' not found", key.0, key.1)))
    }

    fn list(&self, _ctx: &PluginContext, client: &Inventory, input: ListInput) -> Result<ListResult, RpcStatus> {
        let items = client
            .read()
            .iter()
            .filter(|((namespace, _), _)| in_namespaces(&input.namespaces, namespace))
            .map(|(_, item)| item.clone())
            .collect();
        Ok(OperationResult::ok(items))
    }

    fn find(&self, _ctx: &PluginContext, client: &Inventory, input: FindInput) -> Result<FindResult, RpcStatus> {
        let prefix = input
            .conditions
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let items = client
            .read()
            .iter()
            .filter(|((namespace, id), _)| {
                in_namespaces(&input.namespaces, namespace) && id.starts_with(prefix)
            })
            .map(|(_, item)| item.clone())
            .collect();
        Ok(OperationResult::ok(items))
    }

    fn create(
        &self,
        _ctx: &PluginContext,
        client: &Inventory,
        input: CreateInput,
    ) -> Result<CreateResult, RpcStatus> {
        let Some(id) = input.input.get("id").and_then(Value::as_str) else {
            return Err(RpcStatus::invalid_argument("item needs a string 'id'"));
        };
        let namespace = namespace_or_default(&input.namespace);
        let key = (namespace.clone(), id.to_owned());
        let mut items = client.write();
        if items.contains_key(&key) {
            return Err(RpcStatus::new(
                StatusCode::AlreadyExists,
                format!("item '{namespace}/{id}' already exists"),
            ));
        }
        let mut item = input.input.clone();
        if let Some(object) = item.as_object_mut() {
            object.insert(String::from("namespace"), Value::String(namespace));
        }
        items.insert(key, item.clone());
        Ok(OperationResult::ok(item))
    }

    fn delete(
        &self,
        _ctx: &PluginContext,
        client: &Inventory,
        input: DeleteInput,
    ) -> Result<DeleteResult, RpcStatus> {
        let key = (namespace_or_default(&input.namespace), input.id);
        client
            .write()
            .remove(&key)
            .map(OperationResult::ok)
            .ok_or_else(|| RpcStatus::not_found(format!("item '{}/{}' not found", key.0, key.1)))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn ctx() -> PluginContext {
        PluginContext::new("tester")
    }

    #[rstest]
    fn seeded_items_are_listed() {
        let inventory = Inventory::seeded("local");
        let listed = ItemResourcer
            .list(&ctx(), &inventory, ListInput::default())
            .expect("list");
        assert_eq!(listed.result.len(), 2);
        assert!(listed.success);
    }

    #[rstest]
    #[case::any_namespace(Vec::new(), 2)]
    #[case::default_namespace(vec![String::from("default")], 2)]
    #[case::other_namespace(vec![String::from("kube-system")], 0)]
    fn list_filters_namespaces(#[case] namespaces: Vec<String>, #[case] expected: usize) {
        let inventory = Inventory::seeded("local");
        let listed = ItemResourcer
            .list(&ctx(), &inventory, ListInput { namespaces })
            .expect("list");
        assert_eq!(listed.result.len(), expected);
    }

    #[rstest]
    fn create_then_find_then_delete() {
        let inventory = Inventory::default();
        let created = ItemResourcer
            .create(
                &ctx(),
                &inventory,
                CreateInput {
                    input: json!({ "id": "gamma" }),
                    namespace: String::new(),
                },
            )
            .expect("create");
        assert_eq!(created.result["namespace"], "default");

        let found = ItemResourcer
            .find(
                &ctx(),
                &inventory,
                FindInput {
                    conditions: json!({ "prefix": "ga" }),
                    namespaces: Vec::new(),
                },
            )
            .expect("find");
        assert_eq!(found.result.len(), 1);

        ItemResourcer
            .delete(
                &ctx(),
                &inventory,
                DeleteInput {
                    id: String::from("gamma"),
                    ..DeleteInput::default()
                },
            )
            .expect("delete");
        let missing = ItemResourcer
            .get(
                &ctx(),
                &inventory,
                GetInput {
                    id: String::from("gamma"),
                    namespace: String::new(),
                },
            )
            .expect_err("gone");
        assert_eq!(missing.code, StatusCode::NotFound);
    }

    #[rstest]
    fn create_rejects_duplicates_and_missing_ids() {
        let inventory = Inventory::seeded("local");
        let duplicate = ItemResourcer
            .create(
                &ctx(),
                &inventory,
                CreateInput {
                    input: json!({ "id": "alpha" }),
                    namespace: String::from("default"),
                },
            )
            .expect_err("duplicate");
        assert_eq!(duplicate.code, StatusCode::AlreadyExists);

        let anonymous = ItemResourcer
            .create(&ctx(), &inventory, CreateInput::default())
            .expect_err("no id");
        assert_eq!(anonymous.code, StatusCode::InvalidArgument);
    }
}
