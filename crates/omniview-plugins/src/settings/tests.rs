//! Unit tests for the settings store.

use std::collections::BTreeMap;

use rstest::{fixture, rstest};
use serde_json::{Value, json};

use super::*;

#[fixture]
fn store() -> SettingsStore {
    SettingsStore::new([
        SettingDefinition::new("kubeconfigs", "Kubeconfigs", SettingKind::Text, json!("~/.kube/config")),
        SettingDefinition::new("page_size", "Page size", SettingKind::Integer, json!(50)),
        SettingDefinition::new("theme", "Theme", SettingKind::Select, json!("dark"))
            .with_options(vec![json!("dark"), json!("light")]),
        SettingDefinition::new("watch", "Watch", SettingKind::Toggle, json!(true))
            .with_description("Stream live updates"),
    ])
    .expect("valid definitions")
}

#[rstest]
fn defaults_are_current_values(store: SettingsStore) {
    let ids: Vec<_> = store
        .list()
        .into_iter()
        .map(|setting| setting.definition.id)
        .collect();
    assert_eq!(ids, ["kubeconfigs", "page_size", "theme", "watch"]);
    assert_eq!(store.get_value("page_size"), Ok(json!(50)));
    assert_eq!(store.value("watch"), Some(json!(true)));
}

#[rstest]
#[case::text("kubeconfigs", json!("/tmp/kc"))]
#[case::integer("page_size", json!(200))]
#[case::select("theme", json!("light"))]
#[case::toggle("watch", json!(false))]
fn valid_values_are_stored(store: SettingsStore, #[case] id: &str, #[case] value: Value) {
    store.set(id, value.clone()).expect("value accepted");
    assert_eq!(store.get_value(id), Ok(value));
}

#[rstest]
#[case::text("kubeconfigs", json!(1), SettingKind::Text)]
#[case::integer("page_size", json!(1.5), SettingKind::Integer)]
#[case::select("theme", json!("neon"), SettingKind::Select)]
#[case::toggle("watch", json!("yes"), SettingKind::Toggle)]
fn invalid_values_are_rejected(
    store: SettingsStore,
    #[case] id: &str,
    #[case] value: Value,
    #[case] kind: SettingKind,
) {
    assert_eq!(
        store.set(id, value),
        Err(SettingsError::InvalidValue {
            id: id.to_owned(),
            kind,
        })
    );
}

#[rstest]
fn unknown_setting_is_not_found(store: SettingsStore) {
    let status = store.get_setting("nope").expect_err("unknown id");
    assert_eq!(status.code, crate::rpc::StatusCode::NotFound);
}

#[rstest]
fn set_many_is_all_or_nothing(store: SettingsStore) {
    let mut batch = BTreeMap::new();
    batch.insert(String::from("page_size"), json!(10));
    batch.insert(String::from("theme"), json!("neon"));
    assert!(store.set_many(batch).is_err());
    assert_eq!(store.get_value("page_size"), Ok(json!(50)));

    let mut batch = BTreeMap::new();
    batch.insert(String::from("page_size"), json!(10));
    batch.insert(String::from("theme"), json!("light"));
    store.set_many(batch).expect("batch applies");
    assert_eq!(store.get_value("page_size"), Ok(json!(10)));
    assert_eq!(store.get_value("theme"), Ok(json!("light")));
}

#[rstest]
fn duplicate_and_invalid_definitions_fail() {
    let duplicate = SettingsStore::new([
        SettingDefinition::new("a", "A", SettingKind::Toggle, json!(true)),
        SettingDefinition::new("a", "A again", SettingKind::Toggle, json!(false)),
    ]);
    assert!(matches!(duplicate, Err(SettingsError::Duplicate { id }) if id == "a"));

    let invalid = SettingsStore::new([SettingDefinition::new(
        "n",
        "N",
        SettingKind::Integer,
        json!("ten"),
    )]);
    assert!(matches!(invalid, Err(SettingsError::InvalidValue { .. })));
}

#[rstest]
fn multiselect_checks_every_item() {
    let store = SettingsStore::new([SettingDefinition::new(
        "regions",
        "Regions",
        SettingKind::Multiselect,
        json!([]),
    )
    .with_options(vec![json!("eu-west-1"), json!("us-east-1")])])
    .expect("valid definitions");
    store
        .set("regions", json!(["us-east-1"]))
        .expect("known option");
    assert!(store.set("regions", json!(["ap-south-1"])).is_err());
    assert!(store.set("regions", json!("us-east-1")).is_err());
}
