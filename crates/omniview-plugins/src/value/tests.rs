//! Unit tests for opaque value envelopes.

use rstest::rstest;
use serde_json::{Value, json};

use super::*;

#[rstest]
#[case::string(json!("hello"))]
#[case::number(json!(42.5))]
#[case::boolean(json!(true))]
#[case::null(Value::Null)]
#[case::nested(json!({"list": [1, "two", {"three": 3}], "flag": false}))]
fn decode_inverts_encode(#[case] value: Value) {
    let envelope = OpaqueValue::encode(&value).expect("encode");
    assert_eq!(envelope.to_value().expect("decode"), value);
}

#[rstest]
fn header_carries_version_and_length() {
    let envelope = OpaqueValue::encode(&json!("ab")).expect("encode");
    assert_eq!(envelope.as_bytes(), b"\x01\x00\x00\x00\x04\"ab\"");
}

#[rstest]
fn truncated_buffer_is_rejected() {
    let err = OpaqueValue::from_bytes(vec![1, 0])
        .to_value()
        .expect_err("truncated");
    assert!(matches!(err, ValueError::Truncated { len: 2 }));
}

#[rstest]
fn unknown_version_is_rejected() {
    let err = OpaqueValue::from_bytes(vec![9, 0, 0, 0, 2, b'{', b'}'])
        .to_value()
        .expect_err("version");
    assert!(matches!(err, ValueError::UnsupportedVersion { version: 9 }));
}

#[rstest]
fn length_mismatch_is_rejected() {
    let err = OpaqueValue::from_bytes(vec![1, 0, 0, 0, 7, b'{', b'}'])
        .to_value()
        .expect_err("length");
    assert!(matches!(
        err,
        ValueError::LengthMismatch {
            declared: 7,
            actual: 2
        }
    ));
}

#[rstest]
fn travels_as_base64_inside_json() {
    let envelope = OpaqueValue::encode(&json!(1)).expect("encode");
    let wire = serde_json::to_value(&envelope).expect("serialise");
    assert_eq!(wire, json!("AQAAAAEx"));
    let back: OpaqueValue = serde_json::from_value(wire).expect("deserialise");
    assert_eq!(back, envelope);
}
