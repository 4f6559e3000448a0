//! Value graph tests

use crate::runtime::value::{Value, ValueKind};

#[test]
fn test_value_kind_roundtrip_tags() {
    for tag in 0..8u8 {
        let kind = ValueKind::from_u8(tag).unwrap();
        assert_eq!(kind.as_u8(), tag);
    }
    assert!(ValueKind::from_u8(8).is_none());
}

#[test]
fn test_scalar_accessors() {
    assert_eq!(Value::from(7i64).as_i64(), Some(7));
    assert_eq!(Value::from(true).as_bool(), Some(true));
    assert_eq!(Value::from("hi").as_str(), Some("hi"));
    assert_eq!(Value::from(3i64).as_f64(), Some(3.0));
    assert!(Value::Null.as_i64().is_none());
}

#[test]
fn test_map_keeps_insertion_order() {
    let v = Value::map([("b", Value::from(1i64)), ("a", Value::from(2i64))]);
    match &v {
        Value::Map(entries) => {
            let keys: Vec<&str> = entries.keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["b", "a"]);
        }
        _ => panic!("expected map"),
    }
    assert_eq!(v.get("a").and_then(Value::as_i64), Some(2));
}

#[test]
fn test_node_count() {
    let v: Value = vec![Value::from(1i64), Value::from(2i64)].into_iter().collect();
    assert_eq!(v.node_count(), 3);
    assert_eq!(v.len(), 2);
    assert_eq!(v.index(1).and_then(Value::as_i64), Some(2));
}

#[test]
fn test_from_json() {
    let json = serde_json::json!({"ids": [1, 2, 3], "name": "x", "ratio": 0.5, "none": null});
    let v = Value::from(json);
    assert_eq!(v.kind(), ValueKind::Map);
    assert_eq!(v.get("ids").map(Value::len), Some(3));
    assert_eq!(v.get("name").and_then(Value::as_str), Some("x"));
    assert_eq!(v.get("ratio").and_then(Value::as_f64), Some(0.5));
    assert_eq!(v.get("none"), Some(&Value::Null));
}

#[test]
fn test_display() {
    let v = Value::map([("k", Value::Array(vec![Value::from(1i64), Value::Null]))]);
    assert_eq!(v.to_string(), "{\"k\": [1, null]}");
}
