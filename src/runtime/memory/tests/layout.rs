//! Flattening and view tests

use proptest::prelude::*;

use crate::runtime::memory::layout::{encoded_len, flatten_into, flatten_to_vec, BLOCK_HEADER};
use crate::runtime::memory::{ContextView, MemoryError};
use crate::runtime::value::{Value, ValueKind};

fn nested() -> Value {
    Value::map([
        (
            "users",
            Value::Array(vec![
                Value::map([("id", 1i64.into()), ("tags", Value::Array(vec!["a".into()]))]),
                Value::map([("id", 2i64.into()), ("tags", Value::Array(vec![]))]),
            ]),
        ),
        ("ratio", 0.25f64.into()),
        ("blob", Value::Bytes(vec![0, 1, 2])),
        ("flag", false.into()),
        ("none", Value::Null),
    ])
}

#[test]
fn test_encoded_len_is_exact() {
    let value = nested();
    let block = flatten_to_vec(&value).unwrap();
    assert_eq!(block.len(), encoded_len(&value));
}

#[test]
fn test_navigate_without_copying() {
    let block = flatten_to_vec(&nested()).unwrap();
    let root = ContextView::root(&block).unwrap();
    assert_eq!(root.kind().unwrap(), ValueKind::Map);
    assert_eq!(root.keys().unwrap(), vec!["users", "ratio", "blob", "flag", "none"]);

    let users = root.get("users").unwrap().unwrap();
    assert_eq!(users.len().unwrap(), 2);
    let second = users.index(1).unwrap().unwrap();
    assert_eq!(second.get("id").unwrap().unwrap().as_i64().unwrap(), 2);
    assert!(second.get("tags").unwrap().unwrap().is_empty().unwrap());

    assert_eq!(root.get("ratio").unwrap().unwrap().as_f64().unwrap(), 0.25);
    assert_eq!(root.get("blob").unwrap().unwrap().as_bytes().unwrap(), &[0, 1, 2]);
    assert!(!root.get("flag").unwrap().unwrap().as_bool().unwrap());
    assert!(root.get("none").unwrap().unwrap().is_null().unwrap());
    assert!(root.get("missing").unwrap().is_none());
    assert!(users.index(5).unwrap().is_none());
}

#[test]
fn test_offsets_are_block_relative() {
    // The same bytes copied anywhere else read identically.
    let block = flatten_to_vec(&nested()).unwrap();
    let mut elsewhere = vec![0xAAu8; 3];
    elsewhere.extend_from_slice(&block);
    let copy = &elsewhere[3..];
    assert_eq!(
        ContextView::root(copy).unwrap().to_value().unwrap(),
        nested()
    );
}

#[test]
fn test_kind_mismatch() {
    let block = flatten_to_vec(&Value::Int(3)).unwrap();
    let root = ContextView::root(&block).unwrap();
    assert!(matches!(
        root.as_str(),
        Err(MemoryError::KindMismatch {
            expected: ValueKind::Str,
            found: ValueKind::Int
        })
    ));
    assert_eq!(root.as_f64().unwrap(), 3.0);
}

#[test]
fn test_bad_magic_is_corruption() {
    let mut block = flatten_to_vec(&Value::Int(3)).unwrap();
    block[0] ^= 0xFF;
    assert!(matches!(
        ContextView::root(&block),
        Err(MemoryError::Corrupted(_))
    ));
}

#[test]
fn test_backward_child_offset_is_corruption() {
    let mut block = flatten_to_vec(&Value::Array(vec![Value::Int(1)])).unwrap();
    // Point the only child back at the array itself.
    let root = BLOCK_HEADER as u32;
    let table = BLOCK_HEADER + 1 + 4;
    block[table..table + 4].copy_from_slice(&root.to_le_bytes());
    let view = ContextView::root(&block).unwrap();
    assert!(matches!(view.index(0), Err(MemoryError::Corrupted(_))));
    assert!(view.to_value().is_err());
}

#[test]
fn test_truncated_block_is_corruption() {
    let block = flatten_to_vec(&Value::Str("hello world".into())).unwrap();
    let truncated = &block[..block.len() - 3];
    let view = ContextView::root(truncated).unwrap();
    assert!(matches!(view.as_str(), Err(MemoryError::Corrupted(_))));
}

#[test]
fn test_flatten_into_small_buffer() {
    let mut buf = vec![0u8; 16];
    assert!(matches!(
        flatten_into(&Value::Str("x".repeat(64)), &mut buf),
        Err(MemoryError::TooLarge { .. })
    ));
}

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1.0e9f64..1.0e9).prop_map(Value::Float),
        "[a-z]{0,12}".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,6}", inner), 0..6)
                .prop_map(|entries| Value::map(entries)),
        ]
    })
}

proptest! {
    #[test]
    fn prop_view_reads_back_the_published_graph(value in arb_value()) {
        let block = flatten_to_vec(&value).unwrap();
        prop_assert_eq!(block.len(), encoded_len(&value));
        let view = ContextView::root(&block).unwrap();
        prop_assert_eq!(view.to_value().unwrap(), value);
    }
}
