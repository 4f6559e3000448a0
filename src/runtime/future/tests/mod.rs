//! Future and error tests


use std::cell::Cell;
use std::rc::Rc;

use crate::runtime::future::{ErrorInfo, FutureHandle, Raise, Release, TaskError};

#[test]
fn test_resolve_once_and_retrieve_repeatedly() {
    let (resolver, future) = FutureHandle::<i64>::channel();
    assert!(!future.is_resolved());
    assert!(future.retrieve().is_none());
    assert_eq!(future.completion_seq(), None);

    resolver.resolve(Ok(7));
    assert!(future.is_resolved());
    assert!(future.completion_seq().is_some());
    assert_eq!(future.retrieve(), Some(Ok(7)));
    assert_eq!(future.retrieve(), Some(Ok(7)));
    assert!(future.is_retrieved());
}

#[test]
fn test_error_is_raised_once() {
    let (resolver, future) = FutureHandle::<i64>::channel();
    resolver.resolve(Err(ErrorInfo::new("boom", "it broke")));
    assert!(future.is_failed());

    let first = future.retrieve().unwrap().unwrap_err();
    assert!(first.is_raised());
    assert_eq!(first.info().kind, "boom");

    let second = future.retrieve().unwrap().unwrap_err();
    assert!(matches!(second, TaskError::Failed(_)));
    assert_eq!(second.info(), first.info());
}

#[test]
fn test_completion_sequence_follows_resolution_order() {
    let (first_resolver, first) = FutureHandle::<i64>::channel();
    let (second_resolver, second) = FutureHandle::<i64>::channel();
    second_resolver.resolve(Ok(2));
    first_resolver.resolve(Ok(1));
    assert!(second.completion_seq().unwrap() < first.completion_seq().unwrap());
}

#[test]
fn test_dropped_resolver_cancels() {
    let (resolver, future) = FutureHandle::<i64>::channel();
    drop(resolver);
    let err = future.retrieve().unwrap().unwrap_err();
    assert_eq!(err.info().kind, "cancelled");
}

#[test]
fn test_release_hook_runs_once_on_first_retrieval() {
    let released = Rc::new(Cell::new(0));
    let (resolver, future) = FutureHandle::<i64>::channel();
    let counter = released.clone();
    future.set_on_release(Box::new(move |reason| {
        assert_eq!(reason, Release::Retrieved);
        counter.set(counter.get() + 1);
    }));

    resolver.resolve(Ok(1));
    assert_eq!(released.get(), 0);
    future.retrieve();
    future.retrieve();
    drop(future);
    assert_eq!(released.get(), 1);
}

#[test]
fn test_release_hook_runs_when_never_retrieved() {
    let released = Rc::new(Cell::new(false));
    let (resolver, future) = FutureHandle::<i64>::channel();
    let flag = released.clone();
    future.set_on_release(Box::new(move |reason| flag.set(reason == Release::Dropped)));
    let clone = future.clone();

    drop(future);
    assert!(!released.get());
    drop(clone);
    assert!(!released.get(), "the resolver still holds the state");
    drop(resolver);
    assert!(released.get());
}

#[test]
fn test_clone_shares_state() {
    let (resolver, future) = FutureHandle::<String>::channel();
    let clone = future.clone();
    assert!(future.same(&clone));
    assert_eq!(future.id(), clone.id());
    resolver.resolve(Ok("done".to_string()));
    assert_eq!(clone.retrieve(), Some(Ok("done".to_string())));
}

#[test]
fn test_error_info_origin_is_caller() {
    let line = line!() + 1;
    let info = ErrorInfo::new("kind", "message");
    assert!(info.origin.file.ends_with("tests/mod.rs"));
    assert_eq!(info.origin.line, line);
    assert!(info.to_string().starts_with("kind: message (at "));
}

#[test]
fn test_raise_as_and_from_error() {
    let parsed: Result<i64, ErrorInfo> = "x".parse::<i64>().raise_as("ParseError");
    let info = parsed.unwrap_err();
    assert_eq!(info.kind, "ParseError");
    assert!(info.message.contains("invalid digit"));

    let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
    let info = ErrorInfo::from_error(&io);
    assert_eq!(info.kind, "Error");
    assert_eq!(info.message, "disk");
}

#[test]
fn test_panic_payloads() {
    let info = ErrorInfo::from_panic(Box::new("static str"));
    assert_eq!(info.kind, "panic");
    assert_eq!(info.message, "static str");
    let info = ErrorInfo::from_panic(Box::new(String::from("owned")));
    assert_eq!(info.message, "owned");
    let info = ErrorInfo::from_panic(Box::new(3u8));
    assert_eq!(info.message, "non-string panic payload");
}

#[test]
fn test_error_info_serializes() {
    let info = ErrorInfo::new("kind", "message");
    let json = serde_json::to_string(&info).unwrap();
    let back: ErrorInfo = serde_json::from_str(&json).unwrap();
    assert_eq!(back, info);
}
