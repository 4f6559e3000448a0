//! Built-in job handlers of the `tasklane worker` binary

use std::time::Duration;

use super::request::JobResponse;
use super::worker::{JobRegistry, JobScope};
use crate::runtime::future::ErrorInfo;
use crate::runtime::value::{Value, ValueKind};

pub(crate) fn register(registry: &mut JobRegistry) {
    registry
        .register("echo", echo)
        .register("sum", sum)
        .register("sleep", sleep)
        .register("fail", fail)
        .register("panic", panic_job)
        .register("context_sum", context_sum)
        .register("context_get", context_get);
}

/// Returns the payload bytes unchanged.
fn echo(scope: &mut JobScope<'_>) -> Result<(), ErrorInfo> {
    let payload = scope.payload().to_vec();
    scope.store_response(JobResponse::Success(payload))?;
    Ok(())
}

/// Payload `Vec<i64>`; returns the sum.
fn sum(scope: &mut JobScope<'_>) -> Result<(), ErrorInfo> {
    let values: Vec<i64> = scope.decode()?;
    let total = values
        .iter()
        .try_fold(0i64, |acc, v| acc.checked_add(*v))
        .ok_or_else(|| ErrorInfo::new("overflow", "sum does not fit in i64"))?;
    scope.store_success(&total)?;
    Ok(())
}

/// Payload `u64` milliseconds; sleeps, then returns them.
fn sleep(scope: &mut JobScope<'_>) -> Result<(), ErrorInfo> {
    let ms: u64 = scope.decode()?;
    std::thread::sleep(Duration::from_millis(ms));
    scope.store_success(&ms)?;
    Ok(())
}

/// Payload `String`; fails with it as the message.
fn fail(scope: &mut JobScope<'_>) -> Result<(), ErrorInfo> {
    let message: String = scope.decode()?;
    Err(ErrorInfo::new("job_failed", message))
}

/// Payload `String`; panics with it.
fn panic_job(scope: &mut JobScope<'_>) -> Result<(), ErrorInfo> {
    let message: String = scope.decode()?;
    panic!("{message}");
}

/// Sums every integer in the shared context, at any depth.
fn context_sum(scope: &mut JobScope<'_>) -> Result<(), ErrorInfo> {
    let total = scope.with_context(|root| {
        let mut total = 0i64;
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let kind = node.kind().map_err(|e| ErrorInfo::from_error(&e))?;
            match kind {
                ValueKind::Int => total += node.as_i64().map_err(|e| ErrorInfo::from_error(&e))?,
                ValueKind::Array => {
                    stack.extend(node.items().map_err(|e| ErrorInfo::from_error(&e))?)
                }
                ValueKind::Map => stack.extend(
                    node.entries()
                        .map_err(|e| ErrorInfo::from_error(&e))?
                        .into_iter()
                        .map(|(_, v)| v),
                ),
                _ => {}
            }
        }
        Ok(total)
    })?;
    scope.store_success(&total)?;
    Ok(())
}

/// Payload `String` key; returns the context's entry under that key as a
/// `Value` (`Null` when absent).
fn context_get(scope: &mut JobScope<'_>) -> Result<(), ErrorInfo> {
    let key: String = scope.decode()?;
    let value = scope.with_context(|root| {
        let found = root.get(&key).map_err(|e| ErrorInfo::from_error(&e))?;
        match found {
            Some(node) => node.to_value().map_err(|e| ErrorInfo::from_error(&e)),
            None => Ok(Value::Null),
        }
    })?;
    scope.store_success(&value)?;
    Ok(())
}
