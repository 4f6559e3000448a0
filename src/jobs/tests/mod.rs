//! Job worker tests
//!
//! 测试帧编解码、工作进程协议与任务分发


use crate::jobs::{JobRequest, JobResponse};

pub(crate) fn request<T: serde::Serialize>(
    tag: &str,
    payload: &T,
) -> JobRequest {
    JobRequest::encode(tag, payload).unwrap()
}

#[test]
fn test_response_decode() {
    let ok = JobResponse::success(&42i64).unwrap();
    assert!(ok.is_success());
    assert_eq!(ok.error_kind(), None);
    assert_eq!(ok.decode::<i64>().unwrap(), 42);

    let err = JobResponse::error("job_failed", "boom");
    assert!(!err.is_success());
    assert_eq!(err.error_kind(), Some("job_failed"));
    let info = err.decode::<i64>().unwrap_err();
    assert_eq!(info.kind, "job_failed");
    assert_eq!(info.message, "boom");
}

#[test]
fn test_response_decode_wrong_type() {
    let ok = JobResponse::success("text").unwrap();
    assert_eq!(ok.decode::<i64>().unwrap_err().kind, "decode");
}
