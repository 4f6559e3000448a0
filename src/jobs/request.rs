//! Job requests and responses

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::codec::{self, CodecError};
use crate::runtime::future::{ErrorInfo, Origin};
use crate::runtime::memory::ContextRef;

/// A unit of work for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Selects the handler on the worker side.
    pub type_tag: String,
    /// Handler input, usually MessagePack.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Shared context the handler may read.
    pub context: Option<ContextRef>,
}

impl JobRequest {
    pub fn new(
        type_tag: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload,
            context: None,
        }
    }

    /// Build a request with a MessagePack-encoded payload.
    pub fn encode<T: Serialize + ?Sized>(
        type_tag: impl Into<String>,
        payload: &T,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(type_tag, codec::encode(payload)?))
    }

    pub fn with_context(
        mut self,
        context: ContextRef,
    ) -> Self {
        self.context = Some(context);
        self
    }
}

/// Result of a job, as produced by the worker.
///
/// Application failures are values, not transport errors: the job ran and
/// reported that it could not do its work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobResponse {
    Success(#[serde(with = "serde_bytes")] Vec<u8>),
    ApplicationError { kind: String, message: String },
}

impl JobResponse {
    /// A success with a MessagePack-encoded value.
    pub fn success<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Ok(JobResponse::Success(codec::encode(value)?))
    }

    pub fn error(
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        JobResponse::ApplicationError {
            kind: kind.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, JobResponse::Success(_))
    }

    /// Error kind, for application errors.
    pub fn error_kind(&self) -> Option<&str> {
        match self {
            JobResponse::Success(_) => None,
            JobResponse::ApplicationError { kind, .. } => Some(kind),
        }
    }

    /// Decode a success payload. Application errors and undecodable payloads
    /// both come back as `ErrorInfo`, so `?` works inside a task.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ErrorInfo> {
        match self {
            JobResponse::Success(bytes) => codec::decode(bytes).map_err(|e| ErrorInfo {
                kind: "decode".to_string(),
                message: e.to_string(),
                origin: Origin::unknown(),
            }),
            JobResponse::ApplicationError { kind, message } => Err(ErrorInfo {
                kind: kind.clone(),
                message: message.clone(),
                origin: Origin::unknown(),
            }),
        }
    }
}

/// Encode `Vec<u8>` as a MessagePack bin instead of an array of integers.
mod serde_bytes {
    use std::fmt;

    use serde::de::{Error, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        d.deserialize_byte_buf(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(
            &self,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            f.write_str("a byte buffer")
        }

        fn visit_bytes<E: Error>(
            self,
            v: &[u8],
        ) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: Error>(
            self,
            v: Vec<u8>,
        ) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        // Formats without a bytes type (JSON) write a sequence.
        fn visit_seq<A: SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}
