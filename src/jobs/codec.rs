//! Wire format between the dispatcher and its workers
//!
//! Every frame is a `u32` little-endian body length followed by a
//! MessagePack body. Payloads inside requests and responses are opaque
//! bytes, usually produced by `encode`.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::request::{JobRequest, JobResponse};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// Serialize a payload with MessagePack.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Deserialize a MessagePack payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Messages exchanged over a worker link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame a worker sends once it is ready.
    Hello { worker_id: usize, pid: u32 },
    /// Dispatcher to worker: run a job. `timeout_ms` is the job's time
    /// budget, measured by the worker from receipt.
    Request {
        job_id: u64,
        request: JobRequest,
        timeout_ms: Option<u64>,
    },
    /// Worker to dispatcher: the job's response.
    Response { job_id: u64, response: JobResponse },
    /// Dispatcher to worker: exit after the current job.
    Shutdown,
}

impl Frame {
    /// Encode the frame body (without the length prefix). Bodies over
    /// `MAX_FRAME_LEN` are rejected here, before anything is written.
    pub fn to_body(&self) -> Result<Vec<u8>, CodecError> {
        let body = encode(self)?;
        check_len(body.len())?;
        Ok(body)
    }
}

fn check_len(len: usize) -> Result<(), CodecError> {
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// Write a pre-encoded frame body with its length prefix.
pub fn write_body<W: Write + ?Sized>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), CodecError> {
    check_len(body.len())?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), CodecError> {
    write_body(writer, &frame.to_body()?)
}

/// Read one frame. `Ok(None)` when the stream ends cleanly between frames.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Frame>, CodecError> {
    let mut len = [0u8; 4];
    let mut filled = 0;
    while filled < len.len() {
        match reader.read(&mut len[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(CodecError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame header",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let len = u32::from_le_bytes(len) as usize;
    check_len(len)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(decode(&body)?))
}
