//! Zero-copy reader for flattened context blocks
//!
//! A `ContextView` is a (block, offset) pair. Navigation never copies; all
//! reads are bounds-checked and a malformed block is reported as
//! `MemoryError::Corrupted` instead of returning garbage.

use indexmap::IndexMap;

use super::layout::{BLOCK_HEADER, BLOCK_MAGIC};
use super::MemoryError;
use crate::runtime::value::{Value, ValueKind};

/// A node inside a flattened block.
#[derive(Clone, Copy)]
pub struct ContextView<'a> {
    block: &'a [u8],
    off: usize,
}

impl std::fmt::Debug for ContextView<'_> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ContextView")
            .field("offset", &self.off)
            .field("kind", &self.kind().ok())
            .finish()
    }
}

fn corrupted(msg: impl Into<String>) -> MemoryError {
    MemoryError::Corrupted(msg.into())
}

fn read_u32(
    block: &[u8],
    at: usize,
) -> Result<u32, MemoryError> {
    block
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| corrupted(format!("u32 read at {} past end of block", at)))
}

fn read_8(
    block: &[u8],
    at: usize,
) -> Result<[u8; 8], MemoryError> {
    let bytes = block
        .get(at..at + 8)
        .ok_or_else(|| corrupted(format!("8-byte read at {} past end of block", at)))?;
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    Ok(out)
}

impl<'a> ContextView<'a> {
    /// Open the root node of a block.
    pub fn root(block: &'a [u8]) -> Result<Self, MemoryError> {
        if block.len() < BLOCK_HEADER {
            return Err(corrupted("block shorter than its header"));
        }
        if read_u32(block, 0)? != BLOCK_MAGIC {
            return Err(corrupted("bad block magic"));
        }
        let root = read_u32(block, 4)? as usize;
        if root < BLOCK_HEADER || root >= block.len() {
            return Err(corrupted(format!("root offset {} out of range", root)));
        }
        Ok(Self { block, off: root })
    }

    /// Offset of this node within the block.
    #[inline]
    pub fn offset(&self) -> usize {
        self.off
    }

    pub fn kind(&self) -> Result<ValueKind, MemoryError> {
        let tag = *self
            .block
            .get(self.off)
            .ok_or_else(|| corrupted(format!("node offset {} past end of block", self.off)))?;
        ValueKind::from_u8(tag).ok_or_else(|| corrupted(format!("unknown kind tag {}", tag)))
    }

    fn expect(
        &self,
        expected: ValueKind,
    ) -> Result<(), MemoryError> {
        let found = self.kind()?;
        if found == expected {
            Ok(())
        } else {
            Err(MemoryError::KindMismatch { expected, found })
        }
    }

    pub fn is_null(&self) -> Result<bool, MemoryError> {
        Ok(self.kind()? == ValueKind::Null)
    }

    pub fn as_bool(&self) -> Result<bool, MemoryError> {
        self.expect(ValueKind::Bool)?;
        match self.block.get(self.off + 1) {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            Some(b) => Err(corrupted(format!("invalid bool byte {}", b))),
            None => Err(corrupted("bool past end of block")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, MemoryError> {
        self.expect(ValueKind::Int)?;
        Ok(i64::from_le_bytes(read_8(self.block, self.off + 1)?))
    }

    pub fn as_f64(&self) -> Result<f64, MemoryError> {
        match self.kind()? {
            ValueKind::Float => Ok(f64::from_le_bytes(read_8(self.block, self.off + 1)?)),
            ValueKind::Int => Ok(self.as_i64()? as f64),
            found => Err(MemoryError::KindMismatch {
                expected: ValueKind::Float,
                found,
            }),
        }
    }

    fn raw_bytes(&self) -> Result<&'a [u8], MemoryError> {
        let len = read_u32(self.block, self.off + 1)? as usize;
        let start = self.off + 5;
        self.block
            .get(start..start + len)
            .ok_or_else(|| corrupted(format!("{} byte payload at {} past end of block", len, start)))
    }

    pub fn as_str(&self) -> Result<&'a str, MemoryError> {
        self.expect(ValueKind::Str)?;
        std::str::from_utf8(self.raw_bytes()?).map_err(|e| corrupted(format!("invalid utf-8: {}", e)))
    }

    pub fn as_bytes(&self) -> Result<&'a [u8], MemoryError> {
        self.expect(ValueKind::Bytes)?;
        self.raw_bytes()
    }

    /// Number of children of an array or map (0 for scalars).
    pub fn len(&self) -> Result<usize, MemoryError> {
        match self.kind()? {
            ValueKind::Array | ValueKind::Map => Ok(read_u32(self.block, self.off + 1)? as usize),
            _ => Ok(0),
        }
    }

    pub fn is_empty(&self) -> Result<bool, MemoryError> {
        Ok(self.len()? == 0)
    }

    /// Follow a child offset, enforcing that children come after parents.
    fn child(
        &self,
        off: u32,
    ) -> Result<Self, MemoryError> {
        let off = off as usize;
        if off <= self.off || off >= self.block.len() {
            return Err(corrupted(format!(
                "child offset {} invalid for parent at {}",
                off, self.off
            )));
        }
        Ok(Self {
            block: self.block,
            off,
        })
    }

    /// Array element at `idx`, or `None` when out of bounds.
    pub fn index(
        &self,
        idx: usize,
    ) -> Result<Option<Self>, MemoryError> {
        self.expect(ValueKind::Array)?;
        let count = self.len()?;
        if idx >= count {
            return Ok(None);
        }
        let at = self.off + 5 + idx * 4;
        self.child(read_u32(self.block, at)?).map(Some)
    }

    /// All array elements.
    pub fn items(&self) -> Result<Vec<Self>, MemoryError> {
        self.expect(ValueKind::Array)?;
        let count = self.len()?;
        let mut out = Vec::with_capacity(count);
        for idx in 0..count {
            let at = self.off + 5 + idx * 4;
            out.push(self.child(read_u32(self.block, at)?)?);
        }
        Ok(out)
    }

    /// All map entries, in insertion order.
    pub fn entries(&self) -> Result<Vec<(&'a str, Self)>, MemoryError> {
        self.expect(ValueKind::Map)?;
        let count = self.len()?;
        let mut out = Vec::with_capacity(count);
        for idx in 0..count {
            let at = self.off + 5 + idx * 8;
            let key = self.child(read_u32(self.block, at)?)?.as_str()?;
            let val = self.child(read_u32(self.block, at + 4)?)?;
            out.push((key, val));
        }
        Ok(out)
    }

    /// Look up a map key.
    pub fn get(
        &self,
        key: &str,
    ) -> Result<Option<Self>, MemoryError> {
        self.expect(ValueKind::Map)?;
        let count = self.len()?;
        for idx in 0..count {
            let at = self.off + 5 + idx * 8;
            if self.child(read_u32(self.block, at)?)?.as_str()? == key {
                return self.child(read_u32(self.block, at + 4)?).map(Some);
            }
        }
        Ok(None)
    }

    pub fn keys(&self) -> Result<Vec<&'a str>, MemoryError> {
        Ok(self.entries()?.into_iter().map(|(k, _)| k).collect())
    }

    /// Copy this node and everything below it into an owned `Value`.
    pub fn to_value(&self) -> Result<Value, MemoryError> {
        Ok(match self.kind()? {
            ValueKind::Null => Value::Null,
            ValueKind::Bool => Value::Bool(self.as_bool()?),
            ValueKind::Int => Value::Int(self.as_i64()?),
            ValueKind::Float => Value::Float(self.as_f64()?),
            ValueKind::Str => Value::Str(self.as_str()?.to_string()),
            ValueKind::Bytes => Value::Bytes(self.as_bytes()?.to_vec()),
            ValueKind::Array => Value::Array(
                self.items()?
                    .iter()
                    .map(ContextView::to_value)
                    .collect::<Result<_, _>>()?,
            ),
            ValueKind::Map => {
                let mut map = IndexMap::new();
                for (key, val) in self.entries()? {
                    map.insert(key.to_string(), val.to_value()?);
                }
                Value::Map(map)
            }
        })
    }
}
