//! Flattened context block layout
//!
//! A block starts with an 8-byte header (`magic: u32`, `root: u32`) followed
//! by nodes. Every node starts with a one-byte kind tag:
//!
//! | kind  | payload                                              |
//! |-------|------------------------------------------------------|
//! | Null  | -                                                    |
//! | Bool  | `u8`                                                 |
//! | Int   | `i64` LE                                             |
//! | Float | `f64` LE                                             |
//! | Str   | `u32` length, UTF-8 bytes                            |
//! | Bytes | `u32` length, bytes                                  |
//! | Array | `u32` count, `count` x `u32` child offsets           |
//! | Map   | `u32` count, `count` x (`u32` key, `u32` value) offsets |
//!
//! Offsets are relative to the block start, never process addresses, so a
//! block reads the same wherever the arena is mapped. Children are always
//! written after their parent, which gives readers a cheap cycle check.

use super::MemoryError;
use crate::runtime::value::{Value, ValueKind};

/// Block magic ("TLCX").
pub const BLOCK_MAGIC: u32 = 0x5843_4C54;

/// Size of the block header.
pub const BLOCK_HEADER: usize = 8;

/// Writes a value graph into a byte buffer in one pre-order pass.
pub struct Flattener<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Flattener<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            pos: BLOCK_HEADER,
        }
    }

    /// Flatten `value` and return the block length.
    pub fn flatten(
        mut self,
        value: &Value,
    ) -> Result<usize, MemoryError> {
        if self.buf.len() < BLOCK_HEADER {
            return Err(self.too_large(BLOCK_HEADER));
        }
        let root = self.write_node(value)?;
        self.buf[0..4].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
        self.buf[4..8].copy_from_slice(&root.to_le_bytes());
        Ok(self.pos)
    }

    fn too_large(
        &self,
        needed: usize,
    ) -> MemoryError {
        MemoryError::TooLarge {
            size: needed,
            slot_size: self.buf.len() as u32,
        }
    }

    /// Reserve `len` bytes and return their start.
    fn reserve(
        &mut self,
        len: usize,
    ) -> Result<usize, MemoryError> {
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.buf.len() && end <= u32::MAX as usize)
            .ok_or_else(|| self.too_large(start.saturating_add(len)))?;
        self.pos = end;
        Ok(start)
    }

    fn put(
        &mut self,
        bytes: &[u8],
    ) -> Result<(), MemoryError> {
        let at = self.reserve(bytes.len())?;
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn patch_u32(
        &mut self,
        at: usize,
        val: u32,
    ) {
        self.buf[at..at + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn write_len(
        &mut self,
        len: usize,
    ) -> Result<(), MemoryError> {
        let len = u32::try_from(len).map_err(|_| self.too_large(len))?;
        self.put(&len.to_le_bytes())
    }

    fn write_node(
        &mut self,
        value: &Value,
    ) -> Result<u32, MemoryError> {
        let offset = self.pos as u32;
        self.put(&[value.kind().as_u8()])?;
        match value {
            Value::Null => {}
            Value::Bool(b) => self.put(&[u8::from(*b)])?,
            Value::Int(i) => self.put(&i.to_le_bytes())?,
            Value::Float(f) => self.put(&f.to_le_bytes())?,
            Value::Str(s) => {
                self.write_len(s.len())?;
                self.put(s.as_bytes())?;
            }
            Value::Bytes(b) => {
                self.write_len(b.len())?;
                self.put(b)?;
            }
            Value::Array(items) => {
                self.write_len(items.len())?;
                let table = self.reserve(items.len() * 4)?;
                for (i, item) in items.iter().enumerate() {
                    let child = self.write_node(item)?;
                    self.patch_u32(table + i * 4, child);
                }
            }
            Value::Map(entries) => {
                self.write_len(entries.len())?;
                let table = self.reserve(entries.len() * 8)?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    let key_off = self.write_str_node(key)?;
                    let val_off = self.write_node(item)?;
                    self.patch_u32(table + i * 8, key_off);
                    self.patch_u32(table + i * 8 + 4, val_off);
                }
            }
        }
        Ok(offset)
    }

    fn write_str_node(
        &mut self,
        s: &str,
    ) -> Result<u32, MemoryError> {
        let offset = self.pos as u32;
        self.put(&[ValueKind::Str.as_u8()])?;
        self.write_len(s.len())?;
        self.put(s.as_bytes())?;
        Ok(offset)
    }
}

/// Flatten `value` into `buf`, returning the number of bytes used.
pub fn flatten_into(
    value: &Value,
    buf: &mut [u8],
) -> Result<usize, MemoryError> {
    Flattener::new(buf).flatten(value)
}

/// Flatten `value` into a fresh buffer (used by tests and benches).
pub fn flatten_to_vec(value: &Value) -> Result<Vec<u8>, MemoryError> {
    let mut buf = vec![0u8; encoded_len(value)];
    let len = flatten_into(value, &mut buf)?;
    buf.truncate(len);
    Ok(buf)
}

/// Exact number of bytes a value occupies once flattened.
pub fn encoded_len(value: &Value) -> usize {
    BLOCK_HEADER + node_len(value)
}

fn node_len(value: &Value) -> usize {
    1 + match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 8,
        Value::Str(s) => 4 + s.len(),
        Value::Bytes(b) => 4 + b.len(),
        Value::Array(items) => 4 + items.iter().map(|v| 4 + node_len(v)).sum::<usize>(),
        Value::Map(entries) => {
            4 + entries
                .iter()
                .map(|(k, v)| 8 + 1 + 4 + k.len() + node_len(v))
                .sum::<usize>()
        }
    }
}
