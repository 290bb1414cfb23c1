//! Copy/insert delta codec.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! target_len:u64 | op*
//! op = 0x00 COPY   offset:u64 len:u32     copy from source
//!    | 0x01 INSERT len:u32 bytes[len]     literal data
//! ```
//!
//! `create` indexes the source in fixed blocks by xxh3 and greedily extends
//! every match in both directions.

use crate::error::{Result, SyncError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use xxhash_rust::xxh3::xxh3_64;

/// Block size used to index the source
pub const BLOCK_SIZE: usize = 16;

/// Largest single copy or insert op accepted by `apply` (16MB)
const MAX_OP_SIZE: usize = 16 * 1024 * 1024;

const OP_COPY: u8 = 0x00;
const OP_INSERT: u8 = 0x01;

/// Encode `target` as a delta against `source`.
pub fn create(source: &[u8], target: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(16 + target.len() / 4);
    out.put_u64(target.len() as u64);

    let mut index: HashMap<u64, usize> = HashMap::new();
    if source.len() >= BLOCK_SIZE {
        for offset in (0..=source.len() - BLOCK_SIZE).step_by(BLOCK_SIZE) {
            index
                .entry(xxh3_64(&source[offset..offset + BLOCK_SIZE]))
                .or_insert(offset);
        }
    }

    let mut literal_start = 0usize;
    let mut i = 0usize;
    while !index.is_empty() && i + BLOCK_SIZE <= target.len() {
        let window = &target[i..i + BLOCK_SIZE];
        let candidate = index
            .get(&xxh3_64(window))
            .copied()
            .filter(|&off| &source[off..off + BLOCK_SIZE] == window);

        let Some(mut src_off) = candidate else {
            i += 1;
            continue;
        };

        let mut len = BLOCK_SIZE;
        while src_off + len < source.len()
            && i + len < target.len()
            && source[src_off + len] == target[i + len]
        {
            len += 1;
        }
        // Pull the match back over bytes that were headed for the literal
        while i > literal_start && src_off > 0 && source[src_off - 1] == target[i - 1] {
            i -= 1;
            src_off -= 1;
            len += 1;
        }

        put_insert(&mut out, &target[literal_start..i]);
        put_copy(&mut out, src_off as u64, len);
        i += len;
        literal_start = i;
    }
    put_insert(&mut out, &target[literal_start..]);

    out.freeze()
}

fn put_insert(out: &mut BytesMut, mut literal: &[u8]) {
    while !literal.is_empty() {
        let n = literal.len().min(MAX_OP_SIZE);
        out.put_u8(OP_INSERT);
        out.put_u32(n as u32);
        out.put_slice(&literal[..n]);
        literal = &literal[n..];
    }
}

fn put_copy(out: &mut BytesMut, mut offset: u64, mut len: usize) {
    while len > 0 {
        let n = len.min(MAX_OP_SIZE);
        out.put_u8(OP_COPY);
        out.put_u64(offset);
        out.put_u32(n as u32);
        offset += n as u64;
        len -= n;
    }
}

/// Reconstruct the target from `source` and an encoded `delta`.
pub fn apply(source: &[u8], delta: &[u8]) -> Result<Bytes> {
    let mut reader = delta;
    if reader.remaining() < 8 {
        return Err(SyncError::Delta("delta header truncated".to_string()));
    }
    let target_len = reader.get_u64() as usize;
    let mut out = BytesMut::with_capacity(target_len.min(MAX_OP_SIZE));

    while reader.has_remaining() {
        let op_type = reader.get_u8();
        match op_type {
            OP_COPY => {
                if reader.remaining() < 12 {
                    return Err(SyncError::Delta("copy op truncated".to_string()));
                }
                let offset = reader.get_u64() as usize;
                let size = reader.get_u32() as usize;

                if size > MAX_OP_SIZE {
                    return Err(SyncError::Delta(format!(
                        "copy size {} exceeds max {}",
                        size, MAX_OP_SIZE
                    )));
                }
                let end = offset
                    .checked_add(size)
                    .filter(|&end| end <= source.len())
                    .ok_or_else(|| {
                        SyncError::Delta(format!(
                            "copy range {}+{} exceeds source size {}",
                            offset,
                            size,
                            source.len()
                        ))
                    })?;
                out.put_slice(&source[offset..end]);
            }
            OP_INSERT => {
                if reader.remaining() < 4 {
                    return Err(SyncError::Delta("insert op truncated".to_string()));
                }
                let len = reader.get_u32() as usize;
                if len > MAX_OP_SIZE || reader.remaining() < len {
                    return Err(SyncError::Delta("insert data truncated".to_string()));
                }
                out.put_slice(&reader[..len]);
                reader.advance(len);
            }
            other => {
                return Err(SyncError::Delta(format!("unknown op type: {}", other)));
            }
        }
        if out.len() > target_len {
            return Err(SyncError::Delta("output exceeds declared length".to_string()));
        }
    }

    if out.len() != target_len {
        return Err(SyncError::Delta(format!(
            "output length {} does not match declared {}",
            out.len(),
            target_len
        )));
    }
    Ok(out.freeze())
}
