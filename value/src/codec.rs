//! Arena codec with pointer relocation
//!
//! The destination memory space of an emitted value usually is not the
//! buffer the kernel writes into: a payload handed to a sandboxed module
//! lands at some offset of its linear memory. `base` is the address the
//! first envelope byte will have in that space; every inner pointer is
//! written as `base + relative_position`, so the recipient dereferences
//! without translation. Parsing inverts the mapping and refuses any
//! pointer that escapes the arena.

use abi::bytes::align8;
use abi::{AbiPair, AbiString, AbiValue, ByteReader, ValueTag, ABI_PAIR_SIZE, ABI_VALUE_SIZE};
use core_types::{BlobId, MAX_RECURSION};

use crate::{BlobRefValue, Value, ValueError};

/// Parses a value from `arena`, whose first byte sits at address `base`
/// in the source memory space.
pub fn parse_value(arena: &[u8], base: u64) -> Result<Value, ValueError> {
    decode_at(arena, base, 0, 0)
}

/// Emits `value` into `out`, relocating inner pointers for a destination
/// space where `out`'s first appended byte will live at address `base`.
/// Returns the number of bytes appended.
pub fn emit_value(value: &Value, base: u64, out: &mut Vec<u8>) -> Result<usize, ValueError> {
    let start = out.len();
    out.resize(start + ABI_VALUE_SIZE, 0);
    let root = write_node(value, 0, base, start, out)?;
    patch_value(out, start, &root);
    Ok(out.len() - start)
}

/// Re-bases a self-contained payload from `old_base` to `new_base`.
pub fn relocate_payload(payload: &[u8], old_base: u64, new_base: u64) -> Result<Vec<u8>, ValueError> {
    let value = parse_value(payload, old_base)?;
    let mut out = Vec::with_capacity(payload.len());
    emit_value(&value, new_base, &mut out)?;
    Ok(out)
}

fn slice_at(arena: &[u8], base: u64, offset: u64, len: u64) -> Result<&[u8], ValueError> {
    let oob = ValueError::OutOfBounds { offset, len, arena: arena.len() as u64 };
    let rel = offset.checked_sub(base).ok_or_else(|| oob.clone())?;
    let end = rel.checked_add(len).ok_or_else(|| oob.clone())?;
    if end > arena.len() as u64 {
        return Err(oob);
    }
    Ok(&arena[rel as usize..end as usize])
}

fn read_envelope(bytes: &[u8]) -> Result<AbiValue, ValueError> {
    let mut r = ByteReader::new(bytes);
    AbiValue::decode(&mut r).map_err(|_| ValueError::Truncated(bytes.len() as u64))
}

fn payload_u64_pair(payload: &[u8; 16]) -> (u64, u64) {
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    a.copy_from_slice(&payload[..8]);
    b.copy_from_slice(&payload[8..]);
    (u64::from_le_bytes(a), u64::from_le_bytes(b))
}

fn decode_at(arena: &[u8], base: u64, pos: usize, depth: usize) -> Result<Value, ValueError> {
    if depth > MAX_RECURSION {
        return Err(ValueError::DepthExceeded(MAX_RECURSION));
    }
    if pos + ABI_VALUE_SIZE > arena.len() {
        return Err(ValueError::Truncated(pos as u64));
    }
    let envelope = read_envelope(&arena[pos..pos + ABI_VALUE_SIZE])?;
    let tag = ValueTag::from_u32(envelope.tag).map_err(|_| ValueError::InvalidTag(envelope.tag))?;

    match tag {
        ValueTag::Unit => Ok(Value::Unit),
        ValueTag::Bool => match envelope.payload[0] {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(ValueError::InvalidBool(other)),
        },
        ValueTag::I64 => {
            let (raw, _) = payload_u64_pair(&envelope.payload);
            Ok(Value::I64(raw as i64))
        }
        ValueTag::U64 => {
            let (raw, _) = payload_u64_pair(&envelope.payload);
            Ok(Value::U64(raw))
        }
        ValueTag::F64 => {
            let (raw, _) = payload_u64_pair(&envelope.payload);
            Ok(Value::F64(f64::from_bits(raw)))
        }
        ValueTag::String => {
            let (offset, len) = payload_u64_pair(&envelope.payload);
            let bytes = slice_at(arena, base, offset, len)?;
            let text = std::str::from_utf8(bytes).map_err(|_| ValueError::InvalidUtf8)?;
            Ok(Value::String(text.to_string()))
        }
        ValueTag::Bytes => {
            let (offset, len) = payload_u64_pair(&envelope.payload);
            Ok(Value::Bytes(slice_at(arena, base, offset, len)?.to_vec()))
        }
        ValueTag::BlobRef => {
            let (id, size) = payload_u64_pair(&envelope.payload);
            Ok(Value::BlobRef(BlobRefValue { id: BlobId::from_raw(id), size }))
        }
        ValueTag::List => {
            let (offset, count) = payload_u64_pair(&envelope.payload);
            let total = count
                .checked_mul(ABI_VALUE_SIZE as u64)
                .ok_or(ValueError::OutOfBounds { offset, len: count, arena: arena.len() as u64 })?;
            slice_at(arena, base, offset, total)?;
            let region = (offset - base) as usize;
            let mut items = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                items.push(decode_at(arena, base, region + i * ABI_VALUE_SIZE, depth + 1)?);
            }
            Ok(Value::List(items))
        }
        ValueTag::Map => {
            let (offset, count) = payload_u64_pair(&envelope.payload);
            let total = count
                .checked_mul(ABI_PAIR_SIZE as u64)
                .ok_or(ValueError::OutOfBounds { offset, len: count, arena: arena.len() as u64 })?;
            slice_at(arena, base, offset, total)?;
            let region = (offset - base) as usize;
            let mut pairs = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                let pair_pos = region + i * ABI_PAIR_SIZE;
                let pair_bytes = &arena[pair_pos..pair_pos + ABI_PAIR_SIZE];
                let mut r = ByteReader::new(pair_bytes);
                let pair = AbiPair::decode(&mut r)
                    .map_err(|_| ValueError::Truncated(pair_pos as u64))?;
                let key_bytes = slice_at(arena, base, pair.key.offset, pair.key.len)?;
                let key = std::str::from_utf8(key_bytes)
                    .map_err(|_| ValueError::InvalidUtf8)?
                    .to_string();
                let value = decode_at(arena, base, pair_pos + 16, depth + 1)?;
                pairs.push((key, value));
            }
            Ok(Value::Map(pairs))
        }
    }
}

fn patch_value(out: &mut [u8], pos: usize, envelope: &AbiValue) {
    let mut buf = Vec::with_capacity(ABI_VALUE_SIZE);
    envelope.encode(&mut buf);
    out[pos..pos + ABI_VALUE_SIZE].copy_from_slice(&buf);
}

fn scalar_payload(a: u64, b: u64) -> [u8; 16] {
    let mut payload = [0u8; 16];
    payload[..8].copy_from_slice(&a.to_le_bytes());
    payload[8..].copy_from_slice(&b.to_le_bytes());
    payload
}

fn align_out(out: &mut Vec<u8>, start: usize) {
    let rel = out.len() - start;
    let pad = align8(rel) - rel;
    out.resize(out.len() + pad, 0);
}

fn write_node(
    value: &Value,
    depth: usize,
    base: u64,
    start: usize,
    out: &mut Vec<u8>,
) -> Result<AbiValue, ValueError> {
    if depth > MAX_RECURSION {
        return Err(ValueError::DepthExceeded(MAX_RECURSION));
    }
    let tag = value.tag().as_u32();
    let envelope = match value {
        Value::Unit => AbiValue { tag, flags: 0, payload: [0; 16] },
        Value::Bool(b) => {
            let mut payload = [0u8; 16];
            payload[0] = u8::from(*b);
            AbiValue { tag, flags: 0, payload }
        }
        Value::I64(v) => AbiValue { tag, flags: 0, payload: scalar_payload(*v as u64, 0) },
        Value::U64(v) => AbiValue { tag, flags: 0, payload: scalar_payload(*v, 0) },
        Value::F64(v) => AbiValue { tag, flags: 0, payload: scalar_payload(v.to_bits(), 0) },
        Value::BlobRef(blob) => {
            AbiValue { tag, flags: 0, payload: scalar_payload(blob.id.as_u64(), blob.size) }
        }
        Value::String(text) => {
            let pos = out.len() - start;
            out.extend_from_slice(text.as_bytes());
            AbiValue {
                tag,
                flags: 0,
                payload: scalar_payload(base + pos as u64, text.len() as u64),
            }
        }
        Value::Bytes(bytes) => {
            let pos = out.len() - start;
            out.extend_from_slice(bytes);
            AbiValue { tag, flags: 0, payload: scalar_payload(base + pos as u64, bytes.len() as u64) }
        }
        Value::List(items) => {
            align_out(out, start);
            let region = out.len();
            out.resize(region + items.len() * ABI_VALUE_SIZE, 0);
            for (i, item) in items.iter().enumerate() {
                let child = write_node(item, depth + 1, base, start, out)?;
                patch_value(out, region + i * ABI_VALUE_SIZE, &child);
            }
            AbiValue {
                tag,
                flags: 0,
                payload: scalar_payload(base + (region - start) as u64, items.len() as u64),
            }
        }
        Value::Map(pairs) => {
            align_out(out, start);
            let region = out.len();
            out.resize(region + pairs.len() * ABI_PAIR_SIZE, 0);
            for (i, (key, item)) in pairs.iter().enumerate() {
                let key_pos = out.len() - start;
                out.extend_from_slice(key.as_bytes());
                let key_view =
                    AbiString { offset: base + key_pos as u64, len: key.len() as u64 };
                let child = write_node(item, depth + 1, base, start, out)?;

                let pair_pos = region + i * ABI_PAIR_SIZE;
                let mut pair_buf = Vec::with_capacity(ABI_PAIR_SIZE);
                AbiPair { key: key_view, value: child }.encode(&mut pair_buf);
                out[pair_pos..pair_pos + ABI_PAIR_SIZE].copy_from_slice(&pair_buf);
            }
            AbiValue {
                tag,
                flags: 0,
                payload: scalar_payload(base + (region - start) as u64, pairs.len() as u64),
            }
        }
    };
    Ok(envelope)
}
