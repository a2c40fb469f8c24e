// Shared helpers for assembling wasm test modules.
//
// Most sections go through wasm-encoder; the global and element sections
// are hand-encoded (via RawSection) so the tests also exercise the lazy
// section decoding paths with exact control over the bytes.

#![allow(dead_code)]

pub fn leb_u32(mut value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn leb_i32(value: i32) -> Vec<u8> {
    let mut value = value as i64;
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn name_bytes(name: &str) -> Vec<u8> {
    let mut out = leb_u32(name.len() as u32);
    out.extend_from_slice(name.as_bytes());
    out
}

/// `i32.const <value>` followed by `end`.
pub fn i32_const_expr(value: i32) -> Vec<u8> {
    let mut out = vec![0x41];
    out.extend_from_slice(&leb_i32(value));
    out.push(0x0B);
    out
}

/// `global.get <id>` followed by `end`.
pub fn global_get_expr(id: u32) -> Vec<u8> {
    let mut out = vec![0x23];
    out.extend_from_slice(&leb_u32(id));
    out.push(0x0B);
    out
}

/// Global section payload: `(value type tag, mutable, init expr)` per
/// global. The init expr must include its own `end`.
pub fn global_section(globals: &[(u8, bool, Vec<u8>)]) -> Vec<u8> {
    let mut out = leb_u32(globals.len() as u32);
    for (ty, mutable, init) in globals {
        out.push(*ty);
        out.push(u8::from(*mutable));
        out.extend_from_slice(init);
    }
    out
}

/// Element section payload with one active segment for table 0.
pub fn element_section(offset: i32, function_ids: &[u32]) -> Vec<u8> {
    let mut out = leb_u32(1);
    out.extend_from_slice(&leb_u32(0)); // table index
    out.extend_from_slice(&i32_const_expr(offset));
    out.extend_from_slice(&leb_u32(function_ids.len() as u32));
    for &id in function_ids {
        out.extend_from_slice(&leb_u32(id));
    }
    out
}

/// Import section payload with one global import (hand-encoded).
pub fn global_import_section(module: &str, name: &str, ty: u8, mutable: bool) -> Vec<u8> {
    let mut out = leb_u32(1);
    out.extend_from_slice(&name_bytes(module));
    out.extend_from_slice(&name_bytes(name));
    out.push(0x03);
    out.push(ty);
    out.push(u8::from(mutable));
    out
}
