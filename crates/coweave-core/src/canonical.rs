//! Canonical CBOR encoding for deterministic hashing.
//!
//! Headers and transactions are hashed over this encoding, so it must produce
//! identical bytes across platforms and across map insertion orders:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - JSON floats are encoded as their shortest decimal text
//!
//! Encoding never fails. Values that have no canonical form are mapped onto
//! one (floats become text, tags are transparent).

use ciborium::value::Value;
use serde_json::Value as JsonValue;

use crate::header::{CoValueHeader, Ruleset};
use crate::transaction::Transaction;

/// Encode a transaction to canonical CBOR bytes.
pub fn canonical_transaction_bytes(tx: &Transaction) -> Vec<u8> {
    encode_cbor_value_canonical(&transaction_to_cbor_value(tx))
}

/// Encode a CoValue header to canonical CBOR bytes.
pub fn canonical_header_bytes(header: &CoValueHeader) -> Vec<u8> {
    encode_cbor_value_canonical(&header_to_cbor_value(header))
}

/// Encode an arbitrary JSON value to canonical CBOR bytes.
pub fn canonical_json_bytes(value: &JsonValue) -> Vec<u8> {
    encode_cbor_value_canonical(&json_to_cbor_value(value))
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn transaction_to_cbor_value(tx: &Transaction) -> Value {
    match tx {
        Transaction::Trusting { made_at, changes } => Value::Map(vec![
            (text("privacy"), text("trusting")),
            (text("madeAt"), Value::Integer((*made_at).into())),
            (text("changes"), Value::Text(changes.clone())),
        ]),
        Transaction::Private {
            made_at,
            key_used,
            encrypted_changes,
        } => Value::Map(vec![
            (text("privacy"), text("private")),
            (text("madeAt"), Value::Integer((*made_at).into())),
            (text("keyUsed"), Value::Text(key_used.to_string())),
            (text("encryptedChanges"), Value::Bytes(encrypted_changes.to_vec())),
        ]),
    }
}

fn ruleset_to_cbor_value(ruleset: &Ruleset) -> Value {
    match ruleset {
        Ruleset::UnsafeAllowAll => Value::Map(vec![(text("type"), text("unsafeAllowAll"))]),
        Ruleset::Group { initial_admin } => Value::Map(vec![
            (text("type"), text("group")),
            (text("initialAdmin"), Value::Text(initial_admin.to_string())),
        ]),
        Ruleset::OwnedByGroup { group } => Value::Map(vec![
            (text("type"), text("ownedByGroup")),
            (text("group"), Value::Text(group.to_string())),
        ]),
    }
}

fn header_to_cbor_value(header: &CoValueHeader) -> Value {
    let meta = header
        .meta
        .as_ref()
        .map(json_to_cbor_value)
        .unwrap_or(Value::Null);
    let created_at = header
        .created_at
        .map(|t| Value::Integer(t.into()))
        .unwrap_or(Value::Null);

    Value::Map(vec![
        (text("type"), text(header.co_type.as_str())),
        (text("ruleset"), ruleset_to_cbor_value(&header.ruleset)),
        (text("meta"), meta),
        (text("uniqueness"), json_to_cbor_value(&header.uniqueness)),
        (text("createdAt"), created_at),
    ])
}

/// Convert a JSON value into a CBOR value with a canonical number form.
fn json_to_cbor_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::Integer(u.into())
            } else if let Some(i) = n.as_i64() {
                Value::Integer(i.into())
            } else {
                Value::Text(n.to_string())
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        JsonValue::Array(items) => Value::Array(items.iter().map(json_to_cbor_value).collect()),
        JsonValue::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::Text(k.clone()), json_to_cbor_value(v)))
                .collect(),
        ),
    }
}

fn encode_cbor_value_canonical(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => encode_array(buf, arr),
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(f) => encode_text(buf, &f.to_string()),
        Value::Tag(_, inner) => encode_value_to(buf, inner),
        _ => buf.push(0xf7),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // -1 encodes as 0, -2 as 1, and so on
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_array(buf: &mut Vec<u8>, arr: &[Value]) {
    encode_uint(buf, 4, arr.len() as u64);
    for item in arr {
        encode_value_to(buf, item);
    }
}

/// Encode a map with keys sorted by their encoded bytes.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| {
            let mut key_buf = Vec::new();
            encode_value_to(&mut key_buf, k);
            (key_buf, v)
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyID;
    use serde_json::json;

    #[test]
    fn test_integer_encoding() {
        let mut buf = Vec::new();
        encode_uint(&mut buf, 0, 23);
        assert_eq!(buf, vec![0x17]);

        buf.clear();
        encode_uint(&mut buf, 0, 24);
        assert_eq!(buf, vec![0x18, 24]);

        buf.clear();
        encode_uint(&mut buf, 0, 65535);
        assert_eq!(buf, vec![0x19, 0xff, 0xff]);

        buf.clear();
        encode_integer(&mut buf, (-1i64).into());
        assert_eq!(buf, vec![0x20]);
    }

    #[test]
    fn test_map_key_order_independent() {
        let a: JsonValue = serde_json::from_str(r#"{"z":1,"a":[true,null],"m":"x"}"#).unwrap();
        let b: JsonValue = serde_json::from_str(r#"{"m":"x","z":1,"a":[true,null]}"#).unwrap();
        assert_eq!(canonical_json_bytes(&a), canonical_json_bytes(&b));
    }

    #[test]
    fn test_short_keys_sort_first() {
        // Encoded length prefix makes shorter text keys sort first.
        let bytes = canonical_json_bytes(&json!({"bb": 1, "a": 2}));
        assert_eq!(bytes[0], 0xa2);
        assert_eq!(&bytes[1..3], &[0x61, b'a']);
    }

    #[test]
    fn test_floats_do_not_panic() {
        let bytes = canonical_json_bytes(&json!({"x": 1.5}));
        let mut expected = Vec::new();
        encode_text(&mut expected, "1.5");
        assert!(bytes.ends_with(&expected));
    }

    #[test]
    fn test_transaction_encoding_differs_by_payload() {
        let a = canonical_transaction_bytes(&Transaction::trusting(1, "[1]"));
        let b = canonical_transaction_bytes(&Transaction::trusting(1, "[2]"));
        let c = canonical_transaction_bytes(&Transaction::private(1, KeyID([1; 16]), vec![1]));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
