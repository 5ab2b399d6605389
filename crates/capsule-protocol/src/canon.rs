//! Canonical JSON serialization and hashing.
//!
//! Every hash recorded by the audit store is SHA-256 over the canonical
//! JSON form of a value: UTF-8, object keys sorted ascending by byte
//! order, arrays in order, no insignificant whitespace, `null` permitted,
//! numbers in serde_json's shortest round-trip form. The serializer is
//! defined here, byte for byte, rather than relying on whatever a library
//! happens to emit — replay fidelity depends on it.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value to its canonical byte-deterministic form.
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Lowercase-hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a JSON value: SHA-256 over its canonical serialization.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(to_canonical_json(value).as_bytes())
}

/// Hash any serializable value through its JSON representation.
pub fn hash_serializable<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_value(value)?;
    Ok(hash_value(&json))
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders integers via itoa and floats via ryu, both of
        // which produce the shortest round-trip form.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

fn write_escaped(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_keys_are_sorted() {
        let value = json!({"zebra": 1, "apple": 2, "mango": {"b": 1, "a": 2}});
        assert_eq!(
            to_canonical_json(&value),
            r#"{"apple":2,"mango":{"a":2,"b":1},"zebra":1}"#
        );
    }

    #[test]
    fn arrays_preserve_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(to_canonical_json(&value), "[3,1,2]");
    }

    #[test]
    fn no_insignificant_whitespace() {
        let value = json!({"a": [1, {"b": null}]});
        assert_eq!(to_canonical_json(&value), r#"{"a":[1,{"b":null}]}"#);
    }

    #[test]
    fn numbers_are_shortest_roundtrip() {
        assert_eq!(to_canonical_json(&json!(1.0)), "1.0");
        assert_eq!(to_canonical_json(&json!(0.1)), "0.1");
        assert_eq!(to_canonical_json(&json!(u64::MAX)), "18446744073709551615");
        assert_eq!(to_canonical_json(&json!(-42)), "-42");
    }

    #[test]
    fn strings_are_escaped() {
        let value = json!("line\none\t\"quoted\" \\ \u{0001}");
        assert_eq!(
            to_canonical_json(&value),
            r#""line\none\t\"quoted\" \\ \u0001""#
        );
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = json!({"x": 1, "y": [true, null]});
        let b = json!({"y": [true, null], "x": 1});
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        let digest = hash_value(&json!(null));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        // SHA-256 of the four bytes "null".
        assert_eq!(
            digest,
            "74234e98afe7498fb5daf1f36ac2d78acc339464f950703b8c019892f982b90b"
        );
    }
}
