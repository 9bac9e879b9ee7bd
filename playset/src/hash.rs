//! The default structural hash used when a playset does not supply its own.
//!
//! Walks a [`serde_json::Value`] the same way on the server as a compliant client
//! must walk it: the two have to agree bit-for-bit or hash-sync (§4.G, §6.5) is
//! meaningless. Every constant below is part of the wire contract, not an
//! implementation detail — do not "simplify" them.

use serde_json::Value;

const MODULUS: i64 = 2_147_483_647;

const HASH_NULL: i64 = 100;
const HASH_UNDEFINED: i64 = 101;
const HASH_TRUE: i64 = 102;
const HASH_FALSE: i64 = 103;
const PREFIX_ARRAY: i64 = 105;
const PREFIX_NUMBER: i64 = 106;
const PREFIX_STRING: i64 = 107;
const PREFIX_OBJECT: i64 = 108;
// Prefix 109 ("other") has no reachable case: serde_json::Value is exhaustive
// over null/bool/number/string/array/object.
const SUFFIX_CONTAINER: i64 = 200;
const SUFFIX_STRING: i64 = 300;

/// `combine(a, b) = (a*65537 + b*8191 + 127) mod 2147483647`.
fn combine(a: i64, b: i64) -> i64 {
    let a = a.rem_euclid(MODULUS);
    let b = b.rem_euclid(MODULUS);
    (a.wrapping_mul(65537).wrapping_add(b.wrapping_mul(8191)) + 127).rem_euclid(MODULUS)
}

/// Folds from `PREFIX_STRING`, same pattern as arrays/objects below, so a
/// string hashes identically whether it's a standalone value or an object key.
fn hash_string(s: &str) -> i64 {
    let folded = s.chars().fold(PREFIX_STRING, |acc, c| combine(acc, c as i64));
    combine(folded, SUFFIX_STRING)
}

fn hash_number(n: &serde_json::Number) -> i64 {
    // Negative zero is coerced to zero per spec.
    let value = n.as_f64().unwrap_or(0.0);
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits() as i64;
    combine(PREFIX_NUMBER, bits)
}

/// Computes the structural hash of a JSON value per §6.5.
pub fn structural_hash(value: &Value) -> i64 {
    match value {
        Value::Null => HASH_NULL,
        Value::Bool(true) => HASH_TRUE,
        Value::Bool(false) => HASH_FALSE,
        Value::Number(n) => hash_number(n),
        Value::String(s) => hash_string(s),
        Value::Array(items) => {
            let body = items
                .iter()
                .fold(PREFIX_ARRAY, |acc, item| combine(acc, structural_hash(item)));
            combine(body, SUFFIX_CONTAINER)
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys.iter().fold(PREFIX_OBJECT, |acc, key| {
                let key_hash = hash_string(key);
                let value_hash = structural_hash(&map[*key]);
                combine(acc, combine(key_hash, value_hash))
            });
            combine(body, SUFFIX_CONTAINER)
        }
    }
}

/// Hash of an absent/undefined value — exposed for playsets that track optional fields.
pub fn hash_undefined() -> i64 {
    HASH_UNDEFINED
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_match_fixed_constants() {
        assert_eq!(structural_hash(&Value::Null), HASH_NULL);
        assert_eq!(structural_hash(&json!(true)), HASH_TRUE);
        assert_eq!(structural_hash(&json!(false)), HASH_FALSE);
    }

    #[test]
    fn negative_zero_equals_zero() {
        assert_eq!(structural_hash(&json!(-0.0)), structural_hash(&json!(0.0)));
    }

    #[test]
    fn object_key_order_is_irrelevant() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn distinct_values_hash_differently() {
        assert_ne!(structural_hash(&json!({"dots": []})), structural_hash(&json!({"dots": [1]})));
        assert_ne!(structural_hash(&json!("a")), structural_hash(&json!("b")));
    }

    #[test]
    fn is_stable_across_calls() {
        let v = json!({"dots": [1, 2, 3], "owner": "alice"});
        assert_eq!(structural_hash(&v), structural_hash(&v));
    }
}
