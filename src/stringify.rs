//! Provides a stable stringifier used to derive canonical cache keys.
//!
//! Two logically equal keys have to collapse to the same storage key, no matter how their fields
//! were ordered when they were built. Therefore we serialize keys into a canonical JSON form in
//! which all object keys are emitted in sorted order. Arrays keep their positional order, as
//! `[1, 2]` and `[2, 1]` are genuinely different keys.
//!
//! Strings are used verbatim (without quoting) when they are the whole key, so that a cache keyed
//! by plain strings produces human readable storage keys. A cache without any key type (a
//! singleton cache) uses the fixed sentinel [UNKEYED].
use serde::Serialize;
use serde_json::Value;

use crate::error::{CacheError, CacheResult};

/// Contains the canonical key used by caches which have no key type.
///
/// This is a fixed literal which cannot collide with any stringified key, as those are either
/// used verbatim (strings, which would be the string itself) or rendered as JSON (which always
/// starts with a digit, quote, bracket, brace or one of `true`/`false`/`null`).
pub const UNKEYED: &str = "undefined";

/// Computes the canonical storage key for the given cache key.
///
/// Strings are passed through verbatim. The unit key `()` (and `None`) map to [UNKEYED]. All
/// other values are stringified via [stringify].
///
/// # Examples
/// ```
/// # use recache::stringify::canonical_key;
/// assert_eq!(canonical_key(&"user/42").unwrap(), "user/42");
/// assert_eq!(canonical_key(&()).unwrap(), "undefined");
/// assert_eq!(canonical_key(&(7, "en")).unwrap(), "[7,\"en\"]");
/// ```
pub fn canonical_key<K: Serialize>(key: &K) -> CacheResult<String> {
    let value = serde_json::to_value(key)
        .map_err(|error| CacheError::from(anyhow::Error::new(error).context("invalid cache key")))?;

    match value {
        Value::String(string) => Ok(string),
        Value::Null => Ok(UNKEYED.to_owned()),
        other => Ok(render(&other)),
    }
}

/// Serializes the given value into a canonical JSON string with sorted object keys.
///
/// Two values which only differ in the order of their object keys stringify to the identical
/// result. This makes the output suitable as a lookup key.
///
/// # Examples
/// ```
/// # use recache::stringify::stringify;
/// # use serde::Serialize;
/// #[derive(Serialize)]
/// struct Reversed {
///     b: i32,
///     a: i32,
/// }
///
/// assert_eq!(stringify(&Reversed { b: 2, a: 1 }).unwrap(), r#"{"a":1,"b":2}"#);
/// ```
pub fn stringify<T: Serialize>(value: &T) -> CacheResult<String> {
    let value = serde_json::to_value(value)
        .map_err(|error| CacheError::from(anyhow::Error::new(error).context("unstringifiable value")))?;

    Ok(render(&value))
}

/// Renders a JSON value tree into its canonical string form.
///
/// Note that a [Value] is always a tree. Reference cycles cannot occur here, as serde's data
/// model has no object identity and `serde_json::to_value` enforces a recursion limit long
/// before a self-referential `Serialize` implementation could exhaust the stack.
fn render(value: &Value) -> String {
    let mut out = String::new();
    render_into(&mut out, value);
    out
}

fn render_into(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(string) => render_string(out, string),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                render_into(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Note that we sort the keys ourselves instead of relying on the map implementation
            // within serde_json. Its ordering is controlled by a feature flag which any crate in
            // the dependency graph could toggle - our keys have to stay canonical either way.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                render_string(out, key);
                out.push(':');
                render_into(out, &map[key]);
            }
            out.push('}');
        }
    }
}

/// Appends a string as a quoted and escaped JSON literal.
fn render_string(out: &mut String, string: &str) {
    // serde_json performs the escaping for us - a plain string cannot fail to serialize.
    match serde_json::to_string(string) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}
