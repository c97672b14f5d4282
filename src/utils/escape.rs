//! JSON string sanitising.
//!
//! Metadata lands in `jsonb` columns and search documents, neither of which
//! accepts the NUL family of control characters. Code points `U+0000` to
//! `U+0004` are removed from every string before it is re-encoded; all other
//! characters are kept as they are.

use serde_json::Value;
use std::borrow::Cow;

fn is_stripped(c: char) -> bool {
    ('\u{0000}'..='\u{0004}').contains(&c)
}

/// Removes `U+0000`..=`U+0004` from `s`, borrowing when nothing changes.
#[must_use]
pub fn strip_control(s: &str) -> Cow<'_, str> {
    if s.chars().any(is_stripped) {
        Cow::Owned(s.chars().filter(|c| !is_stripped(*c)).collect())
    } else {
        Cow::Borrowed(s)
    }
}

/// Encodes `s` as a JSON string literal after stripping control code points.
#[must_use]
pub fn escape_string(s: &str) -> String {
    Value::String(strip_control(s).into_owned()).to_string()
}

/// Recursively strips control code points from every string and object key.
pub fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Cow::Owned(clean) = strip_control(s) {
                *s = clean;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize_value),
        Value::Object(map) => {
            let dirty = map.keys().any(|k| k.chars().any(is_stripped));
            if dirty {
                let entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
                for (key, mut item) in entries {
                    sanitize_value(&mut item);
                    map.insert(strip_control(&key).into_owned(), item);
                }
            } else {
                map.values_mut().for_each(sanitize_value);
            }
        }
        _ => {}
    }
}
