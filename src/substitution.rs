//! Deferred environment-variable substitution performed by the client just
//! before a request reaches the private target.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use serde_json::Value;
use tracing::warn;

/// Body field listing the JSON paths whose string values need substitution.
pub const BODY_MARKER: &str = "BROKER_VAR_SUB";

/// Header listing, comma-separated, the headers whose values need substitution.
pub const HEADER_MARKER: &str = "x-broker-var-sub";

/// Replaces `${NAME}` and `$NAME` with the value of the environment variable,
/// or with nothing when it is unset.
#[must_use]
pub fn expand_env(input: &str) -> String {
    expand_with(input, from_env)
}

/// Variable lookup against the process environment.
#[must_use]
pub fn from_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

pub fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let variable = if let Some(braced) = after.strip_prefix('{') {
            braced.find('}').map(|end| (&braced[..end], end + 2))
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (end > 0).then(|| (&after[..end], end))
        };
        match variable {
            Some((name, consumed)) => {
                out.push_str(&lookup(name).unwrap_or_default());
                rest = &after[consumed..];
            }
            None => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Applies body substitution when the body is a JSON object carrying the
/// [`BODY_MARKER`] list; the marker itself is removed. Any other body is
/// returned unchanged.
#[must_use]
pub fn substitute_body(body: Bytes, lookup: impl Fn(&str) -> Option<String>) -> Bytes {
    let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };
    let Some(paths) = object.shift_remove(BODY_MARKER) else {
        return body;
    };

    let mut document = Value::Object(object);
    for path in paths.as_array().into_iter().flatten().filter_map(Value::as_str) {
        if let Some(Value::String(value)) = lookup_path(&mut document, path) {
            if !value.is_empty() {
                *value = expand_with(value, &lookup);
            }
        }
    }

    match serde_json::to_vec(&document) {
        Ok(encoded) => Bytes::from(encoded),
        Err(e) => {
            warn!(error = %e, "Failed to re-encode substituted body");
            body
        }
    }
}

/// Resolves a dot-separated path; numeric components index arrays.
fn lookup_path<'a>(document: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(document, |node, key| match node {
        Value::Object(map) => map.get_mut(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

/// Expands the headers named by [`HEADER_MARKER`].
pub fn substitute_headers(headers: &mut HeaderMap, lookup: impl Fn(&str) -> Option<String>) {
    let Some(names) = headers
        .get(HEADER_MARKER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return;
    };

    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Some(current) = headers.get(&name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        if current.is_empty() {
            continue;
        }
        let expanded = expand_with(current, &lookup);
        match HeaderValue::from_str(&expanded) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => warn!(header = %name, "Substituted header value is invalid; left unchanged"),
        }
    }
}
