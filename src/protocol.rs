//! Tunnel wire format.
//!
//! Every logical message is one JSON document
//! `{"type": "request"|"response", "payload": {...}}`. Bodies travel as
//! base64 strings.

use std::collections::HashMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

/// Header multimap as carried on the wire.
pub type Headers = HashMap<String, Vec<String>>;

/// Headers that describe a single hop and are never forwarded through the tunnel.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
    "te",
    "trailer",
    "proxy-connection",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum TunnelMessage {
    Request(RequestPayload),
    Response(ResponsePayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub id: String,
    pub method: String,
    /// Path and query, relative to the receiving side's base URL.
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
    /// Present when the response body must come back over the side channel.
    #[serde(
        rename = "streamingID",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub streaming_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub id: String,
    pub status_code: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

impl ResponsePayload {
    /// A synthetic response carrying `message` as its body.
    pub fn error(id: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status_code,
            headers: Headers::new(),
            body: Bytes::from(message.into()),
        }
    }
}

impl TunnelMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Request(payload) => &payload.id,
            Self::Response(payload) => &payload.id,
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Converts an HTTP header map into the wire multimap, dropping hop-by-hop
/// headers and values that are not valid UTF-8.
#[must_use]
pub fn headers_to_wire(headers: &HeaderMap) -> Headers {
    let mut wire = Headers::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            wire.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    wire
}

/// Converts a wire multimap back into an HTTP header map, skipping hop-by-hop
/// headers and anything that is not a valid header name or value.
#[must_use]
pub fn headers_from_wire(wire: &Headers) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in wire {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

mod base64_body {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map(Bytes::from).map_err(D::Error::custom),
            None => Ok(Bytes::new()),
        }
    }
}
