//! Issues tunnelled requests as real HTTP calls.

use axum::{
    body::Body,
    http::{HeaderMap, Method, StatusCode},
    response::Response,
};
use bytes::Bytes;
use tracing::error;

use crate::error::DispatchError;
use crate::protocol::{Headers, ResponsePayload, headers_from_wire, headers_to_wire};

pub async fn send(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<reqwest::Response, DispatchError> {
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| DispatchError::InvalidMethod(method.to_string()))?;
    Ok(client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await?)
}

/// Reads the whole response into a payload answering request `id`.
pub async fn buffer_response(id: String, response: reqwest::Response) -> ResponsePayload {
    let status_code = response.status().as_u16();
    let headers = headers_to_wire(response.headers());
    match response.bytes().await {
        Ok(body) => ResponsePayload {
            id,
            status_code,
            headers,
            body,
        },
        Err(e) => {
            error!(request_id = %id, error = %e, "Failed to read response body");
            ResponsePayload::error(id, StatusCode::BAD_GATEWAY.as_u16(), e.to_string())
        }
    }
}

/// Sends the request and folds any failure into a bad-gateway payload.
pub async fn dispatch(
    client: &reqwest::Client,
    id: String,
    method: &str,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
) -> ResponsePayload {
    match send(client, method, url, headers, body).await {
        Ok(response) => buffer_response(id, response).await,
        Err(e) => {
            error!(request_id = %id, url = %url, error = %e, "Request failed");
            ResponsePayload::error(id, StatusCode::BAD_GATEWAY.as_u16(), e.to_string())
        }
    }
}

/// Builds the HTTP response handed back to a local caller.
pub fn http_response(status: u16, headers: &Headers, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = headers_from_wire(headers);
    response
}
