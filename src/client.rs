//! Private-side endpoint: dials the server, serves tunnelled requests against
//! the private target and forwards local webhooks through the tunnel.

use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode, Uri, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use futures_util::{StreamExt, stream};
use serde::Serialize;
use serde_json::json;
use tokio_rustls::rustls;
use tokio_tungstenite::{
    Connector, connect_async_tls_with_config, tungstenite::protocol::WebSocketConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::TunnelError;
use crate::forward;
use crate::protocol::{RequestPayload, ResponsePayload, headers_from_wire, headers_to_wire};
use crate::rules::{Direction, FilterRequest, RuleSet, split_url};
use crate::streaming::{StreamMetadata, encode_header};
use crate::substitution::{expand_env, from_env, substitute_body, substitute_headers};
use crate::transport::{Transport, WebSocketTransport};
use crate::tunnel::TunnelConnection;

const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    config: ClientConfig,
    rules: Option<RuleSet>,
    target_url: Option<String>,
    tls: Arc<rustls::ClientConfig>,
    connection: RwLock<Option<Arc<TunnelConnection>>>,
    target: reqwest::Client,
    push: reqwest::Client,
    validation: reqwest::Client,
}

/// One entry of the systemcheck report.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCheck {
    pub broker_client_validation_url: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_client_validation_url_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        rules: Option<RuleSet>,
        tls: Arc<rustls::ClientConfig>,
    ) -> Result<Arc<Self>> {
        let target = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build target HTTP client")?;
        let push = reqwest::Client::builder()
            .use_preconfigured_tls((*tls).clone())
            .timeout(config.stream_timeout())
            .build()
            .context("Failed to build stream HTTP client")?;
        let validation = reqwest::Client::builder()
            .use_preconfigured_tls((*tls).clone())
            .timeout(VALIDATION_TIMEOUT)
            .build()
            .context("Failed to build validation HTTP client")?;

        Ok(Arc::new(Self {
            target_url: config.resolved_target_url(),
            config,
            rules,
            tls,
            connection: RwLock::new(None),
            target,
            push,
            validation,
        }))
    }

    fn connection(&self) -> Option<Arc<TunnelConnection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_connection(&self, connection: Option<Arc<TunnelConnection>>) {
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = connection;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| !c.is_closed())
    }

    fn server_url(&self) -> &str {
        self.config.server_url.trim_end_matches('/')
    }

    /// WebSocket URL of this client's tunnel entry point on the server.
    #[must_use]
    pub fn tunnel_url(&self) -> String {
        format!(
            "{}/broker/connect/{}",
            self.server_url().replacen("http", "ws", 1),
            self.config.token
        )
    }

    /// Dials the server once and serves the tunnel until it closes or
    /// `shutdown` is cancelled.
    #[tracing::instrument(skip_all, fields(server_url = %self.config.server_url))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let url = self.tunnel_url();
        let max_size = self.config.max_message_size;
        let websocket_config = WebSocketConfig::default()
            .max_message_size(Some(max_size))
            .max_frame_size(Some(max_size));

        let (socket, _) = connect_async_tls_with_config(
            url.as_str(),
            Some(websocket_config),
            false,
            Some(Connector::Rustls(Arc::clone(&self.tls))),
        )
        .await
        .context("Failed to connect to server")?;
        info!("Connected to server");

        self.attach(WebSocketTransport::new(socket), shutdown.clone())
            .await;

        if shutdown.is_cancelled() {
            Ok(())
        } else {
            Err(anyhow!("Tunnel to server closed"))
        }
    }

    /// Serves an established tunnel transport until it closes.
    pub async fn attach<T: Transport>(self: &Arc<Self>, transport: T, shutdown: CancellationToken) {
        let (sender, receiver) = transport.split();
        let connection = TunnelConnection::new(self.config.token.clone(), sender);
        self.set_connection(Some(Arc::clone(&connection)));

        let client = Arc::clone(self);
        let reading = connection.read_loop(receiver, move |connection, request| {
            Arc::clone(&client).handle_request(connection, request)
        });
        tokio::pin!(reading);

        tokio::select! {
            () = &mut reading => {}
            () = shutdown.cancelled() => {
                connection.close();
                reading.await;
            }
        }

        self.set_connection(None);
        info!("Disconnected from server");
    }

    async fn handle_request(
        self: Arc<Self>,
        connection: Arc<TunnelConnection>,
        request: RequestPayload,
    ) {
        if let Some(response) = self.serve_request(request).await {
            if let Err(e) = connection.respond(response).await {
                error!(error = %e, "Failed to send response");
            }
        }
    }

    /// Issues a tunnelled request against the private target.
    ///
    /// Returns the envelope to send back, or `None` once the response has been
    /// pushed over the streaming side channel.
    #[tracing::instrument(skip_all, fields(request_id = %request.id, method = %request.method, url = %request.url))]
    async fn serve_request(&self, request: RequestPayload) -> Option<ResponsePayload> {
        let RequestPayload {
            id,
            method,
            url,
            headers,
            body,
            streaming_id,
        } = request;

        let body = substitute_body(body, from_env);

        let mut base = self.target_url.clone();
        if let Some(rules) = &self.rules {
            let (path, query) = split_url(&url);
            let filter = FilterRequest {
                method: &method,
                path: &path,
                body: &body,
                query: &query,
            };
            let Some(rule) = rules.find(Direction::Private, &filter) else {
                warn!("Blocked downstream request by filter");
                return Some(ResponsePayload::error(
                    id,
                    StatusCode::FORBIDDEN.as_u16(),
                    "Blocked by filter",
                ));
            };
            if let Some(origin) = rule.origin() {
                let origin = expand_env(origin);
                if !origin.is_empty() {
                    base = Some(origin.trim_end_matches('/').to_string());
                }
            }
        }

        let Some(base) = base else {
            warn!("No target URL configured");
            return Some(ResponsePayload::error(
                id,
                StatusCode::BAD_GATEWAY.as_u16(),
                "Target URL not configured",
            ));
        };

        let mut headers = headers_from_wire(&headers);
        substitute_headers(&mut headers, from_env);

        let target = format!("{base}{url}");
        let response = match forward::send(&self.target, &method, &target, headers, body).await {
            Ok(response) => response,
            Err(e) => {
                error!(target = %target, error = %e, "Request failed");
                return Some(ResponsePayload::error(
                    id,
                    StatusCode::BAD_GATEWAY.as_u16(),
                    e.to_string(),
                ));
            }
        };

        match streaming_id {
            None => Some(forward::buffer_response(id, response).await),
            Some(streaming_id) => match self.push_stream(&streaming_id, response).await {
                Ok(()) => None,
                Err(e) => {
                    error!(streaming_id = %streaming_id, error = %e, "Failed to stream response");
                    Some(ResponsePayload::error(
                        id,
                        StatusCode::BAD_GATEWAY.as_u16(),
                        e.to_string(),
                    ))
                }
            },
        }
    }

    /// Pushes status, headers and body to the server's ingestion entry point.
    async fn push_stream(&self, streaming_id: &str, response: reqwest::Response) -> Result<()> {
        let header = encode_header(&StreamMetadata {
            status: response.status().as_u16(),
            headers: headers_to_wire(response.headers()),
        })
        .context("Failed to encode stream metadata")?;

        let body = stream::iter([Ok(header)]).chain(response.bytes_stream());
        let url = format!(
            "{}/response-data/{}/{}",
            self.server_url(),
            self.config.token,
            streaming_id
        );

        let pushed = self
            .push
            .post(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .context("Failed to push response body")?;

        if pushed.status() != StatusCode::OK {
            bail!("Server rejected stream: {}", pushed.status());
        }
        debug!(streaming_id = %streaming_id, "Streamed response to server");
        Ok(())
    }

    /// Forwards a locally received call through the tunnel and waits for the
    /// upstream's answer.
    #[tracing::instrument(skip_all, fields(method = %method, path = %uri.path()))]
    pub async fn forward_webhook(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response {
        let Some(connection) = self.connection() else {
            return (StatusCode::SERVICE_UNAVAILABLE, "Not connected to server").into_response();
        };

        let url = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), ToString::to_string);

        if let Some(rules) = &self.rules {
            let (path, query) = split_url(&url);
            let filter = FilterRequest {
                method: method.as_str(),
                path: &path,
                body: &body,
                query: &query,
            };
            if rules.find(Direction::Public, &filter).is_none() {
                warn!("Blocked upstream webhook by filter");
                return (StatusCode::FORBIDDEN, "Blocked by filter").into_response();
            }
        }

        let request = RequestPayload {
            id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            url,
            headers: headers_to_wire(headers),
            body,
            streaming_id: None,
        };

        match connection.call(request, self.config.request_timeout()).await {
            Ok(Some(response)) => forward::http_response(
                response.status_code,
                &response.headers,
                Body::from(response.body),
            ),
            Ok(None) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Timeout waiting for webhook response",
            )
                .into_response(),
            Err(TunnelError::Send(e)) => {
                error!(error = %e, "Failed to forward webhook");
                (StatusCode::BAD_GATEWAY, "Failed to forward webhook").into_response()
            }
            Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
        }
    }

    /// Calls the configured validation URL and reports whether it answered
    /// with a 2xx status.
    pub async fn system_check(&self) -> Vec<SystemCheck> {
        let Some(url) = self.config.validation_url.as_deref() else {
            return Vec::new();
        };

        let mut request = self.validation.get(url);
        if let Some(authorization) = &self.config.validation_authorization {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }

        let mut check = SystemCheck {
            broker_client_validation_url: url.to_string(),
            ok: false,
            broker_client_validation_url_status_code: None,
            error: None,
        };
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                check.broker_client_validation_url_status_code = Some(status.as_u16());
                if status.is_success() {
                    check.ok = true;
                } else {
                    check.error = Some(format!("Status code is not 2xx: {}", status.as_u16()));
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Validation request failed");
                check.error = Some(e.to_string());
            }
        }
        vec![check]
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/webhook/{*path}", any(webhook_handler))
            .route("/systemcheck", get(systemcheck_handler))
            .route("/healthcheck", get(healthcheck_handler))
            .layer(DefaultBodyLimit::max(self.config.max_message_size))
            .with_state(Arc::clone(self))
    }
}

async fn webhook_handler(
    State(client): State<Arc<Client>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    client.forward_webhook(&method, &uri, &headers, body).await
}

async fn systemcheck_handler(State(client): State<Arc<Client>>) -> Json<Vec<SystemCheck>> {
    Json(client.system_check().await)
}

async fn healthcheck_handler(State(client): State<Arc<Client>>) -> Response {
    if client.is_connected() {
        Json(json!({ "ok": true })).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not connected").into_response()
    }
}
