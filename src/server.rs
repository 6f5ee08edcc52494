//! Public-facing endpoint: accepts tunnels, relays callers through them and
//! issues tunnel-originated requests against the upstream.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State, ws::WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use futures_util::StreamExt;
use serde_json::json;
use tokio::{
    io::AsyncWriteExt,
    time::{Instant, sleep_until, timeout_at},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::forward;
use crate::protocol::{
    RequestPayload, ResponsePayload, TunnelMessage, headers_from_wire, headers_to_wire,
};
use crate::rules::{Direction, FilterRequest, RuleSet, split_url};
use crate::streaming::{StreamRegistry, read_metadata};
use crate::transport::{Transport, WebSocketTransport};
use crate::tunnel::{DISCONNECTED_MESSAGE, TunnelConnection};

pub struct Server {
    config: ServerConfig,
    rules: Option<RuleSet>,
    connections: RwLock<HashMap<String, Arc<TunnelConnection>>>,
    streams: Arc<StreamRegistry>,
    upstream: reqwest::Client,
}

impl Server {
    pub fn new(config: ServerConfig, rules: Option<RuleSet>) -> Result<Arc<Self>> {
        let upstream = reqwest::Client::builder()
            .timeout(config.upstream_timeout())
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Arc::new(Self {
            config,
            rules,
            connections: RwLock::new(HashMap::new()),
            streams: StreamRegistry::new(),
            upstream,
        }))
    }

    fn read_connections(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<TunnelConnection>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_connections(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<TunnelConnection>>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn connection(&self, token: &str) -> Option<Arc<TunnelConnection>> {
        self.read_connections().get(token).cloned()
    }

    /// Number of live tunnels.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.read_connections().len()
    }

    /// Number of streamed bodies still waiting for their producer.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Installs a tunnel for `token` and serves it until it disconnects.
    ///
    /// A newer connection for the same token replaces the current one, whose
    /// outstanding calls are then failed.
    #[tracing::instrument(skip_all, fields(token = %token))]
    pub async fn connect<T: Transport>(self: &Arc<Self>, token: String, transport: T) {
        let (sender, receiver) = transport.split();
        let connection = TunnelConnection::new(token.clone(), sender);

        let previous = self
            .write_connections()
            .insert(token.clone(), Arc::clone(&connection));
        if let Some(previous) = previous {
            warn!(replaced = %previous.id(), "Replacing existing tunnel for token");
            previous.close();
        }
        info!(connection_id = %connection.id(), "Client connected");

        let server = Arc::clone(self);
        connection
            .read_loop(receiver, move |connection, request| {
                Arc::clone(&server).handle_tunnel_request(connection, request)
            })
            .await;

        {
            let mut connections = self.write_connections();
            if connections
                .get(&token)
                .is_some_and(|current| Arc::ptr_eq(current, &connection))
            {
                connections.remove(&token);
            }
        }
        info!(connection_id = %connection.id(), "Client disconnected");
    }

    async fn handle_tunnel_request(
        self: Arc<Self>,
        connection: Arc<TunnelConnection>,
        request: RequestPayload,
    ) {
        let response = self.forward_upstream(request).await;
        if let Err(e) = connection.respond(response).await {
            error!(token = %connection.token(), error = %e, "Failed to send upstream response");
        }
    }

    /// Filters a tunnel-originated request and issues it against the upstream.
    async fn forward_upstream(&self, request: RequestPayload) -> ResponsePayload {
        let (path, query) = split_url(&request.url);
        if let Some(rules) = &self.rules {
            let filter = FilterRequest {
                method: &request.method,
                path: &path,
                body: &request.body,
                query: &query,
            };
            if rules.find(Direction::Public, &filter).is_none() {
                warn!(method = %request.method, url = %request.url, "Blocked upstream request by filter");
                return ResponsePayload::error(
                    request.id,
                    StatusCode::FORBIDDEN.as_u16(),
                    "Blocked by filter",
                );
            }
        }

        let Some(upstream) = self.config.upstream_url.as_deref() else {
            warn!(request_id = %request.id, "Upstream URL not configured");
            return ResponsePayload::error(
                request.id,
                StatusCode::BAD_GATEWAY.as_u16(),
                "Upstream URL not configured",
            );
        };

        let url = format!("{}{}", upstream.trim_end_matches('/'), request.url);
        forward::dispatch(
            &self.upstream,
            request.id,
            &request.method,
            &url,
            headers_from_wire(&request.headers),
            request.body,
        )
        .await
    }

    /// Relays one public caller's request through the tunnel for `token`.
    ///
    /// The synchronous response, the streamed response and the caller's
    /// deadline race; whichever finishes first answers the caller. Both the
    /// pending call and the conduit are deregistered when this returns.
    #[tracing::instrument(skip_all, fields(token = %token, method = %method, url = %url))]
    pub async fn proxy(
        &self,
        token: &str,
        method: &Method,
        url: String,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response {
        let Some(connection) = self.connection(token) else {
            return (StatusCode::NOT_FOUND, "Client not connected").into_response();
        };
        let deadline = Instant::now() + self.config.request_timeout();

        let request_id = Uuid::new_v4().to_string();
        let streaming_id = self
            .config
            .stream_responses
            .then(|| Uuid::new_v4().to_string());

        let mut slot = match connection.register(&request_id) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(error = %e, "Tunnel is not accepting requests");
                return (StatusCode::BAD_GATEWAY, DISCONNECTED_MESSAGE).into_response();
            }
        };
        let consumer = streaming_id.as_ref().map(|id| self.streams.open(id.clone()));

        let request = RequestPayload {
            id: request_id,
            method: method.to_string(),
            url,
            headers: headers_to_wire(headers),
            body,
            streaming_id,
        };
        match timeout_at(deadline, connection.send(&TunnelMessage::Request(request))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Failed to send request to client");
                return (StatusCode::BAD_GATEWAY, "Failed to send request to client").into_response();
            }
            Err(_) => {
                warn!(request_id = %slot.id(), "Timed out sending request to client");
                return (StatusCode::GATEWAY_TIMEOUT, "Timeout waiting for client response")
                    .into_response();
            }
        }

        let streamed = async move {
            match consumer {
                Some(mut consumer) => (read_metadata(&mut consumer).await, consumer),
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            response = slot.recv() => match response {
                Some(payload) => {
                    debug!(request_id = %slot.id(), status = payload.status_code, "Relaying response");
                    forward::http_response(payload.status_code, &payload.headers, Body::from(payload.body))
                }
                None => (StatusCode::BAD_GATEWAY, DISCONNECTED_MESSAGE).into_response(),
            },
            (metadata, consumer) = streamed => match metadata {
                Ok(metadata) => {
                    debug!(streaming_id = %consumer.id(), status = metadata.status, "Relaying streamed response");
                    let body = ReaderStream::new(consumer).take_until(sleep_until(deadline));
                    forward::http_response(metadata.status, &metadata.headers, Body::from_stream(body))
                }
                Err(e) => {
                    error!(error = %e, "Stream error");
                    (StatusCode::BAD_GATEWAY, "Stream error").into_response()
                }
            },
            () = sleep_until(deadline) => {
                warn!(request_id = %slot.id(), "Timed out waiting for client response");
                (StatusCode::GATEWAY_TIMEOUT, "Timeout waiting for client response").into_response()
            }
        }
    }

    /// Copies a pushed body into the conduit registered under `streaming_id`
    /// and closes it.
    pub async fn ingest_streamed_body(&self, streaming_id: &str, body: Body) -> StatusCode {
        let Some(mut producer) = self.streams.take_producer(streaming_id) else {
            debug!(streaming_id = %streaming_id, "Stream not found");
            return StatusCode::NOT_FOUND;
        };

        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            let result = match chunk {
                Ok(chunk) => producer.write_all(&chunk).await,
                Err(e) => {
                    warn!(streaming_id = %streaming_id, error = %e, "Error reading pushed body");
                    break;
                }
            };
            if let Err(e) = result {
                debug!(streaming_id = %streaming_id, error = %e, "Caller went away while streaming");
                break;
            }
        }

        if let Err(e) = producer.shutdown().await {
            debug!(streaming_id = %streaming_id, error = %e, "Error closing stream conduit");
        }
        StatusCode::OK
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/healthcheck", get(healthcheck))
            .route("/broker/connect/{token}", get(connect_handler))
            .route("/broker/{token}", any(proxy_handler))
            .route("/broker/{token}/{*path}", any(proxy_handler))
            .route("/response-data/{token}/{streaming_id}", post(ingest_handler))
            .route(
                "/hidden/brokers/response-data/{token}/{streaming_id}",
                post(ingest_handler),
            )
            .layer(DefaultBodyLimit::max(self.config.max_message_size))
            .with_state(Arc::clone(self))
    }
}

/// Splits `/broker/{token}/{rest}` into the token and the target path and
/// query, `/{rest}?{query}`. The path is kept exactly as received.
fn split_proxy_uri(uri: &Uri) -> Option<(&str, String)> {
    let mut parts = uri.path().splitn(4, '/').skip(2);
    let token = parts.next().filter(|t| !t.is_empty())?;
    let mut target = format!("/{}", parts.next().unwrap_or_default());
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    Some((token, target))
}

async fn healthcheck(State(server): State<Arc<Server>>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "tunnels": server.connection_count(),
        "streams": server.stream_count(),
    }))
}

async fn connect_handler(
    State(server): State<Arc<Server>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let max_size = server.config.max_message_size;
    ws.max_message_size(max_size)
        .max_frame_size(max_size)
        .on_upgrade(move |socket| async move {
            server.connect(token, WebSocketTransport::new(socket)).await;
        })
}

async fn proxy_handler(
    State(server): State<Arc<Server>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((token, target)) = split_proxy_uri(&uri) else {
        return (StatusCode::BAD_REQUEST, "Invalid path").into_response();
    };
    server.proxy(token, &method, target, &headers, body).await
}

async fn ingest_handler(
    State(server): State<Arc<Server>>,
    Path((token, streaming_id)): Path<(String, String)>,
    body: Body,
) -> StatusCode {
    debug!(token = %token, streaming_id = %streaming_id, "Receiving streamed body");
    server.ingest_streamed_body(&streaming_id, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenConfig;
    use crate::protocol::Headers;
    use crate::streaming::{StreamMetadata, encode_header};
    use crate::error::TransportResult;
    use crate::transport::memory::{self, Peer};
    use crate::transport::{EnvelopeReceiver, EnvelopeSender};
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig {
            listen: ListenConfig {
                ip: "127.0.0.1".into(),
                port: 0,
                tls: None,
            },
            upstream_url: None,
            accept: None,
            request_timeout_secs: 5,
            upstream_timeout_secs: 5,
            stream_responses: false,
            max_message_size: 1024 * 1024,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn attach(server: &Arc<Server>, token: &str) -> (Peer, tokio::task::JoinHandle<()>) {
        let (transport, peer) = memory::pair();
        let before = server.connection(token).map(|c| c.id());
        let task = {
            let server = Arc::clone(server);
            let token = token.to_string();
            tokio::spawn(async move { server.connect(token, transport).await })
        };
        wait_until(|| server.connection(token).map(|c| c.id()).is_some_and(|id| Some(id) != before))
            .await;
        (peer, task)
    }

    fn spawn_proxy(server: &Arc<Server>, token: &str, url: &str) -> tokio::task::JoinHandle<Response> {
        let server = Arc::clone(server);
        let token = token.to_string();
        let url = url.to_string();
        tokio::spawn(async move {
            server
                .proxy(&token, &Method::GET, url, &HeaderMap::new(), Bytes::new())
                .await
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    mod proxy {
        use super::*;

        #[tokio::test]
        async fn unknown_token_is_not_found() {
            let server = Server::new(config(), None).unwrap();
            let response = spawn_proxy(&server, "nobody", "/").await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn synchronous_response_is_relayed() {
            let server = Server::new(config(), None).unwrap();
            let (mut peer, _task) = attach(&server, "t").await;

            let call = spawn_proxy(&server, "t", "/repos?page=2");
            let Some(TunnelMessage::Request(request)) = peer.recv().await else {
                panic!("expected request");
            };
            assert_eq!(request.url, "/repos?page=2");
            assert_eq!(request.streaming_id, None);

            let mut response = ResponsePayload::error(request.id, 201, "created");
            response
                .headers
                .insert("x-from".into(), vec!["client".into()]);
            peer.send(TunnelMessage::Response(response));

            let response = call.await.unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            assert_eq!(response.headers()["x-from"], "client");
            assert_eq!(body_text(response).await, "created");
            assert!(server.connection("t").unwrap().pending().is_empty());
        }

        #[tokio::test]
        async fn streamed_response_is_relayed() {
            let server = Server::new(
                ServerConfig {
                    stream_responses: true,
                    ..config()
                },
                None,
            )
            .unwrap();
            let (mut peer, _task) = attach(&server, "t").await;

            let call = spawn_proxy(&server, "t", "/big");
            let Some(TunnelMessage::Request(request)) = peer.recv().await else {
                panic!("expected request");
            };
            let streaming_id = request.streaming_id.unwrap();
            assert_eq!(server.stream_count(), 1);

            let header = encode_header(&StreamMetadata {
                status: 200,
                headers: Headers::from([("X".to_string(), vec!["1".to_string()])]),
            })
            .unwrap();
            let pushed = [header.to_vec(), b"hello".to_vec()].concat();
            let status = server
                .ingest_streamed_body(&streaming_id, Body::from(pushed))
                .await;
            assert_eq!(status, StatusCode::OK);

            let response = call.await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x"], "1");
            assert_eq!(body_text(response).await, "hello");
            assert_eq!(server.stream_count(), 0);
        }

        #[tokio::test]
        async fn synchronous_response_wins_over_an_idle_stream() {
            let server = Server::new(
                ServerConfig {
                    stream_responses: true,
                    ..config()
                },
                None,
            )
            .unwrap();
            let (mut peer, _task) = attach(&server, "t").await;

            let call = spawn_proxy(&server, "t", "/");
            let Some(TunnelMessage::Request(request)) = peer.recv().await else {
                panic!("expected request");
            };
            peer.send(TunnelMessage::Response(ResponsePayload::error(
                request.id,
                403,
                "Blocked by filter",
            )));

            let response = call.await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert_eq!(server.stream_count(), 0);

            let late = server
                .ingest_streamed_body(&request.streaming_id.unwrap(), Body::empty())
                .await;
            assert_eq!(late, StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn stream_closed_before_metadata_is_a_bad_gateway() {
            let server = Server::new(
                ServerConfig {
                    stream_responses: true,
                    ..config()
                },
                None,
            )
            .unwrap();
            let (mut peer, _task) = attach(&server, "t").await;

            let call = spawn_proxy(&server, "t", "/");
            let Some(TunnelMessage::Request(request)) = peer.recv().await else {
                panic!("expected request");
            };
            server
                .ingest_streamed_body(&request.streaming_id.unwrap(), Body::from(vec![9, 0]))
                .await;

            let response = call.await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            assert_eq!(body_text(response).await, "Stream error");
        }

        #[tokio::test]
        async fn caller_timeout_is_a_gateway_timeout() {
            let server = Server::new(
                ServerConfig {
                    request_timeout_secs: 0,
                    stream_responses: true,
                    ..config()
                },
                None,
            )
            .unwrap();
            let (_peer, _task) = attach(&server, "t").await;

            let response = spawn_proxy(&server, "t", "/").await.unwrap();
            assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
            assert!(server.connection("t").unwrap().pending().is_empty());
            assert_eq!(server.stream_count(), 0);
        }

        /// A transport whose writes never complete.
        struct Stalled;
        struct StalledSender;
        struct StalledReceiver;

        impl Transport for Stalled {
            type Sender = StalledSender;
            type Receiver = StalledReceiver;

            fn split(self) -> (Self::Sender, Self::Receiver) {
                (StalledSender, StalledReceiver)
            }
        }

        #[async_trait::async_trait]
        impl EnvelopeSender for StalledSender {
            async fn send_envelope(&mut self, _message: &TunnelMessage) -> TransportResult<()> {
                std::future::pending().await
            }

            async fn close(&mut self) -> TransportResult<()> {
                Ok(())
            }
        }

        #[async_trait::async_trait]
        impl EnvelopeReceiver for StalledReceiver {
            async fn receive_envelope(&mut self) -> Option<TransportResult<TunnelMessage>> {
                std::future::pending().await
            }
        }

        #[tokio::test]
        async fn stalled_send_is_bounded_by_the_deadline() {
            let server = Server::new(
                ServerConfig {
                    request_timeout_secs: 0,
                    ..config()
                },
                None,
            )
            .unwrap();
            let _task = {
                let server = Arc::clone(&server);
                tokio::spawn(async move { server.connect("t".into(), Stalled).await })
            };
            wait_until(|| server.connection("t").is_some()).await;

            let response = spawn_proxy(&server, "t", "/").await.unwrap();
            assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
            assert!(server.connection("t").unwrap().pending().is_empty());
        }

        #[tokio::test]
        async fn disconnect_fails_the_caller() {
            let server = Server::new(config(), None).unwrap();
            let (mut peer, task) = attach(&server, "t").await;

            let call = spawn_proxy(&server, "t", "/");
            peer.recv().await.unwrap();
            drop(peer);
            task.await.unwrap();

            let response = call.await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            assert_eq!(body_text(response).await, DISCONNECTED_MESSAGE);
            assert_eq!(server.connection_count(), 0);
        }
    }

    mod tunnel_requests {
        use super::*;

        fn request(method: &str, url: &str) -> TunnelMessage {
            TunnelMessage::Request(RequestPayload {
                id: "w1".into(),
                method: method.into(),
                url: url.into(),
                headers: Headers::new(),
                body: Bytes::new(),
                streaming_id: None,
            })
        }

        async fn response(peer: &mut Peer) -> ResponsePayload {
            match peer.recv().await {
                Some(TunnelMessage::Response(response)) => response,
                other => panic!("expected response, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn denied_requests_are_answered_with_forbidden() {
            let rules = RuleSet::compile(
                br#"{"public":[{"method":"POST","path":"/webhook/github/*"}]}"#,
            )
            .unwrap();
            let server = Server::new(config(), Some(rules)).unwrap();
            let (mut peer, _task) = attach(&server, "t").await;

            peer.send(request("DELETE", "/webhook/github/1"));
            let response = response(&mut peer).await;
            assert_eq!(response.id, "w1");
            assert_eq!(response.status_code, 403);
            assert_eq!(&response.body[..], b"Blocked by filter");
        }

        #[tokio::test]
        async fn missing_upstream_is_a_bad_gateway() {
            let server = Server::new(config(), None).unwrap();
            let (mut peer, _task) = attach(&server, "t").await;

            peer.send(request("POST", "/webhook/github/1"));
            assert_eq!(response(&mut peer).await.status_code, 502);
        }
    }

    mod connections {
        use super::*;

        #[tokio::test]
        async fn last_connect_wins() {
            let server = Server::new(config(), None).unwrap();
            let (mut first, first_task) = attach(&server, "t").await;
            let first_id = server.connection("t").unwrap().id();
            let in_flight = spawn_proxy(&server, "t", "/slow");
            first.recv().await.unwrap();

            let (_second, _second_task) = attach(&server, "t").await;
            first_task.await.unwrap();

            let response = in_flight.await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            assert_eq!(body_text(response).await, DISCONNECTED_MESSAGE);

            let current = server.connection("t").unwrap();
            assert_ne!(current.id(), first_id);
            assert!(!current.is_closed());
            assert_eq!(server.connection_count(), 1);
        }

        #[test]
        fn proxy_uri_splitting() {
            let uri: Uri = "/broker/abc/repos/a%2Fb?x=1".parse().unwrap();
            assert_eq!(
                split_proxy_uri(&uri),
                Some(("abc", "/repos/a%2Fb?x=1".to_string()))
            );

            let uri: Uri = "/broker/abc".parse().unwrap();
            assert_eq!(split_proxy_uri(&uri), Some(("abc", "/".to_string())));

            let uri: Uri = "/broker/".parse().unwrap();
            assert_eq!(split_proxy_uri(&uri), None);
        }
    }
}
