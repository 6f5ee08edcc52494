//! One live tunnel: a serialized writer, its pending calls, and the read loop
//! shared by both endpoints.

use std::{future::Future, sync::Arc, time::Duration};

use axum::http::StatusCode;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{TransportResult, TunnelError};
use crate::pending::{PendingCalls, PendingSlot};
use crate::protocol::{RequestPayload, ResponsePayload, TunnelMessage};
use crate::transport::{EnvelopeReceiver, EnvelopeSender};

/// Body of the synthetic response delivered to calls stranded by a disconnect.
pub const DISCONNECTED_MESSAGE: &str = "Tunnel disconnected";

pub struct TunnelConnection {
    id: Uuid,
    token: String,
    writer: Mutex<Box<dyn EnvelopeSender>>,
    pending: Arc<PendingCalls>,
    shutdown: CancellationToken,
}

impl TunnelConnection {
    pub fn new(token: impl Into<String>, writer: impl EnvelopeSender) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            token: token.into(),
            writer: Mutex::new(Box::new(writer)),
            pending: PendingCalls::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Unique per connection, distinguishes successive tunnels on one token.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn pending(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    /// Writes one envelope. Writers are serialized; readers are not blocked.
    pub async fn send(&self, message: &TunnelMessage) -> TransportResult<()> {
        self.writer.lock().await.send_envelope(message).await
    }

    pub async fn respond(&self, response: ResponsePayload) -> TransportResult<()> {
        self.send(&TunnelMessage::Response(response)).await
    }

    /// Registers the request, sends it, and waits up to `timeout` for the
    /// matching response. The pending entry is removed on every exit path.
    pub async fn call(
        &self,
        request: RequestPayload,
        timeout: Duration,
    ) -> Result<Option<ResponsePayload>, TunnelError> {
        let mut slot = self.register(&request.id)?;
        self.send(&TunnelMessage::Request(request)).await?;
        Ok(tokio::time::timeout(timeout, slot.recv()).await.ok().flatten())
    }

    pub fn register(&self, id: &str) -> Result<PendingSlot, TunnelError> {
        self.pending.register(id)
    }

    /// Asks the read loop to stop; outstanding calls are then failed.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Reads envelopes until the transport closes, a fatal error occurs or
    /// [`close`](Self::close) is called.
    ///
    /// Responses are matched to pending calls by id; each request is handed to
    /// `on_request` on its own task. Malformed envelopes are logged and skipped.
    /// On exit every outstanding call is resolved with a disconnected response.
    pub async fn read_loop<R, F, Fut>(self: &Arc<Self>, mut receiver: R, on_request: F)
    where
        R: EnvelopeReceiver,
        F: Fn(Arc<Self>, RequestPayload) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let next = tokio::select! {
                () = self.shutdown.cancelled() => break,
                next = receiver.receive_envelope() => next,
            };

            match next {
                None => break,
                Some(Ok(TunnelMessage::Response(response))) => {
                    debug!(token = %self.token, request_id = %response.id, status = response.status_code, "Received response");
                    self.pending.fulfill(response);
                }
                Some(Ok(TunnelMessage::Request(request))) => {
                    debug!(token = %self.token, request_id = %request.id, method = %request.method, url = %request.url, "Received request");
                    tokio::spawn(on_request(Arc::clone(self), request));
                }
                Some(Err(e)) if !e.is_fatal() => {
                    warn!(token = %self.token, error = %e, "Dropping malformed envelope");
                }
                Some(Err(e)) => {
                    error!(token = %self.token, error = %e, "Tunnel read error");
                    break;
                }
            }
        }

        self.shutdown.cancel();
        let stranded = self
            .pending
            .fail_all(StatusCode::BAD_GATEWAY.as_u16(), DISCONNECTED_MESSAGE);
        if stranded > 0 {
            warn!(token = %self.token, stranded, "Failed pending calls on disconnect");
        }
        if let Err(e) = self.writer.lock().await.close().await {
            debug!(token = %self.token, error = %e, "Error closing tunnel transport");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::Headers;
    use crate::transport::{Transport, memory};
    use bytes::Bytes;

    fn request(id: &str) -> RequestPayload {
        RequestPayload {
            id: id.into(),
            method: "GET".into(),
            url: "/".into(),
            headers: Headers::new(),
            body: Bytes::new(),
            streaming_id: None,
        }
    }

    fn start() -> (Arc<TunnelConnection>, memory::Peer, tokio::task::JoinHandle<()>) {
        let (transport, peer) = memory::pair();
        let (sender, receiver) = transport.split();
        let connection = TunnelConnection::new("t", sender);
        let task = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .read_loop(receiver, |connection, request: RequestPayload| async move {
                        let _ = connection
                            .respond(ResponsePayload::error(request.id, 200, "echo"))
                            .await;
                    })
                    .await;
            })
        };
        (connection, peer, task)
    }

    #[tokio::test]
    async fn call_is_matched_by_id_regardless_of_order() {
        let (connection, mut peer, _task) = start();

        let first = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.call(request("a"), Duration::from_secs(5)).await })
        };
        let second = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.call(request("b"), Duration::from_secs(5)).await })
        };

        let mut seen = vec![
            peer.recv().await.unwrap().id().to_string(),
            peer.recv().await.unwrap().id().to_string(),
        ];
        seen.sort();
        assert_eq!(seen, ["a", "b"]);

        peer.send(TunnelMessage::Response(ResponsePayload::error("b", 201, "")));
        peer.send(TunnelMessage::Response(ResponsePayload::error("a", 200, "")));

        assert_eq!(first.await.unwrap().unwrap().unwrap().status_code, 200);
        assert_eq!(second.await.unwrap().unwrap().unwrap().status_code, 201);
        assert!(connection.pending().is_empty());
    }

    #[tokio::test]
    async fn inbound_requests_are_dispatched() {
        let (_connection, mut peer, _task) = start();
        peer.send(TunnelMessage::Request(request("r1")));

        let Some(TunnelMessage::Response(response)) = peer.recv().await else {
            panic!("expected response");
        };
        assert_eq!(response.id, "r1");
        assert_eq!(&response.body[..], b"echo");
    }

    #[tokio::test]
    async fn malformed_envelopes_do_not_stop_the_loop() {
        let (_connection, mut peer, _task) = start();
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let _ = peer.tx.send(Err(TransportError::Malformed(bad)));
        peer.send(TunnelMessage::Request(request("after")));

        assert_eq!(peer.recv().await.unwrap().id(), "after");
    }

    #[tokio::test]
    async fn call_times_out_and_cleans_up() {
        let (connection, _peer, _task) = start();
        let response = connection
            .call(request("slow"), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(response.is_none());
        assert!(connection.pending().is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_every_pending_call() {
        let (connection, mut peer, task) = start();

        let calls: Vec<_> = (0..5)
            .map(|i| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    connection
                        .call(request(&format!("r{i}")), Duration::from_secs(30))
                        .await
                })
            })
            .collect();

        for _ in 0..5 {
            peer.recv().await.unwrap();
        }
        drop(peer);
        task.await.unwrap();

        for call in calls {
            let response = call.await.unwrap().unwrap().unwrap();
            assert_eq!(response.status_code, 502);
        }
        assert!(connection.is_closed());
        assert!(matches!(
            connection.register("late"),
            Err(TunnelError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn close_stops_the_read_loop() {
        let (connection, _peer, task) = start();
        connection.close();
        task.await.unwrap();
        assert!(connection.is_closed());
    }
}
