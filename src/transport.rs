//! Transport abstraction for tunnel envelopes.
//!
//! Tunnel logic only sees [`EnvelopeSender`] and [`EnvelopeReceiver`]. The
//! WebSocket adapter works for both the server-side `axum` socket and the
//! client-side `tokio-tungstenite` stream.

use async_trait::async_trait;
use futures_util::{
    Sink, SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::protocol::TunnelMessage;

/// Default single-message size limit.
pub const MAX_MESSAGE_SIZE: usize = 32_768 * 1000;

#[async_trait]
pub trait EnvelopeSender: Send + 'static {
    async fn send_envelope(&mut self, message: &TunnelMessage) -> TransportResult<()>;

    async fn close(&mut self) -> TransportResult<()>;
}

#[async_trait]
pub trait EnvelopeReceiver: Send + 'static {
    /// Receives the next envelope.
    ///
    /// Returns `None` once the peer has closed the transport.
    async fn receive_envelope(&mut self) -> Option<TransportResult<TunnelMessage>>;
}

/// A bidirectional transport that can be split into independent halves.
pub trait Transport: Send + 'static {
    type Sender: EnvelopeSender;
    type Receiver: EnvelopeReceiver;

    fn split(self) -> (Self::Sender, Self::Receiver);
}

/// What a WebSocket frame means to the tunnel.
pub enum FrameKind {
    Data(Vec<u8>),
    Close,
    Control,
}

/// Glue between a WebSocket library's message type and the tunnel.
pub trait Frame: Sized + Send + 'static {
    fn text(text: String) -> Self;
    fn close() -> Self;
    fn kind(self) -> FrameKind;
}

impl Frame for tokio_tungstenite::tungstenite::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn kind(self) -> FrameKind {
        match self {
            Self::Text(text) => FrameKind::Data(text.as_bytes().to_vec()),
            Self::Binary(data) => FrameKind::Data(data.to_vec()),
            Self::Close(_) => FrameKind::Close,
            _ => FrameKind::Control,
        }
    }
}

impl Frame for axum::extract::ws::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn kind(self) -> FrameKind {
        match self {
            Self::Text(text) => FrameKind::Data(text.as_bytes().to_vec()),
            Self::Binary(data) => FrameKind::Data(data.to_vec()),
            Self::Close(_) => FrameKind::Close,
            _ => FrameKind::Control,
        }
    }
}

/// Any WebSocket stream carrying one JSON envelope per message.
pub struct WebSocketTransport<W> {
    socket: W,
}

impl<W> WebSocketTransport<W> {
    pub const fn new(socket: W) -> Self {
        Self { socket }
    }
}

pub struct WebSocketSender<W, F> {
    sink: SplitSink<W, F>,
}

pub struct WebSocketReceiver<W> {
    stream: SplitStream<W>,
}

impl<W, F, E> Transport for WebSocketTransport<W>
where
    W: Stream<Item = Result<F, E>> + Sink<F, Error = E> + Unpin + Send + 'static,
    F: Frame,
    E: std::error::Error + Send + Sync + 'static,
{
    type Sender = WebSocketSender<W, F>;
    type Receiver = WebSocketReceiver<W>;

    fn split(self) -> (Self::Sender, Self::Receiver) {
        let (sink, stream) = self.socket.split();
        (WebSocketSender { sink }, WebSocketReceiver { stream })
    }
}

fn websocket_error<E: std::error::Error + Send + Sync + 'static>(error: E) -> TransportError {
    TransportError::WebSocket(Box::new(error))
}

#[async_trait]
impl<W, F, E> EnvelopeSender for WebSocketSender<W, F>
where
    W: Stream<Item = Result<F, E>> + Sink<F, Error = E> + Unpin + Send + 'static,
    F: Frame,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn send_envelope(&mut self, message: &TunnelMessage) -> TransportResult<()> {
        let text = message.encode()?;
        self.sink.send(F::text(text)).await.map_err(websocket_error)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.sink.send(F::close()).await.map_err(websocket_error)?;
        self.sink.close().await.map_err(websocket_error)
    }
}

#[async_trait]
impl<W, F, E> EnvelopeReceiver for WebSocketReceiver<W>
where
    W: Stream<Item = Result<F, E>> + Sink<F, Error = E> + Unpin + Send + 'static,
    F: Frame,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn receive_envelope(&mut self) -> Option<TransportResult<TunnelMessage>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(websocket_error(e))),
            };
            match frame.kind() {
                FrameKind::Data(data) => {
                    return Some(TunnelMessage::decode(&data).map_err(TransportError::from));
                }
                FrameKind::Close => {
                    debug!("Peer closed tunnel transport");
                    return None;
                }
                FrameKind::Control => {}
            }
        }
    }
}

#[cfg(test)]
pub mod memory {
    //! In-process transport used to drive tunnel endpoints in tests.

    use super::*;
    use tokio::sync::mpsc;

    pub struct MemoryTransport {
        tx: mpsc::UnboundedSender<TransportResult<TunnelMessage>>,
        rx: mpsc::UnboundedReceiver<TransportResult<TunnelMessage>>,
    }

    pub struct MemorySender {
        tx: Option<mpsc::UnboundedSender<TransportResult<TunnelMessage>>>,
    }

    pub struct MemoryReceiver {
        rx: mpsc::UnboundedReceiver<TransportResult<TunnelMessage>>,
    }

    /// Remote end of a [`MemoryTransport`], driven directly by a test.
    pub struct Peer {
        pub tx: mpsc::UnboundedSender<TransportResult<TunnelMessage>>,
        pub rx: mpsc::UnboundedReceiver<TransportResult<TunnelMessage>>,
    }

    impl Peer {
        pub fn send(&self, message: TunnelMessage) {
            let _ = self.tx.send(Ok(message));
        }

        pub async fn recv(&mut self) -> Option<TunnelMessage> {
            self.rx.recv().await.and_then(Result::ok)
        }
    }

    #[must_use]
    pub fn pair() -> (MemoryTransport, Peer) {
        let (to_local, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_local) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                tx: to_peer,
                rx: from_peer,
            },
            Peer {
                tx: to_local,
                rx: from_local,
            },
        )
    }

    impl Transport for MemoryTransport {
        type Sender = MemorySender;
        type Receiver = MemoryReceiver;

        fn split(self) -> (Self::Sender, Self::Receiver) {
            (MemorySender { tx: Some(self.tx) }, MemoryReceiver { rx: self.rx })
        }
    }

    #[async_trait]
    impl EnvelopeSender for MemorySender {
        async fn send_envelope(&mut self, message: &TunnelMessage) -> TransportResult<()> {
            self.tx
                .as_ref()
                .ok_or(TransportError::Closed)?
                .send(Ok(message.clone()))
                .map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> TransportResult<()> {
            self.tx = None;
            Ok(())
        }
    }

    #[async_trait]
    impl EnvelopeReceiver for MemoryReceiver {
        async fn receive_envelope(&mut self) -> Option<TransportResult<TunnelMessage>> {
            self.rx.recv().await
        }
    }
}
