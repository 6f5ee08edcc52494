use std::sync::Arc;

use axum::Router;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
    service::TowerToHyperService,
};
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, rustls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::stream::StreamType;

/// Serves `router` on `listener` until `shutdown` is cancelled, terminating
/// TLS when a server configuration is given.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    tls: Option<Arc<rustls::ServerConfig>>,
    shutdown: CancellationToken,
) {
    let acceptor = tls.map(TlsAcceptor::from);
    if let Ok(addr) = listener.local_addr() {
        info!(listen_addr = %addr, tls = acceptor.is_some(), "HTTP listener started");
    }

    loop {
        let (tcp, client_addr) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let stream = match StreamType::accept(tcp, acceptor.as_ref()).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(client_addr = %client_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            debug!(client_addr = %client_addr, tls = stream.is_tls(), "Connection accepted");

            let builder = Builder::new(TokioExecutor::new());
            let connection = builder.serve_connection_with_upgrades(
                TokioIo::new(stream),
                TowerToHyperService::new(router),
            );
            tokio::pin!(connection);

            tokio::select! {
                result = connection.as_mut() => {
                    if let Err(e) = result {
                        debug!(client_addr = %client_addr, error = %e, "Connection closed with error");
                    }
                }
                () = shutdown.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    let _ = connection.await;
                }
            }
        });
    }

    info!("HTTP listener stopped");
}
