//! WebSocket transport.
//!
//! Browser windows connect to `ws://<listen_addr>/?window=<id>`. Every
//! connection gets a `hello` frame with its assigned ids, then exchanges
//! JSON text frames with the [`MessageRouter`]. All frames for a connection,
//! replies and notifications alike, go through its single outbound queue.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use protocol::messages::Hello;
use protocol::{ServerMessage, PROTOCOL_VERSION};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::mux::Multiplexer;
use crate::router::MessageRouter;

/// Errors from the WebSocket listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Extracts the `window` query parameter from a handshake request URI.
pub fn window_from_uri(uri: &str) -> Option<String> {
    let url = Url::parse("ws://localhost").ok()?.join(uri).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "window")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Accepts WebSocket connections and serves them until cancelled.
pub struct WsServer<M: Multiplexer> {
    listener: TcpListener,
    router: MessageRouter<M>,
    cancel: CancellationToken,
}

impl<M: Multiplexer> WsServer<M> {
    pub async fn bind(
        addr: &str,
        router: MessageRouter<M>,
        cancel: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            router,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop. Returns once the cancellation token fires.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "WebSocket server listening");
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept TCP connection");
                        continue;
                    }
                },
            };

            let router = self.router.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, router, cancel).await {
                    tracing::debug!(%peer, error = %e, "Connection ended with error");
                }
            });
        }

        tracing::info!("WebSocket server stopped");
    }
}

async fn handle_connection<M: Multiplexer>(
    stream: TcpStream,
    peer: SocketAddr,
    router: MessageRouter<M>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let mut window = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            window = window_from_uri(&request.uri().to_string());
            Ok(response)
        },
    )
    .await?;

    let hub = Arc::clone(router.hub());
    let (info, outbound) = hub.connect(window);
    let connection_id = info.connection_id.clone();
    tracing::info!(
        %peer,
        connection_id = %info.connection_id,
        window_id = %info.window_id,
        "Client connected"
    );

    hub.router().send_to(
        &connection_id,
        ServerMessage::Hello(Hello {
            connection_id: info.connection_id,
            window_id: info.window_id,
            protocol_version: PROTOCOL_VERSION,
        }),
    );

    let (sink, mut source) = ws_stream.split();
    let (control_tx, control_rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer = tokio::spawn(write_loop(sink, outbound, control_rx));

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = control_tx.send(WsMessage::Close(None));
                break;
            }
            frame = source.next() => frame,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                if let Some(reply) = router.route_text(&connection_id, &text).await {
                    hub.router().send_to(&connection_id, reply);
                }
            }
            Some(Ok(WsMessage::Ping(payload))) => {
                let _ = control_tx.send(WsMessage::Pong(payload));
            }
            Some(Ok(WsMessage::Binary(_))) => {
                hub.router().send_to(
                    &connection_id,
                    ServerMessage::error(
                        protocol::ErrorCode::InvalidRequest,
                        "binary frames are not supported",
                        None,
                    ),
                );
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    hub.disconnect(&connection_id).await;
    drop(control_tx);
    let _ = writer.await;
    tracing::info!(%peer, connection_id = %connection_id, "Client disconnected");
    Ok(())
}

/// Drains the connection's outbound queue into the socket.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    mut control: mpsc::UnboundedReceiver<WsMessage>,
) where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        let frame = tokio::select! {
            Some(message) = outbound.recv() => match message.to_json() {
                Ok(json) => WsMessage::Text(json),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode server message");
                    continue;
                }
            },
            Some(control) = control.recv() => control,
            else => break,
        };

        let closing = matches!(frame, WsMessage::Close(_));
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
