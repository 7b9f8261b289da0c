//! WebSocket connector backed by tokio-tungstenite

use bytes::Bytes;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use super::{Connector, PendingLink, SocketEvent, SocketLink, WireMessage};
use crate::error::TransportError;

/// Opens WebSocket connections and pumps them through a [`SocketLink`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: &str) -> Result<PendingLink, TransportError> {
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionUnavailable(format!("{}: {}", url, e)))?;

        Ok(async move {
            let (socket, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            let (mut write, mut read) = socket.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

            tokio::spawn(async move {
                while let Some(message) = out_rx.recv().await {
                    let message = match message {
                        WireMessage::Binary(data) => Message::Binary(data.to_vec()),
                        WireMessage::Text(text) => Message::Text(text),
                    };
                    if let Err(e) = write.send(message).await {
                        tracing::debug!("WebSocket write failed: {}", e);
                        break;
                    }
                }
                // Sender dropped: the channel wants the socket closed
                let _ = write.close().await;
            });

            tokio::spawn(async move {
                while let Some(item) = read.next().await {
                    let event = match item {
                        Ok(Message::Binary(data)) => {
                            SocketEvent::Message(WireMessage::Binary(Bytes::from(data)))
                        }
                        Ok(Message::Text(text)) => SocketEvent::Message(WireMessage::Text(text)),
                        Ok(Message::Close(frame)) => {
                            tracing::debug!("Peer closed the socket: {:?}", frame);
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                            break;
                        }
                    };
                    if in_tx.send(event).is_err() {
                        break;
                    }
                }
            });

            Ok(SocketLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
        .boxed())
    }
}
