//! Low-level WebSocket connection primitive shared by every transport
//! component (single-doc, multiplexed body, unified v2).
//!
//! A connection is split into a background task that owns the socket and two
//! channels: an outgoing `mpsc` sender the caller uses to queue frames, and an
//! incoming `mpsc` receiver the caller polls (typically inside its own
//! `tokio::select!` alongside ping timers and application-level channels).
//! This mirrors the shape every component needs: none of them want to own a
//! raw `WebSocketStream` directly, since each layers its own handshake and
//! retry logic on top.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Result, SyncError};

/// A message arriving from the socket.
#[derive(Debug, Clone)]
pub enum WsEvent {
    /// A binary frame (sync protocol messages).
    Binary(Vec<u8>),
    /// A text frame (JSON control messages).
    Text(String),
    /// A pong keepalive reply.
    Pong,
    /// The server closed the connection.
    Closed,
}

#[derive(Debug)]
enum OutgoingMessage {
    Binary(Vec<u8>),
    Text(String),
    Ping,
    Close,
}

/// A handle to a live WebSocket connection.
///
/// Cloning shares the same outgoing channel and background task; only one
/// side should hold the paired `mpsc::UnboundedReceiver<WsEvent>`.
#[derive(Clone)]
pub struct WsHandle {
    outgoing: mpsc::UnboundedSender<OutgoingMessage>,
}

impl WsHandle {
    /// Connect to `url` and spawn the background read/write task.
    ///
    /// Returns the handle plus the receiver side of the incoming-event
    /// channel; the channel closes (yields `None`) when the socket closes.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<WsEvent>)> {
        log::info!("[ws] connecting to {url}");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::Transport(format!("connect failed: {e}")))?;
        let (mut write, mut read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutgoingMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<WsEvent>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Binary(data))) => {
                                if in_tx.send(WsEvent::Binary(data.into())).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Text(text))) => {
                                if in_tx.send(WsEvent::Text(text.to_string())).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Pong(_))) => {
                                let _ = in_tx.send(WsEvent::Pong);
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = in_tx.send(WsEvent::Closed);
                                break;
                            }
                            Some(Ok(Message::Frame(_))) => {}
                            Some(Err(e)) => {
                                log::warn!("[ws] read error: {e}");
                                let _ = in_tx.send(WsEvent::Closed);
                                break;
                            }
                        }
                    }
                    outgoing = out_rx.recv() => {
                        match outgoing {
                            Some(OutgoingMessage::Binary(data)) => {
                                if write.send(Message::Binary(data.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(OutgoingMessage::Text(text)) => {
                                if write.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(OutgoingMessage::Ping) => {
                                if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(OutgoingMessage::Close) | None => {
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        Ok((Self { outgoing: out_tx }, in_rx))
    }

    /// Queue a binary frame for sending.
    pub fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        self.outgoing
            .send(OutgoingMessage::Binary(data))
            .map_err(|_| SyncError::Transport("connection closed".to_string()))
    }

    /// Queue a text frame for sending.
    pub fn send_text(&self, text: String) -> Result<()> {
        self.outgoing
            .send(OutgoingMessage::Text(text))
            .map_err(|_| SyncError::Transport("connection closed".to_string()))
    }

    /// Queue a ping frame.
    pub fn send_ping(&self) -> Result<()> {
        self.outgoing
            .send(OutgoingMessage::Ping)
            .map_err(|_| SyncError::Transport("connection closed".to_string()))
    }

    /// Close the connection gracefully.
    pub fn close(&self) {
        let _ = self.outgoing.send(OutgoingMessage::Close);
    }
}
