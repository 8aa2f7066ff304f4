//! One WebSocket connection lifetime.
//!
//! A `Session` owns exactly one transport connection. The read half runs in a
//! spawned task that decodes inbound frames through the [`Protocol`] and
//! forwards them to the manager as [`SessionEvent`]s; the write half runs in a
//! second task fed by an mpsc channel whose sender is published through the
//! shared [`WriterSlot`]. Sessions never reconnect themselves. They report how
//! they ended and let the supervisor decide.

use {
    futures::{SinkExt, StreamExt},
    std::sync::Arc,
    std::sync::atomic::{AtomicU64, Ordering},
    tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex},
    tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    tokio_tungstenite::{
        connect_async,
        tungstenite::{
            client::IntoClientRequest,
            http::header::{HeaderValue, ORIGIN, USER_AGENT},
            protocol::{frame::coding::CloseCode as WsCloseCode, CloseFrame},
            Bytes, Message, Utf8Bytes,
        },
    },
    tracing::{debug, trace, warn},
};

use crate::error::GatewayError;

/// Payload flavor for an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Frames the writer task knows how to put on the wire.
#[derive(Debug)]
pub enum OutboundFrame {
    Message { kind: FrameKind, body: String },
    Close { code: u16, reason: &'static str },
}

/// Shared handle to the writer of the live connection, if any. Cleared when
/// the connection ends so late sends surface as "no active connection" rather
/// than writes into a dead socket.
pub type WriterSlot = Arc<AsyncMutex<Option<mpsc::Sender<OutboundFrame>>>>;

/// Decodes inbound text frames into typed protocol events.
///
/// Implementations hold whatever per-connection state decoding needs behind
/// interior mutability; `decode` is called from the read task only.
pub trait Protocol: Send + Sync + 'static {
    type Event: Clone + Send + 'static;

    fn decode(&self, text: &str) -> Result<Self::Event, DecodeFailure>;
}

/// A frame that could not be turned into a protocol event. The session logs
/// it and keeps reading.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {0}")]
pub struct DecodeFailure(#[from] serde_json::Error);

/// How a session ended, as seen from the read side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Server sent a close frame, possibly with a code.
    Closed(Option<u16>),
    /// Transport-level failure while reading.
    TransportError(String),
    /// The stream ended without a close frame.
    StreamEnded,
}

/// What a session reports to its manager.
#[derive(Debug)]
pub enum SessionEvent<E> {
    /// The transport handshake completed and the writer is installed.
    Opened { connection_id: u64 },
    /// A decoded inbound protocol event.
    Inbound { connection_id: u64, event: E },
    /// A frame the protocol could not decode. Reported out-of-band; the
    /// connection stays up.
    DecodeFailed {
        connection_id: u64,
        error: String,
        raw: String,
    },
    /// The connection is gone. Exactly one of these per session.
    Ended {
        connection_id: u64,
        reason: CloseReason,
    },
}

/// Connection-time knobs the session needs from the manager config.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub user_agent: String,
    pub origin: Option<String>,
}

/// Opens the transport, installs the writer, and spawns the read and write
/// tasks. Returns once the handshake has completed (or failed); everything
/// after that flows through `events`.
pub async fn open<P: Protocol>(
    url: &str,
    options: &ConnectOptions,
    protocol: Arc<P>,
    connection_id: u64,
    live_connection: Arc<AtomicU64>,
    writer: WriterSlot,
    events: mpsc::Sender<SessionEvent<P::Event>>,
) -> Result<(), GatewayError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| GatewayError::Connect(e.to_string()))?;
    request.headers_mut().insert(
        USER_AGENT,
        HeaderValue::from_str(&options.user_agent)
            .map_err(|e| GatewayError::Connect(e.to_string()))?,
    );
    if let Some(origin) = &options.origin {
        request.headers_mut().insert(
            ORIGIN,
            HeaderValue::from_str(origin).map_err(|e| GatewayError::Connect(e.to_string()))?,
        );
    }

    let (stream, _response) = connect_async(request)
        .await
        .map_err(|e| GatewayError::Connect(e.to_string()))?;
    // A newer connection may have been minted while the handshake ran; this
    // one must not install itself over it.
    if live_connection.load(Ordering::Relaxed) != connection_id {
        debug!(connection_id, "connection superseded during handshake, discarding");
        return Ok(());
    }
    let (mut sink, mut source) = stream.split();

    let (writer_tx, mut writer_rx) = mpsc::channel::<OutboundFrame>(32);
    {
        let mut slot = writer.lock().await;
        *slot = Some(writer_tx);
    }

    tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            let message = match frame {
                OutboundFrame::Message {
                    kind: FrameKind::Text,
                    body,
                } => Message::Text(Utf8Bytes::from(body)),
                OutboundFrame::Message {
                    kind: FrameKind::Binary,
                    body,
                } => Message::Binary(Bytes::from(body.into_bytes())),
                OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
                    code: WsCloseCode::from(code),
                    reason: Utf8Bytes::from_static(reason),
                })),
            };
            let was_close = matches!(message, Message::Close(_));
            if let Err(err) = sink.send(message).await {
                // The read side observes the same failure and drives
                // reconnection; nothing more to do here.
                debug!(connection_id, error = %err, "gateway write failed");
                break;
            }
            if was_close {
                break;
            }
        }
    });

    if events
        .send(SessionEvent::Opened { connection_id })
        .await
        .is_err()
    {
        return Ok(());
    }

    tokio::spawn(async move {
        let reason = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => match protocol.decode(text.as_str()) {
                    Ok(event) => {
                        if events
                            .send(SessionEvent::Inbound {
                                connection_id,
                                event,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(connection_id, error = %err, "undecodable gateway frame");
                        if events
                            .send(SessionEvent::DecodeFailed {
                                connection_id,
                                error: err.to_string(),
                                raw: text.to_string(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    break CloseReason::Closed(code);
                }
                // Pings are answered by the transport layer; other frame
                // kinds carry nothing for us.
                Some(Ok(other)) => trace!(connection_id, ?other, "ignoring non-text frame"),
                Some(Err(err)) => break CloseReason::TransportError(err.to_string()),
                None => break CloseReason::StreamEnded,
            }
        };

        // Only the still-live connection may retract the writer; a newer
        // session may have already replaced it.
        if live_connection.load(Ordering::Relaxed) == connection_id {
            let mut slot = writer.lock().await;
            *slot = None;
        }
        debug!(connection_id, ?reason, "gateway session ended");
        let _ = events
            .send(SessionEvent::Ended {
                connection_id,
                reason,
            })
            .await;
    });

    Ok(())
}

/// Broadcast-backed stream of protocol events handed to subscribers.
///
/// A slow subscriber that falls behind the channel capacity loses the oldest
/// events; the stream skips the lag marker and keeps going instead of ending.
pub struct EventStream<E> {
    rx: BroadcastStream<E>,
}

impl<E: Clone + Send + 'static> EventStream<E> {
    pub fn new(rx: broadcast::Receiver<E>) -> Self {
        Self {
            rx: BroadcastStream::new(rx),
        }
    }

    /// Receives the next event, skipping over any lag gaps.
    pub async fn next(&mut self) -> Option<E> {
        loop {
            match StreamExt::next(&mut self.rx).await {
                Some(Ok(event)) => return Some(event),
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(missed, "event subscriber lagged, skipping ahead");
                }
                None => return None,
            }
        }
    }
}

impl<E> std::fmt::Debug for EventStream<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_stream_skips_lag() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = EventStream::new(rx);
        for i in 0..5u32 {
            tx.send(i).unwrap();
        }
        // Oldest events fell out of the ring; the stream resumes at the
        // earliest survivor instead of erroring.
        assert_eq!(stream.next().await, Some(3));
        assert_eq!(stream.next().await, Some(4));
    }

    #[tokio::test]
    async fn event_stream_ends_when_sender_drops() {
        let (tx, rx) = broadcast::channel::<u32>(2);
        let mut stream = EventStream::new(rx);
        drop(tx);
        assert_eq!(stream.next().await, None);
    }
}
