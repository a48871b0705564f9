//! Control channel: one WebSocket connection bound to one session.
//!
//! The socket is split into a writer task that drains an ordered outbound
//! queue and a reader task that decodes inbound frames. `send` only encodes
//! and enqueues, so callers never wait on socket I/O.

use futures_util::{SinkExt, StreamExt};
use rgate_core::{codec, Envelope, GatewayError, GatewayResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maximum inbound frame size (1 MiB).
const MAX_FRAME_SIZE: usize = 1_048_576;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Why a channel stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Peer sent a Close frame with code 1000.
    Normal,
    /// Abnormal close code, read error, or EOF without a Close frame.
    Abnormal,
    /// Closed from our side.
    Local,
}

/// What the reader task delivers, in receipt order.
#[derive(Debug)]
pub enum ChannelEvent {
    Envelope(Envelope),
    /// A frame that failed to decode. Only this frame is rejected.
    Rejected {
        id: Option<String>,
        error: GatewayError,
    },
    /// Always the last event.
    Closed(CloseCause),
}

struct Shared {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Cloneable sending side of a control channel.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Encode and enqueue an envelope. Envelopes hit the wire in the order
    /// they were enqueued.
    pub fn send(&self, envelope: &Envelope) -> GatewayResult<()> {
        if self.is_closed() {
            return Err(GatewayError::ChannelClosed);
        }
        let text = codec::encode_text(envelope)?;
        self.inner
            .tx
            .send(Message::Text(text))
            .map_err(|_| GatewayError::ChannelClosed)
    }

    /// Close the channel. Idempotent; the socket is released exactly once
    /// by the writer task.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(channel_id = self.inner.id, "closing control channel");
        }
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the channel is closed from either side.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }
}

/// Take ownership of an upgraded WebSocket and start its I/O tasks.
pub fn spawn<S>(ws: WebSocketStream<S>) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(256);

    let shared = Arc::new(Shared {
        id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
        tx,
        closed: AtomicBool::new(false),
        cancel: CancellationToken::new(),
    });
    let handle = ChannelHandle {
        inner: shared.clone(),
    };
    let channel_id = shared.id;

    // Writer: owns the sink, drains the queue in order, closes exactly once.
    let writer_cancel = shared.cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = sink.send(msg).await {
                        debug!(channel_id, error = %e, "control channel write failed");
                        break;
                    }
                }
                () = writer_cancel.cancelled() => {
                    // Flush what was enqueued before the close.
                    while let Ok(msg) = rx.try_recv() {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        writer_cancel.cancel();
        if let Err(e) = sink.close().await {
            debug!(channel_id, error = %e, "control channel close failed");
        }
        debug!(channel_id, "control channel socket released");
    });

    // Reader: decodes frames and reports how the channel ended.
    let reader_shared = shared;
    tokio::spawn(async move {
        let cause = loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                () = reader_shared.cancel.cancelled() => break CloseCause::Local,
            };
            let data = match frame {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame.as_ref().is_some_and(|f| f.code == CloseCode::Normal);
                    break if normal { CloseCause::Normal } else { CloseCause::Abnormal };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(channel_id, error = %e, "control channel read failed");
                    break CloseCause::Abnormal;
                }
                None => break CloseCause::Abnormal,
            };

            let event = if data.len() > MAX_FRAME_SIZE {
                ChannelEvent::Rejected {
                    id: None,
                    error: GatewayError::Decode(format!(
                        "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                        data.len()
                    )),
                }
            } else {
                match codec::decode(&data) {
                    Ok(envelope) => ChannelEvent::Envelope(envelope),
                    Err(error) => {
                        warn!(channel_id, error = %error, "rejected inbound frame");
                        ChannelEvent::Rejected {
                            id: codec::peek_id(&data),
                            error,
                        }
                    }
                }
            };
            if event_tx.send(event).await.is_err() {
                break CloseCause::Local;
            }
        };

        let was_closed = reader_shared.closed.swap(true, Ordering::AcqRel);
        reader_shared.cancel.cancel();
        let cause = if was_closed { CloseCause::Local } else { cause };
        debug!(channel_id, ?cause, "control channel reader finished");
        let _ = event_tx.send(ChannelEvent::Closed(cause)).await;
    });

    (handle, event_rx)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rgate_core::{MsgType, Payload};
    use serde_json::{json, Map};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};

    /// A server-side channel plus the raw client end of the same socket.
    pub(crate) async fn pair() -> (
        ChannelHandle,
        mpsc::Receiver<ChannelEvent>,
        WebSocketStream<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        let (handle, events) = spawn(server);
        (handle, events, client)
    }

    pub(crate) async fn next_envelope(client: &mut WebSocketStream<DuplexStream>) -> Envelope {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return codec::decode(text.as_bytes()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn outbound_preserves_enqueue_order() {
        let (handle, _events, mut client) = pair().await;
        for i in 0..20 {
            handle
                .send(&Envelope::response(i.to_string(), json!(i)))
                .unwrap();
        }
        for i in 0..20 {
            let env = next_envelope(&mut client).await;
            assert_eq!(env.id, Some(i.to_string()));
        }
    }

    #[tokio::test]
    async fn inbound_frames_are_decoded_in_order() {
        let (_handle, mut events, mut client) = pair().await;
        for op in ["a", "b", "c"] {
            let env = Envelope::request(op, op, Map::new());
            client
                .send(Message::Text(codec::encode_text(&env).unwrap()))
                .await
                .unwrap();
        }
        for op in ["a", "b", "c"] {
            match events.recv().await.unwrap() {
                ChannelEvent::Envelope(env) => {
                    assert_eq!(env.msg_type, MsgType::Request);
                    assert!(matches!(env.payload, Payload::Request(ref p) if p.op == op));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn bad_frame_is_rejected_without_closing() {
        let (handle, mut events, mut client) = pair().await;
        client
            .send(Message::Text(r#"{"type":"teleport","id":"9"}"#.into()))
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            ChannelEvent::Rejected { id, error } => {
                assert_eq!(id.as_deref(), Some("9"));
                assert!(matches!(error, GatewayError::UnknownType(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn normal_close_from_peer_is_reported() {
        let (handle, mut events, mut client) = pair().await;
        client
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            })))
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Closed(CloseCause::Normal)
        ));
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(&Envelope::pong(None)),
            Err(GatewayError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn dropped_peer_is_abnormal() {
        let (_handle, mut events, client) = pair().await;
        drop(client);
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Closed(CloseCause::Abnormal)
        ));
    }

    #[tokio::test]
    async fn local_close_is_idempotent_and_flushes() {
        let (handle, mut events, mut client) = pair().await;
        handle.send(&Envelope::event("last", Map::new())).unwrap();
        handle.close();
        handle.close();
        handle.closed().await;

        let env = next_envelope(&mut client).await;
        assert!(matches!(env.payload, Payload::Event(ref e) if e.event == "last"));

        // Exactly one Close frame, then the stream ends.
        let mut closes = 0;
        while let Some(frame) = client.next().await {
            match frame {
                Ok(Message::Close(_)) => closes += 1,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert_eq!(closes, 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Closed(CloseCause::Local)
        ));
    }

    #[tokio::test]
    async fn malformed_outbound_is_refused_before_enqueue() {
        let (handle, _events, _client) = pair().await;
        let mut env = Envelope::response("1", json!(null));
        env.id = None;
        assert!(matches!(
            handle.send(&env),
            Err(GatewayError::MalformedMessage(_))
        ));
    }
}
