//! Per-connection tasks.
//!
//! An upgraded socket is split in two. The read half feeds the hub's
//! broadcast channel; the write half drains the connection's outbound
//! queue. They run as separate tasks so a slow write never stalls reads and
//! a pending read never stalls writes. The pumps are generic over
//! `Stream`/`Sink` so tests can drive them without a network.

use std::{borrow::Cow, fmt};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::hub::{ConnectionId, Hub, Payload, Registration};

/// Registers a freshly upgraded socket with the hub and starts its pumps.
pub async fn serve_socket(socket: WebSocket, hub: Hub) {
    let Registration { id, queue } = match hub.register().await {
        Ok(registration) => registration,
        Err(err) => {
            warn!(error = %err, "dropping websocket, hub unavailable");
            return;
        }
    };

    let (sink, stream) = socket.split();
    let (writer_done_tx, writer_done_rx) = oneshot::channel();

    tokio::spawn(write_pump(sink, queue, id, writer_done_tx));
    tokio::spawn(read_pump(stream, hub, id, writer_done_rx));
}

/// Why a read pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEnd {
    /// The peer sent a close frame, with its status code if it gave one.
    Closed(Option<u16>),
    /// The stream ended without a close frame.
    Abnormal,
    /// The transport reported an error.
    Failed(String),
    /// The write half of this connection is gone.
    WriterStopped,
    /// The hub stopped accepting broadcasts.
    HubClosed,
}

impl ReadEnd {
    /// Whether this is an ordinary way for a client to leave.
    pub fn is_expected(&self) -> bool {
        match self {
            ReadEnd::Closed(None) | ReadEnd::Abnormal | ReadEnd::WriterStopped => true,
            ReadEnd::Closed(Some(code)) => matches!(*code, close_code::NORMAL | close_code::AWAY),
            ReadEnd::Failed(_) | ReadEnd::HubClosed => false,
        }
    }
}

/// Why a write pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEnd {
    /// The hub closed the outbound queue.
    QueueClosed,
    /// Writing to the socket failed.
    Failed(String),
}

/// Forwards every data frame from `stream` to the hub until the peer goes
/// away, the transport fails, or the write half finishes.
///
/// Always ends with exactly one unregister request for `id`.
pub async fn read_pump<S, E>(
    mut stream: S,
    hub: Hub,
    id: ConnectionId,
    mut writer_done: oneshot::Receiver<()>,
) -> ReadEnd
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let end = loop {
        let next = select! {
            biased;
            _ = &mut writer_done => break ReadEnd::WriterStopped,
            next = stream.next() => next,
        };

        let payload = match next {
            Some(Ok(Message::Text(text))) => Payload::from(text),
            Some(Ok(Message::Binary(bytes))) => Payload::from(bytes),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                break ReadEnd::Closed(frame.map(|frame| frame.code));
            }
            Some(Err(err)) => break ReadEnd::Failed(err.to_string()),
            None => break ReadEnd::Abnormal,
        };

        if hub.broadcast(id, payload).await.is_err() {
            break ReadEnd::HubClosed;
        }
    };

    if end.is_expected() {
        debug!(connection = %id, reason = ?end, "read side finished");
    } else {
        warn!(connection = %id, reason = ?end, "connection closed unexpectedly");
    }

    if let Err(err) = hub.unregister(id).await {
        debug!(connection = %id, error = %err, "unregister skipped");
    }
    drop(stream);

    end
}

/// Writes queued payloads to `sink` in order until the hub closes the
/// queue or a write fails. Dropping `writer_done` on return tells the read
/// pump to stop.
pub async fn write_pump<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Payload>,
    id: ConnectionId,
    writer_done: oneshot::Sender<()>,
) -> WriteEnd
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let end = loop {
        match queue.recv().await {
            Some(payload) => {
                if let Err(err) = sink.send(Message::from(payload)).await {
                    break WriteEnd::Failed(err.to_string());
                }
            }
            None => {
                // Best effort; the peer may already be gone.
                if let Err(err) = sink.send(normal_close()).await {
                    debug!(connection = %id, error = %err, "close frame not delivered");
                }
                break WriteEnd::QueueClosed;
            }
        }
    };

    debug!(connection = %id, reason = ?end, "write side finished");
    drop(sink);
    drop(writer_done);

    end
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Cow::Borrowed(""),
    }))
}

// axum 0.7 frames own their data, so this copies once per recipient.
impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text.to_string()),
            Payload::Binary(bytes) => Message::Binary(bytes.to_vec()),
        }
    }
}
