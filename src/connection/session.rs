//! One client connection.
//!
//! The reader runs commands strictly in arrival order and queues each reply.
//! A dedicated writer owns the sink and interleaves those replies with the
//! connection's event subscription, so a slow client never blocks the
//! scheduler or other connections.

use crate::core::{KronError, Result};
use crate::dispatcher::CommandDispatcher;
use crate::events::{EventBus, Subscription};
use crate::protocol::{Action, Envelope};
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Replies waiting for the writer. The reader stalls when it is full.
const REPLY_BUFFER: usize = 64;

/// Why the read side of a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client closed the socket or the stream ended
    ClientClosed,
    /// Undecodable frame; the client got a final error reply
    ProtocolError(String),
    /// Server shutdown, or the writer gave up (send failure, overflow)
    Cancelled,
}

enum Inbound {
    Request(Envelope),
    Malformed(KronError),
    Skip,
    Close,
}

fn decode(frame: Message) -> Inbound {
    match frame {
        Message::Text(text) => match Envelope::parse(&text) {
            Ok(request) => Inbound::Request(request),
            Err(e) => Inbound::Malformed(e),
        },
        Message::Binary(bytes) => match Envelope::parse_bytes(&bytes) {
            Ok(request) => Inbound::Request(request),
            Err(e) => Inbound::Malformed(e),
        },
        Message::Close(_) => Inbound::Close,
        Message::Ping(_) | Message::Pong(_) => Inbound::Skip,
    }
}

pub struct Session {
    dispatcher: CommandDispatcher,
    bus: EventBus<Envelope>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(dispatcher: CommandDispatcher, bus: EventBus<Envelope>, shutdown: CancellationToken) -> Self {
        Self {
            dispatcher,
            bus,
            shutdown,
        }
    }

    pub async fn run(self, socket: WebSocket) -> SessionEnd {
        let (sink, stream) = socket.split();
        self.serve(sink, stream).await
    }

    /// Drives one connection over any frame stream and sink.
    ///
    /// Teardown always runs in the same order: cancel the writer,
    /// unsubscribe, then wait for the writer to flush and close.
    pub async fn serve<S, R, E>(self, sink: S, mut stream: R) -> SessionEnd
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: std::fmt::Display,
        R: Stream<Item = std::result::Result<Message, E>> + Unpin,
        E: std::fmt::Display,
    {
        let subscription = self.bus.register();
        let id = subscription.id();
        let cancel = self.shutdown.child_token();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_BUFFER);
        info!(conn_id = id, "Client connected");

        let writer = tokio::spawn(write_loop(id, sink, reply_rx, subscription, cancel.clone()));

        let end = loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                frame = stream.next() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(conn_id = id, error = %e, "Read failed");
                    break SessionEnd::ClientClosed;
                }
                None => break SessionEnd::ClientClosed,
            };

            match decode(frame) {
                Inbound::Request(request) => {
                    let reply = self.dispatcher.dispatch(&request).await;
                    if reply_tx.send(reply).await.is_err() {
                        break SessionEnd::Cancelled;
                    }
                }
                Inbound::Malformed(e) => {
                    warn!(conn_id = id, error = %e, "Closing connection on malformed message");
                    let _ = reply_tx.send(Envelope::new(Action::Response).with_error(&e)).await;
                    break SessionEnd::ProtocolError(e.to_string());
                }
                Inbound::Skip => {}
                Inbound::Close => break SessionEnd::ClientClosed,
            }
        };

        drop(reply_tx);
        cancel.cancel();
        self.bus.unsubscribe(id);
        if let Err(e) = writer.await {
            warn!(conn_id = id, error = %e, "Writer task failed");
        }

        info!(conn_id = id, reason = ?end, "Client disconnected");
        end
    }
}

async fn write_loop<S>(
    id: u64,
    mut sink: S,
    mut replies: mpsc::Receiver<Envelope>,
    events: Subscription<Envelope>,
    cancel: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let outbound = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    debug!(conn_id = id, "Subscription closed");
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        };

        if let Err(e) = send(&mut sink, &outbound).await {
            debug!(conn_id = id, error = %e, "Write failed");
            cancel.cancel();
            return;
        }
    }

    // Replies queued before teardown still go out, ahead of the close frame.
    while let Ok(reply) = replies.try_recv() {
        if send(&mut sink, &reply).await.is_err() {
            break;
        }
    }

    cancel.cancel();
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn send<S>(sink: &mut S, envelope: &Envelope) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = envelope.to_json()?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| KronError::Protocol(format!("send failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchAccumulator;
    use crate::events::OverflowPolicy;
    use crate::facade::KronDB;
    use crate::store::RecordStore;
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;
    use std::time::Duration;

    struct Harness {
        bus: EventBus<Envelope>,
        shutdown: CancellationToken,
        inbound: fmpsc::UnboundedSender<std::result::Result<Message, Infallible>>,
        outbound: fmpsc::UnboundedReceiver<Message>,
        session: tokio::task::JoinHandle<SessionEnd>,
    }

    fn start() -> Harness {
        start_with(8, OverflowPolicy::DropOldest)
    }

    fn start_with(capacity: usize, policy: OverflowPolicy) -> Harness {
        let db = KronDB::new();
        let dispatcher = CommandDispatcher::new(RecordStore::new(db.clone()), BatchAccumulator::new(db));
        let bus = EventBus::new(capacity, policy);
        let shutdown = CancellationToken::new();

        let (inbound, stream) = fmpsc::unbounded();
        let (sink, outbound) = fmpsc::unbounded();
        let session = Session::new(dispatcher, bus.clone(), shutdown.clone());
        let session = tokio::spawn(session.serve(sink, stream));

        Harness {
            bus,
            shutdown,
            inbound,
            outbound,
            session,
        }
    }

    fn text(json: &str) -> std::result::Result<Message, Infallible> {
        Ok(Message::Text(json.to_string()))
    }

    async fn next_envelope(outbound: &mut fmpsc::UnboundedReceiver<Message>) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(2), outbound.next())
            .await
            .unwrap()
            .unwrap();
        match frame {
            Message::Text(text) => Envelope::parse(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    async fn wait_for_subscriber(bus: &EventBus<Envelope>) {
        for _ in 0..100 {
            if bus.subscriber_count() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never subscribed");
    }

    #[tokio::test]
    async fn test_replies_keep_command_order() {
        let mut h = start();
        h.inbound.unbounded_send(text(r#"{"action":"SET","key":"a","data":"1","id":1}"#)).unwrap();
        h.inbound.unbounded_send(text(r#"{"action":"GET","key":"a","id":2}"#)).unwrap();

        let first = next_envelope(&mut h.outbound).await;
        assert_eq!(first.action, Action::Response);
        assert_eq!(first.id, Some(serde_json::json!(1)));

        let second = next_envelope(&mut h.outbound).await;
        assert_eq!(second.action, Action::Get);
        assert_eq!(second.data.as_deref(), Some("1"));

        h.inbound.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(h.session.await.unwrap(), SessionEnd::ClientClosed);
        assert_eq!(h.bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_events_are_pushed() {
        let mut h = start();
        wait_for_subscriber(&h.bus).await;

        let mut event = Envelope::new(Action::Cron);
        event.key = Some("job".into());
        assert_eq!(h.bus.publish(event), 1);

        let pushed = next_envelope(&mut h.outbound).await;
        assert_eq!(pushed.action, Action::Cron);
        assert_eq!(pushed.key.as_deref(), Some("job"));

        h.shutdown.cancel();
        assert_eq!(h.session.await.unwrap(), SessionEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_overflow_disconnect_ends_session() {
        let mut h = start_with(1, OverflowPolicy::Disconnect);
        wait_for_subscriber(&h.bus).await;

        // No await in between, so the writer cannot drain the first one
        assert_eq!(h.bus.publish(Envelope::new(Action::Cron)), 1);
        assert_eq!(h.bus.publish(Envelope::new(Action::Cron)), 0);
        assert_eq!(h.bus.subscriber_count(), 0);

        let end = tokio::time::timeout(Duration::from_secs(2), h.session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(h.bus.subscriber_count(), 0);

        // The event queued before the overflow still goes out, then the close
        assert_eq!(next_envelope(&mut h.outbound).await.action, Action::Cron);
        let last = h.outbound.next().await;
        assert!(matches!(last, Some(Message::Close(_))));
    }

    #[tokio::test]
    async fn test_malformed_message_closes_connection() {
        let mut h = start();
        h.inbound.unbounded_send(text("{not json")).unwrap();

        let reply = next_envelope(&mut h.outbound).await;
        assert_eq!(reply.action, Action::Response);
        assert!(reply.error.unwrap().contains("malformed"));

        let end = h.session.await.unwrap();
        assert!(matches!(end, SessionEnd::ProtocolError(_)));
        assert_eq!(h.bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_command_errors_keep_connection_open() {
        let mut h = start();
        h.inbound.unbounded_send(text(r#"{"action":"GET","key":"missing"}"#)).unwrap();
        let reply = next_envelope(&mut h.outbound).await;
        assert_eq!(reply.action, Action::Get);
        assert!(reply.error.is_some());

        h.inbound.unbounded_send(text(r#"{"action":"KEYS"}"#)).unwrap();
        let reply = next_envelope(&mut h.outbound).await;
        assert_eq!(reply.data.as_deref(), Some("[]"));

        drop(h.inbound);
        assert_eq!(h.session.await.unwrap(), SessionEnd::ClientClosed);
    }
}
