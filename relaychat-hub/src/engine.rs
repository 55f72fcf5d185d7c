//! Relay engine
//!
//! Owns the message log and the connection registry behind one async mutex.
//! Every operation that reads or mutates either structure runs inside that
//! critical section:
//!
//! - `attach`: snapshot the log, enqueue `init` on the new connection, then
//!   register it. A message is either in the snapshot or broadcast to the
//!   connection afterwards, never both and never neither.
//! - `submit`: assign id and timestamp, append, broadcast `new_message`.
//!   Appends and broadcasts happen in one order for everyone, and each
//!   connection's outbound queue is FIFO, so every peer sees the log order.
//!
//! Per-connection I/O never happens under the lock; the engine only pushes
//! onto in-memory queues that the transport drains.

use std::sync::Arc;

use relaychat_core::config::RelayConfig;
use relaychat_core::{Error, LogStore, Result};
use relaychat_proto::{encode_server_frame, InboundFrame, Message, ServerFrame, Side};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame};

/// What to do with a message whose durable write failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistFailurePolicy {
    /// Keep it in memory and relay it to live peers anyway
    #[default]
    Relay,
    /// Keep it in memory but do not relay it
    Suppress,
}

/// Engine behavior knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayPolicy {
    pub persist_failure: PersistFailurePolicy,
}

impl From<&RelayConfig> for RelayPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            persist_failure: if config.broadcast_on_persist_failure {
                PersistFailurePolicy::Relay
            } else {
                PersistFailurePolicy::Suppress
            },
        }
    }
}

/// Result of accepting one chat message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Whether the durable write succeeded
    pub persisted: bool,
    /// Number of connections the `new_message` frame was queued for
    pub delivered: usize,
}

struct RelayState {
    store: LogStore,
    registry: ConnectionRegistry,
}

/// Shared handle to the relay. Cheap to clone.
#[derive(Clone)]
pub struct RelayEngine {
    state: Arc<Mutex<RelayState>>,
    policy: RelayPolicy,
    shutdown: CancellationToken,
}

impl RelayEngine {
    #[must_use]
    pub fn new(store: LogStore, policy: RelayPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                store,
                registry: ConnectionRegistry::new(),
            })),
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    /// Attach a freshly accepted connection.
    ///
    /// Queues the `init` frame with the current log and registers the
    /// connection in one critical section. Returns the snapshot size.
    pub async fn attach(&self, handle: ConnectionHandle) -> Result<usize> {
        let mut state = self.state.lock().await;

        // Checked under the lock so a concurrent shutdown cannot miss us.
        if self.shutdown.is_cancelled() {
            handle.mark_closed();
            return Err(Error::Transport("relay is shutting down".to_string()));
        }

        let messages = state.store.snapshot();
        let count = messages.len();
        let init = encode(&ServerFrame::Init { messages })?;

        handle.send(init)?;
        debug!(connection_id = %handle.id(), snapshot_len = count, "Sent init snapshot");
        state.registry.register(handle);

        Ok(count)
    }

    /// Remove a connection from the live set. Unknown ids are ignored.
    pub async fn detach(&self, connection_id: &str) {
        let mut state = self.state.lock().await;
        state.registry.unregister(connection_id);
    }

    /// Dispatch one decoded inbound frame from `connection_id`.
    ///
    /// Unrecognized frames are logged and dropped; the connection stays open.
    pub async fn handle_frame(&self, connection_id: &str, frame: InboundFrame) -> Option<Delivery> {
        match frame {
            InboundFrame::Chat { sender, text } => {
                debug!(connection_id = %connection_id, sender = %sender, "Chat frame received");
                Some(self.submit(sender, text).await)
            }
            InboundFrame::Unrecognized { reason } => {
                let err = Error::Protocol(reason);
                warn!(
                    connection_id = %connection_id,
                    error = %err,
                    "Dropping unrecognized frame"
                );
                None
            }
        }
    }

    /// Accept a chat message: stamp it, append it, relay it to every live
    /// connection (the originator included).
    pub async fn submit(&self, sender: Side, text: String) -> Delivery {
        let mut state = self.state.lock().await;

        // Never step backwards, even if the wall clock does.
        let now = chrono::Utc::now().timestamp_millis();
        let timestamp = state.store.last_timestamp().map_or(now, |last| now.max(last));
        let message = Message::new(sender, text, timestamp);

        let persisted = match state.store.append(message.clone()).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    message_id = %message.id,
                    error = %e,
                    kind = e.kind(),
                    "Failed to persist message; in-memory log and disk have diverged"
                );
                false
            }
        };

        let delivered = if persisted || self.policy.persist_failure == PersistFailurePolicy::Relay {
            match encode(&ServerFrame::NewMessage {
                message: message.clone(),
            }) {
                Ok(frame) => state.registry.broadcast(&frame, None),
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "Failed to encode new_message frame");
                    0
                }
            }
        } else {
            warn!(message_id = %message.id, "Not relaying message that failed to persist");
            0
        };

        info!(
            message_id = %message.id,
            sender = %message.sender,
            persisted,
            delivered,
            "Message accepted"
        );

        Delivery {
            message,
            persisted,
            delivered,
        }
    }

    /// Close every live connection and refuse new attaches.
    /// Returns how many connections were closed.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        let closed = state.registry.clear();
        info!(closed_connections = closed, "Relay engine shut down");
        closed
    }

    /// Cancelled once `shutdown` starts; connection tasks select on it
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.state.lock().await.store.snapshot()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    pub async fn message_count(&self) -> usize {
        self.state.lock().await.store.len()
    }

    #[must_use]
    pub const fn policy(&self) -> RelayPolicy {
        self.policy
    }
}

fn encode(frame: &ServerFrame) -> Result<OutboundFrame> {
    Ok(Arc::from(encode_server_frame(frame)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OutboundReceiver;
    use relaychat_proto::MessageId;
    use std::collections::HashSet;

    async fn engine_in(dir: &tempfile::TempDir, policy: RelayPolicy) -> RelayEngine {
        let store = LogStore::open(dir.path().join("messages.json")).await;
        RelayEngine::new(store, policy)
    }

    async fn attach(engine: &RelayEngine) -> (String, OutboundReceiver) {
        let (handle, rx) = ConnectionHandle::new();
        let id = handle.id().to_string();
        engine.attach(handle).await.unwrap();
        (id, rx)
    }

    fn next_frame(rx: &mut OutboundReceiver) -> ServerFrame {
        let raw = rx.try_recv().expect("expected a queued frame");
        serde_json::from_str(&raw).unwrap()
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            frames.push(serde_json::from_str(&raw).unwrap());
        }
        frames
    }

    fn expect_init(frame: ServerFrame) -> Vec<Message> {
        match frame {
            ServerFrame::Init { messages } => messages,
            other => panic!("expected init, got {other:?}"),
        }
    }

    fn expect_new(frame: ServerFrame) -> Message {
        match frame {
            ServerFrame::NewMessage { message } => message,
            other => panic!("expected new_message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_both_connections_receive_new_message() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir, RelayPolicy::default()).await;

        let (id1, mut rx1) = attach(&engine).await;
        let (_id2, mut rx2) = attach(&engine).await;
        assert!(expect_init(next_frame(&mut rx1)).is_empty());
        assert!(expect_init(next_frame(&mut rx2)).is_empty());

        let before = chrono::Utc::now().timestamp_millis();
        let delivery = engine
            .handle_frame(
                &id1,
                InboundFrame::Chat {
                    sender: Side::Left,
                    text: "hi".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(delivery.persisted);
        assert_eq!(delivery.delivered, 2);

        let m1 = expect_new(next_frame(&mut rx1));
        let m2 = expect_new(next_frame(&mut rx2));
        assert_eq!(m1, m2);
        assert_eq!(m1.sender, Side::Left);
        assert_eq!(m1.text, "hi");
        assert!(!m1.id.as_str().is_empty());
        assert!(m1.timestamp >= before);
    }

    #[tokio::test]
    async fn test_late_attach_receives_history_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir, RelayPolicy::default()).await;

        let mut sent = Vec::new();
        for (side, text) in [(Side::Left, "one"), (Side::Right, "two"), (Side::Left, "three")] {
            sent.push(engine.submit(side, text.to_string()).await.message);
        }

        let (handle, mut rx) = ConnectionHandle::new();
        assert_eq!(engine.attach(handle).await.unwrap(), 3);

        assert_eq!(expect_init(next_frame(&mut rx)), sent);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_self_delivery_after_peer_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir, RelayPolicy::default()).await;

        let (id1, rx1) = attach(&engine).await;
        let (id2, mut rx2) = attach(&engine).await;
        drain(&mut rx2);

        drop(rx1);
        engine.detach(&id1).await;
        assert_eq!(engine.connection_count().await, 1);

        let delivery = engine
            .handle_frame(
                &id2,
                InboundFrame::Chat {
                    sender: Side::Right,
                    text: "anyone?".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(delivery.delivered, 1);
        assert_eq!(expect_new(next_frame(&mut rx2)).text, "anyone?");
    }

    #[tokio::test]
    async fn test_unrecognized_frame_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir, RelayPolicy::default()).await;
        let (id, mut rx) = attach(&engine).await;
        drain(&mut rx);

        let result = engine
            .handle_frame(
                &id,
                InboundFrame::Unrecognized {
                    reason: "unknown variant `typing`".to_string(),
                },
            )
            .await;

        assert!(result.is_none());
        assert_eq!(engine.message_count().await, 0);
        assert_eq!(engine.connection_count().await, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_peer_does_not_block_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir, RelayPolicy::default()).await;

        let (_dead_id, dead_rx) = attach(&engine).await;
        let (_live_id, mut live_rx) = attach(&engine).await;
        drain(&mut live_rx);
        drop(dead_rx);

        let delivery = engine.submit(Side::Left, "still here".to_string()).await;
        assert_eq!(delivery.delivered, 1);
        assert_eq!(expect_new(next_frame(&mut live_rx)).text, "still here");
        assert_eq!(engine.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_share_one_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir, RelayPolicy::default()).await;

        let (_a, mut rx_a) = attach(&engine).await;
        let (_b, mut rx_b) = attach(&engine).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let mut tasks = Vec::new();
        for i in 0..40 {
            let engine = engine.clone();
            let side = if i % 2 == 0 { Side::Left } else { Side::Right };
            tasks.push(tokio::spawn(async move {
                engine.submit(side, format!("msg {i}")).await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let log = engine.snapshot().await;
        assert_eq!(log.len(), 40);
        assert!(log.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let log_ids: Vec<MessageId> = log.iter().map(|m| m.id.clone()).collect();
        let seen_a: Vec<MessageId> = drain(&mut rx_a).into_iter().map(|f| expect_new(f).id).collect();
        let seen_b: Vec<MessageId> = drain(&mut rx_b).into_iter().map(|f| expect_new(f).id).collect();
        assert_eq!(seen_a, log_ids);
        assert_eq!(seen_b, log_ids);
    }

    #[tokio::test]
    async fn test_attach_during_traffic_sees_each_message_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir, RelayPolicy::default()).await;

        let writer = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for i in 0..60 {
                    engine.submit(Side::Left, format!("n{i}")).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut attached = Vec::new();
        for _ in 0..5 {
            tokio::task::yield_now().await;
            attached.push(attach(&engine).await.1);
        }
        writer.await.unwrap();

        let log_ids: Vec<MessageId> = engine.snapshot().await.into_iter().map(|m| m.id).collect();

        for mut rx in attached {
            let mut frames = drain(&mut rx).into_iter();
            let mut seen: Vec<MessageId> = expect_init(frames.next().unwrap())
                .into_iter()
                .map(|m| m.id)
                .collect();
            seen.extend(frames.map(|f| expect_new(f).id));

            let unique: HashSet<_> = seen.iter().cloned().collect();
            assert_eq!(unique.len(), seen.len(), "a message was delivered twice");
            assert_eq!(seen, log_ids);
        }
    }

    #[tokio::test]
    async fn test_persist_failure_relays_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let store = LogStore::open(blocker.join("messages.json")).await;
        let engine = RelayEngine::new(store, RelayPolicy::default());

        let (_id, mut rx) = attach(&engine).await;
        drain(&mut rx);

        let delivery = engine.submit(Side::Right, "volatile".to_string()).await;
        assert!(!delivery.persisted);
        assert_eq!(delivery.delivered, 1);
        assert_eq!(expect_new(next_frame(&mut rx)).text, "volatile");
        assert_eq!(engine.message_count().await, 1);
    }

    #[tokio::test]
    async fn test_persist_failure_can_suppress_relay() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let store = LogStore::open(blocker.join("messages.json")).await;
        let policy = RelayPolicy {
            persist_failure: PersistFailurePolicy::Suppress,
        };
        let engine = RelayEngine::new(store, policy);

        let (_id, mut rx) = attach(&engine).await;
        drain(&mut rx);

        let delivery = engine.submit(Side::Right, "held back".to_string()).await;
        assert!(!delivery.persisted);
        assert_eq!(delivery.delivered, 0);
        assert!(rx.try_recv().is_err());

        // Still part of the in-memory log, so the next attach sees it.
        let (_late, mut late_rx) = attach(&engine).await;
        let history = expect_init(next_frame(&mut late_rx));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "held back");
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_and_refuses_attach() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir, RelayPolicy::default()).await;
        let token = engine.shutdown_token();

        let (_a, mut rx_a) = attach(&engine).await;
        let (_b, mut rx_b) = attach(&engine).await;

        assert_eq!(engine.shutdown().await, 2);
        assert!(token.is_cancelled());
        assert_eq!(engine.connection_count().await, 0);

        // Init frames were queued before shutdown; afterwards the queues end.
        assert!(rx_a.recv().await.is_some());
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_some());
        assert!(rx_b.recv().await.is_none());

        let (late, _rx) = ConnectionHandle::new();
        assert!(engine.attach(late).await.is_err());
    }

    #[test]
    fn test_policy_from_config() {
        let relay = RelayPolicy::from(&RelayConfig {
            broadcast_on_persist_failure: true,
        });
        assert_eq!(relay.persist_failure, PersistFailurePolicy::Relay);

        let suppress = RelayPolicy::from(&RelayConfig {
            broadcast_on_persist_failure: false,
        });
        assert_eq!(suppress.persist_failure, PersistFailurePolicy::Suppress);
    }
}
