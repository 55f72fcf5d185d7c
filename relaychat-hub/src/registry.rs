use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use relaychat_core::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identifier for one attached connection
pub type ConnectionId = String;

/// A serialized server frame, shared across every recipient of a broadcast
pub type OutboundFrame = Arc<str>;

/// Receiving end of a connection's outbound queue, drained by the transport
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutboundFrame>;

/// Handle for one attached peer
///
/// Frames are pushed onto an unbounded FIFO queue; the transport's writer
/// task owns the other end. Queue order is delivery order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<OutboundFrame>,
    alive: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Create a handle and the queue receiver the transport should drain
    #[must_use]
    pub fn new() -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: format!("conn_{}", nanoid::nanoid!(8)),
            sender: tx,
            alive: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// False once the transport reported a failure or the queue receiver is gone
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    pub fn mark_closed(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Queue one frame for delivery
    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::Transport(format!("connection {} is closed", self.id)));
        }
        self.sender
            .send(frame)
            .map_err(|_| Error::Transport(format!("connection {} outbound queue closed", self.id)))
    }
}

/// Live set of attached connections, in attach order
///
/// Not synchronized on its own; the relay engine serializes access.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Vec<ConnectionHandle>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Registering the same handle twice is a caller bug.
    pub fn register(&mut self, handle: ConnectionHandle) {
        info!(
            connection_id = %handle.id(),
            total_connections = self.connections.len() + 1,
            "Connection registered"
        );
        self.connections.push(handle);
    }

    /// Remove a connection. Returns false if it was not registered.
    pub fn unregister(&mut self, connection_id: &str) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.id() != connection_id);
        let removed = self.connections.len() != before;

        if removed {
            info!(
                connection_id = %connection_id,
                total_connections = self.connections.len(),
                "Connection unregistered"
            );
        } else {
            debug!(connection_id = %connection_id, "Unregister of unknown connection ignored");
        }

        removed
    }

    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.iter().any(|c| c.id() == connection_id)
    }

    /// Apply `f` to every connection that is still alive
    pub fn for_each(&self, mut f: impl FnMut(&ConnectionHandle)) {
        for conn in self.connections.iter().filter(|c| c.is_alive()) {
            f(conn);
        }
    }

    /// Deliver a frame to every live connection except `excluding`.
    ///
    /// A failing connection is marked closed, logged and dropped from the set;
    /// delivery to the rest continues. Returns how many connections got it.
    pub fn broadcast(&mut self, frame: &OutboundFrame, excluding: Option<&str>) -> usize {
        let mut sent_count = 0;

        self.for_each(|conn| {
            if excluding == Some(conn.id()) {
                return;
            }
            match conn.send(Arc::clone(frame)) {
                Ok(()) => sent_count += 1,
                Err(err) => {
                    conn.mark_closed();
                    warn!(
                        connection_id = %conn.id(),
                        error = %err,
                        "Failed to deliver frame, marking connection closed"
                    );
                }
            }
        });

        self.prune_dead();
        sent_count
    }

    /// Deliver a frame to one connection
    pub fn send_to(&mut self, connection_id: &str, frame: OutboundFrame) -> bool {
        let Some(conn) = self.connections.iter().find(|c| c.id() == connection_id) else {
            return false;
        };

        match conn.send(frame) {
            Ok(()) => true,
            Err(err) => {
                conn.mark_closed();
                warn!(connection_id = %connection_id, error = %err, "Failed to deliver frame");
                self.prune_dead();
                false
            }
        }
    }

    fn prune_dead(&mut self) {
        self.connections.retain(|c| {
            let alive = c.is_alive();
            if !alive {
                debug!(connection_id = %c.id(), "Dropping dead connection");
            }
            alive
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and drop every connection. Dropping the handles ends each
    /// writer's queue. Returns how many were live.
    pub fn clear(&mut self) -> usize {
        let count = self.connections.len();
        for conn in self.connections.drain(..) {
            conn.mark_closed();
        }
        count
    }
}
