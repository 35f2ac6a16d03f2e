//! Per-connection notifier sets and the broadcast fan-out.

use crate::ipc::protocol::EventFrame;
use crate::manager::types::{ConnectionId, Notification, NotifierId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Frames queued per event stream before new ones are dropped.
pub const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Default)]
struct ConnectionEntry {
    notifiers: BTreeSet<NotifierId>,
    sink: Option<mpsc::Sender<EventFrame>>,
}

#[derive(Default)]
pub struct NotifierRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_connection(&self, connection: ConnectionId) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(connection)
            .or_default();
    }

    /// Forgets the connection together with all of its notifiers.
    pub fn close_connection(&self, connection: ConnectionId) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection);
    }

    /// Returns `false` if the connection is unknown.
    pub fn register(&self, connection: ConnectionId, notifier: NotifierId) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get_mut(&connection) {
            Some(entry) => {
                entry.notifiers.insert(notifier);
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, connection: ConnectionId, notifier: NotifierId) -> bool {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&connection)
            .is_some_and(|entry| entry.notifiers.remove(&notifier))
    }

    /// Drops every notifier of `connection` but keeps the connection open.
    pub fn unregister_all(&self, connection: ConnectionId) {
        if let Some(entry) = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&connection)
        {
            entry.notifiers.clear();
        }
    }

    /// Creates the event queue for `connection`. Only one stream may be
    /// attached to a connection at a time.
    pub fn attach_sink(&self, connection: ConnectionId) -> Option<mpsc::Receiver<EventFrame>> {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = connections.get_mut(&connection)?;
        if entry.sink.as_ref().is_some_and(|sink| !sink.is_closed()) {
            return None;
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        entry.sink = Some(tx);
        Some(rx)
    }

    pub fn notifier_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.notifiers.len())
            .sum()
    }

    /// Queues `notification` once for every registered notifier that has an
    /// attached stream. Returns the number of frames queued.
    pub fn broadcast(&self, notification: &Notification) -> usize {
        let targets: Vec<(ConnectionId, NotifierId, mpsc::Sender<EventFrame>)> = {
            let connections = self
                .connections
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            connections
                .iter()
                .filter_map(|(connection, entry)| {
                    entry.sink.as_ref().map(|sink| (connection, &entry.notifiers, sink))
                })
                .flat_map(|(connection, notifiers, sink)| {
                    notifiers
                        .iter()
                        .map(move |notifier| (*connection, *notifier, sink.clone()))
                })
                .collect()
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (connection, notifier, sink) in targets {
            let frame = EventFrame {
                notifier,
                notification: notification.clone(),
            };
            match sink.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Event queue of connection {} is full, dropping notification",
                        connection
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(connection),
            }
        }

        if !closed.is_empty() {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for connection in closed {
                if let Some(entry) = connections.get_mut(&connection)
                    && entry.sink.as_ref().is_some_and(mpsc::Sender::is_closed)
                {
                    entry.sink = None;
                }
            }
        }

        delivered
    }
}
