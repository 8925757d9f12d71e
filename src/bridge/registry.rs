//! Live bridge connections and the pending outbound queue.
//!
//! Connections, alias mappings and pending lines share one lock so that a
//! `hello` flush and a concurrent delivery cannot interleave out of order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};

/// Identifier assigned to each accepted connection.
pub type ConnectionId = u64;

/// Where a delivered line ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to this many connections.
    Sent(usize),
    /// No connection was live; the line waits for the next `hello`.
    Queued,
}

#[derive(Debug)]
struct Connection {
    alias: Option<String>,
    outbound: mpsc::UnboundedSender<String>,
    close: Option<oneshot::Sender<()>>,
}

impl Connection {
    fn send(&self, line: &str) -> bool {
        self.outbound.send(String::from(line)).is_ok()
    }

    fn close(&mut self) {
        if let Some(close) = self.close.take()
            && close.send(()).is_err()
        {
            tracing::debug!(alias = ?self.alias, "connection already closed");
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, Connection>,
    aliases: HashMap<String, ConnectionId>,
    pending: VecDeque<String>,
}

/// Registry shared by the accept loop, connection tasks and deliveries.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new connection writing through `outbound` and closed by
    /// `close`.
    pub fn register(
        &self,
        outbound: mpsc::UnboundedSender<String>,
        close: oneshot::Sender<()>,
    ) -> ConnectionId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id = id.wrapping_add(1);
        inner.connections.insert(
            id,
            Connection {
                alias: None,
                outbound,
                close: Some(close),
            },
        );
        id
    }

    /// Bind `alias` to connection `id` and flush the pending queue to it.
    /// Returns the number of flushed lines.
    pub fn hello(&self, id: ConnectionId, alias: &str) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(connection) = inner.connections.get_mut(&id) else {
            return 0;
        };
        if let Some(previous) = connection.alias.replace(String::from(alias))
            && inner.aliases.get(&previous) == Some(&id)
        {
            inner.aliases.remove(&previous);
        }
        inner.aliases.insert(String::from(alias), id);

        let flushed = inner.pending.len();
        for line in inner.pending.drain(..) {
            if !connection.send(&line) {
                tracing::debug!(alias = %alias, "writer closed during flush");
            }
        }
        flushed
    }

    /// Alias announced by connection `id`.
    #[must_use]
    pub fn alias_of(&self, id: ConnectionId) -> Option<String> {
        self.lock()
            .connections
            .get(&id)
            .and_then(|connection| connection.alias.clone())
    }

    /// Forget connection `id` and its alias mapping.
    pub fn remove(&self, id: ConnectionId) {
        let mut inner = self.lock();
        if let Some(alias) = inner
            .connections
            .remove(&id)
            .and_then(|connection| connection.alias)
            && inner.aliases.get(&alias) == Some(&id)
        {
            inner.aliases.remove(&alias);
        }
    }

    /// Close and forget the connection bound to `alias`.
    pub fn disconnect(&self, alias: &str) -> bool {
        let mut inner = self.lock();
        let Some(id) = inner.aliases.remove(alias) else {
            return false;
        };
        if let Some(mut connection) = inner.connections.remove(&id) {
            connection.close();
        }
        true
    }

    /// Close every connection.
    pub fn close_all(&self) {
        let mut inner = self.lock();
        inner.aliases.clear();
        for (_, mut connection) in inner.connections.drain() {
            connection.close();
        }
    }

    /// Send `line` to connections of `enabled` aliases, else to every
    /// connection, else queue it.
    pub fn deliver(&self, line: &str, enabled: &HashSet<String>) -> Delivery {
        let mut inner = self.lock();
        if inner.connections.is_empty() {
            inner.pending.push_back(String::from(line));
            return Delivery::Queued;
        }

        let targeted: Vec<&Connection> = inner
            .connections
            .values()
            .filter(|connection| {
                connection
                    .alias
                    .as_ref()
                    .is_some_and(|alias| enabled.contains(alias))
            })
            .collect();
        let targets = if targeted.is_empty() {
            inner.connections.values().collect()
        } else {
            targeted
        };
        Delivery::Sent(targets.into_iter().filter(|connection| connection.send(line)).count())
    }

    /// Aliases with a live connection, sorted.
    #[must_use]
    pub fn connected_aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.lock().aliases.keys().cloned().collect();
        aliases.sort_unstable();
        aliases
    }

    /// Number of lines waiting for a connection.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}
