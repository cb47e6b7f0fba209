//! Connection registry of the nodes connected to this server.
//!
//! One entry per node. A node that reconnects replaces its previous
//! entry; the superseded session is left for the transport to close.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use warp_core::{EstablishedAt, NodeId};

use crate::session::Session;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A node's live connection as seen by this server.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub node_id: NodeId,
    /// Remote address of the node (informational).
    pub address: SocketAddr,
    pub session: Arc<dyn Session>,
    pub established_at: EstablishedAt,
    /// Process-unique id of this connection.
    pub conn_id: u64,
}

impl ConnectionHandle {
    /// Wrap a freshly accepted connection, stamped with the current time.
    pub fn new(node_id: NodeId, address: SocketAddr, session: Arc<dyn Session>) -> Self {
        Self {
            node_id,
            address,
            session,
            established_at: EstablishedAt::now(),
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Override the acceptance timestamp.
    pub fn with_established_at(mut self, established_at: EstablishedAt) -> Self {
        self.established_at = established_at;
        self
    }

    pub fn is_session_closed(&self) -> bool {
        self.session.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .field("established_at", &self.established_at)
            .field("conn_id", &self.conn_id)
            .field("session_closed", &self.session.is_closed())
            .finish()
    }
}

/// Table of node connections owned by this server process.
///
/// All mutations and snapshots go through one lock. Snapshots are
/// copies. Cloning the registry shares the same table.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    conns: Arc<Mutex<HashMap<NodeId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `handle.node_id`.
    ///
    /// Returns the superseded handle, if any.
    pub fn add(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let node_id = handle.node_id.clone();
        let conn_id = handle.conn_id;
        let previous = {
            let mut conns = self.conns.lock().expect("registry lock");
            conns.insert(node_id.clone(), handle)
        };

        match &previous {
            Some(old) => info!(
                %node_id,
                old_conn = old.conn_id,
                new_conn = conn_id,
                "node connection superseded"
            ),
            None => debug!(%node_id, conn_id, "node connected"),
        }
        previous
    }

    pub fn get(&self, node_id: &NodeId) -> Option<ConnectionHandle> {
        let conns = self.conns.lock().expect("registry lock");
        conns.get(node_id).cloned()
    }

    /// Remove the entry for `node_id`. Absent entries are not an error.
    pub fn remove(&self, node_id: &NodeId) -> Option<ConnectionHandle> {
        let removed = {
            let mut conns = self.conns.lock().expect("registry lock");
            conns.remove(node_id)
        };
        if let Some(handle) = &removed {
            debug!(%node_id, conn_id = handle.conn_id, "node disconnected");
        }
        removed
    }

    /// Remove the entry only if it is still connection `conn_id`.
    ///
    /// A superseded connection that closes late must not evict the
    /// connection that replaced it.
    pub fn remove_if_current(&self, node_id: &NodeId, conn_id: u64) -> bool {
        let mut conns = self.conns.lock().expect("registry lock");
        match conns.get(node_id) {
            Some(current) if current.conn_id == conn_id => {
                conns.remove(node_id);
                debug!(%node_id, conn_id, "node disconnected");
                true
            }
            Some(current) => {
                debug!(
                    %node_id,
                    conn_id,
                    current = current.conn_id,
                    "ignoring close of superseded connection"
                );
                false
            }
            None => false,
        }
    }

    /// Point-in-time copy of the connected node IDs.
    pub fn snapshot(&self) -> BTreeSet<NodeId> {
        let conns = self.conns.lock().expect("registry lock");
        conns.keys().cloned().collect()
    }

    /// Point-in-time copy of connected nodes and when they connected.
    pub fn connected_nodes(&self) -> HashMap<NodeId, EstablishedAt> {
        let conns = self.conns.lock().expect("registry lock");
        conns
            .iter()
            .map(|(id, handle)| (id.clone(), handle.established_at))
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<ConnectionHandle> {
        let mut conns = self.conns.lock().expect("registry lock");
        conns.drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
