//! Adapter for fan-out host primitives.
//!
//! Some hosts expose a single channel shared by every peer: one "send to peer
//! P" function and one inbound event stream where each event names the peer
//! it came from. [`PeerHub`] splits that shared primitive into one
//! [`MessagePassingProtocol`] per peer:
//!
//! - outgoing buffers are tagged with the peer id so replies reach the right
//!   process,
//! - inbound buffers are filtered down to the peer that sent them,
//! - each peer gets its own disconnect signal, fired on an explicit
//!   [`HubEvent::Disconnect`] or when the same peer says hello again (the
//!   previous connection is dead at that point).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Result;
use crate::event::{Emitter, Subscription};
use crate::protocol::{ClientConnection, MessagePassingProtocol};

/// Identity of one peer on a shared host channel.
pub type PeerId = u64;

/// The host's raw "send a buffer to peer P" primitive.
pub trait PeerSender: Send + Sync + 'static {
    fn send_to(&self, peer: PeerId, buffer: Bytes) -> Result<()>;
}

/// Inbound traffic on the shared host channel.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A peer (re)connected.
    Hello(PeerId),
    /// A buffer arrived from a peer.
    Message { peer: PeerId, buffer: Bytes },
    /// A peer announced it is going away.
    Disconnect(PeerId),
}

struct PeerEntry {
    generation: u64,
    inbound: Emitter<Bytes>,
    disconnected: CancellationToken,
}

type PeerTable = Arc<Mutex<PeerTableState>>;

#[derive(Default)]
struct PeerTableState {
    next_generation: u64,
    entries: HashMap<PeerId, PeerEntry>,
}

/// Splits a shared host channel into per-peer connections.
pub struct PeerHub;

impl PeerHub {
    /// Start demultiplexing `events`. Every [`HubEvent::Hello`] produces one
    /// [`ClientConnection`] on the returned receiver.
    ///
    /// When `events` ends, every live peer is disconnected.
    pub fn spawn(
        sender: Arc<dyn PeerSender>,
        mut events: mpsc::UnboundedReceiver<HubEvent>,
    ) -> mpsc::UnboundedReceiver<ClientConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peers: PeerTable = Arc::default();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    HubEvent::Hello(peer) => {
                        let connection = admit(&sender, &peers, peer);
                        if tx.send(connection).is_err() {
                            debug!(peer, "connection receiver dropped; ignoring hello");
                        }
                    }
                    HubEvent::Message { peer, buffer } => {
                        let inbound = peers
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .entries
                            .get(&peer)
                            .map(|entry| entry.inbound.clone());
                        match inbound {
                            Some(inbound) => inbound.fire(buffer),
                            None => trace!(peer, "dropping message from unknown peer"),
                        }
                    }
                    HubEvent::Disconnect(peer) => {
                        let entry = peers
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .entries
                            .remove(&peer);
                        if let Some(entry) = entry {
                            debug!(peer, "peer disconnected");
                            entry.disconnected.cancel();
                        }
                    }
                }
            }

            let remaining: Vec<PeerEntry> = peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .drain()
                .map(|(_, entry)| entry)
                .collect();
            for entry in remaining {
                entry.disconnected.cancel();
            }
            debug!("hub event stream ended");
        });

        rx
    }
}

fn admit(sender: &Arc<dyn PeerSender>, peers: &PeerTable, peer: PeerId) -> ClientConnection {
    let inbound = Emitter::buffered();
    let disconnected = CancellationToken::new();

    let (generation, previous) = {
        let mut table = peers.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = table.next_generation;
        table.next_generation += 1;
        let previous = table.entries.insert(
            peer,
            PeerEntry {
                generation,
                inbound: inbound.clone(),
                disconnected: disconnected.clone(),
            },
        );
        (generation, previous)
    };
    if let Some(previous) = previous {
        debug!(peer, "peer reconnected; dropping previous connection");
        previous.disconnected.cancel();
    }

    let protocol = Arc::new(PeerProtocol {
        peer,
        generation,
        sender: Arc::clone(sender),
        inbound,
        disconnected: disconnected.clone(),
        peers: Arc::clone(peers),
    });
    ClientConnection::new(protocol, disconnected, format!("peer-{peer}"))
}

/// Message passing scoped to one peer of a [`PeerHub`].
struct PeerProtocol {
    peer: PeerId,
    generation: u64,
    sender: Arc<dyn PeerSender>,
    inbound: Emitter<Bytes>,
    disconnected: CancellationToken,
    peers: PeerTable,
}

impl MessagePassingProtocol for PeerProtocol {
    fn send(&self, buffer: Bytes) -> Result<()> {
        if self.disconnected.is_cancelled() {
            return Err(crate::error::TransportError::Closed);
        }
        self.sender.send_to(self.peer, buffer)
    }

    fn on_message(&self, listener: Box<dyn Fn(Bytes) + Send + Sync>) -> Subscription {
        self.inbound.subscribe(listener)
    }

    fn disconnect(&self) {
        {
            let mut table = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
            let ours = table
                .entries
                .get(&self.peer)
                .is_some_and(|entry| entry.generation == self.generation);
            if ours {
                table.entries.remove(&self.peer);
            }
        }
        self.disconnected.cancel();
    }
}
