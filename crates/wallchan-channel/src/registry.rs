//! Host-side bookkeeping for every connected front-end.
//!
//! Each announced [`ClientConnection`] goes through the same lifecycle:
//!
//! 1. The first buffer is decoded as the connection's context `C`.
//! 2. A live connection with an equal context is disposed and removed.
//! 3. A [`ChannelServer`] / [`ChannelClient`] pair is created, every known
//!    channel is registered on the server, and the connection is published.
//! 4. When the transport reports a disconnect, the pair is disposed and the
//!    removal is published.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wallchan_codec::{decode, from_value};
use wallchan_transport::{ClientConnection, Emitter, SharedProtocol, Subscription};

use crate::channel::SharedChannel;
use crate::client::{ChannelClient, ChannelProxy};
use crate::config::RegistryConfig;
use crate::error::{ChannelError, Result};
use crate::router::route;
use crate::server::ChannelServer;

/// What a connection context must support to key the registry.
pub trait ConnectionContext:
    Clone + Eq + Hash + fmt::Debug + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> ConnectionContext for T where
    T: Clone + Eq + Hash + fmt::Debug + DeserializeOwned + Send + Sync + 'static
{
}

/// Tracks one server/client pair per connected context.
pub struct ConnectionRegistry<C> {
    inner: Arc<RegistryInner<C>>,
}

struct RegistryInner<C> {
    config: RegistryConfig,
    state: Mutex<RegistryState<C>>,
    did_add: Emitter<C>,
    did_remove: Emitter<C>,
    first_connection: Emitter<C>,
    shutdown: CancellationToken,
}

struct RegistryState<C> {
    channels: HashMap<String, SharedChannel<C>>,
    connections: HashMap<C, Connection<C>>,
    next_id: u64,
    seen_first: bool,
    disposed: bool,
}

/// One live, identified connection.
struct Connection<C> {
    id: u64,
    label: String,
    protocol: SharedProtocol,
    server: ChannelServer<C>,
    client: ChannelClient,
    router: Arc<Mutex<Option<Subscription>>>,
}

impl<C: Send + Sync + 'static> Connection<C> {
    /// Unsubscribe first, then dispose both halves.
    fn dispose(&self) {
        let router = lock(&self.router).take();
        drop(router);
        self.server.dispose();
        self.client.dispose();
    }
}

impl<C> Clone for ConnectionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ConnectionContext> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl<C: ConnectionContext> ConnectionRegistry<C> {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                state: Mutex::new(RegistryState {
                    channels: HashMap::new(),
                    connections: HashMap::new(),
                    next_id: 1,
                    seen_first: false,
                    disposed: false,
                }),
                did_add: Emitter::new(),
                did_remove: Emitter::new(),
                first_connection: Emitter::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Accept every connection announced on `connections` until the sender
    /// side closes or the registry is disposed.
    pub fn serve(&self, mut connections: mpsc::UnboundedReceiver<ClientConnection>) -> JoinHandle<()> {
        let registry = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = connections.recv() => match next {
                        Some(connection) => registry.accept(connection),
                        None => break,
                    },
                }
            }
            debug!("connection stream ended");
        })
    }

    /// Start the handshake for one connection. Its first buffer must be the
    /// encoded context.
    pub fn accept(&self, connection: ClientConnection) {
        let id = {
            let mut state = self.inner.lock();
            if state.disposed {
                debug!(label = %connection.label, "registry disposed; refusing connection");
                connection.protocol.disconnect();
                return;
            }
            let id = state.next_id;
            state.next_id += 1;
            id
        };
        debug!(id, label = %connection.label, "awaiting context");

        let halves: Arc<OnceLock<(ChannelServer<C>, ChannelClient)>> = Arc::default();
        let handshaking = Arc::new(AtomicBool::new(true));
        let router_slot: Arc<Mutex<Option<Subscription>>> = Arc::default();

        let listener = {
            let weak = Arc::downgrade(&self.inner);
            let connection = connection.clone();
            let halves = Arc::clone(&halves);
            let router_slot = Arc::clone(&router_slot);
            move |buffer: Bytes| {
                if let Some((server, client)) = halves.get() {
                    route(server, client, &connection.protocol, buffer);
                    return;
                }
                if !handshaking.swap(false, Ordering::SeqCst) {
                    return;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let registry = ConnectionRegistry { inner };
                if let Some(pair) = registry.handshake(id, &connection, &router_slot, buffer) {
                    let _ = halves.set(pair);
                }
            }
        };
        let subscription = connection.protocol.on_message(Box::new(listener));
        *lock(&router_slot) = Some(subscription);

        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let closed = tokio::select! {
                _ = connection.disconnected.cancelled() => true,
                _ = shutdown.cancelled() => false,
            };
            let router = lock(&router_slot).take();
            drop(router);
            if !closed {
                connection.protocol.disconnect();
                return;
            }
            if let Some(inner) = weak.upgrade() {
                ConnectionRegistry { inner }.remove(id);
            }
        });
    }

    /// Decode the context and bring the connection live. Runs on the
    /// connection's delivery task, before any later buffer is routed.
    fn handshake(
        &self,
        id: u64,
        connection: &ClientConnection,
        router: &Arc<Mutex<Option<Subscription>>>,
        buffer: Bytes,
    ) -> Option<(ChannelServer<C>, ChannelClient)> {
        let ctx: C = match decode(buffer)
            .and_then(from_value::<C>)
            .map_err(|err| ChannelError::InvalidContext(err.to_string()))
        {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(id, label = %connection.label, error = %err, "rejecting connection");
                connection.protocol.disconnect();
                return None;
            }
        };
        if connection.disconnected.is_cancelled() {
            return None;
        }

        // The previous pair for this context goes away before the new one
        // announces itself.
        let previous = self.inner.lock().connections.remove(&ctx);
        if let Some(previous) = previous {
            info!(context = ?ctx, old = %previous.label, new = %connection.label, "connection superseded");
            previous.dispose();
            previous.protocol.disconnect();
            self.inner.did_remove.fire(ctx.clone());
        }

        let protocol = Arc::clone(&connection.protocol);
        let server = ChannelServer::attached(
            Arc::clone(&protocol),
            ctx.clone(),
            self.inner.config.channel.clone(),
        );
        let client = ChannelClient::attached(Arc::clone(&protocol));

        // Same lock as the watcher's `remove(id)`: either it sees this entry or
        // this sees the disconnect.
        let (channels, displaced, first) = {
            let mut state = self.inner.lock();
            if state.disposed || connection.disconnected.is_cancelled() {
                let disposed = state.disposed;
                drop(state);
                debug!(
                    id,
                    label = %connection.label,
                    disposed,
                    "connection gone before it went live"
                );
                server.dispose();
                client.dispose();
                return None;
            }
            let channels: Vec<(String, SharedChannel<C>)> = state
                .channels
                .iter()
                .map(|(name, channel)| (name.clone(), Arc::clone(channel)))
                .collect();
            let displaced = state.connections.insert(
                ctx.clone(),
                Connection {
                    id,
                    label: connection.label.clone(),
                    protocol,
                    server: server.clone(),
                    client: client.clone(),
                    router: Arc::clone(router),
                },
            );
            let first = !state.seen_first;
            state.seen_first = true;
            (channels, displaced, first)
        };
        if let Some(displaced) = displaced {
            displaced.dispose();
            displaced.protocol.disconnect();
        }
        for (name, channel) in channels {
            server.register_channel(name, channel);
        }

        info!(id, context = ?ctx, label = %connection.label, "connection added");
        if first {
            self.inner.first_connection.fire(ctx.clone());
        }
        self.inner.did_add.fire(ctx);
        Some((server, client))
    }

    fn remove(&self, id: u64) {
        let removed = {
            let mut state = self.inner.lock();
            let ctx = state
                .connections
                .iter()
                .find(|(_, connection)| connection.id == id)
                .map(|(ctx, _)| ctx.clone());
            ctx.and_then(|ctx| state.connections.remove(&ctx).map(|c| (ctx, c)))
        };
        let Some((ctx, connection)) = removed else {
            debug!(id, "connection closed before it was established or after it was replaced");
            return;
        };
        connection.dispose();
        info!(id, context = ?ctx, "connection removed");
        self.inner.did_remove.fire(ctx);
    }

    /// Serve `channel` under `name` on every current and future connection.
    pub fn register_channel(&self, name: impl Into<String>, channel: SharedChannel<C>) {
        let name = name.into();
        let servers: Vec<ChannelServer<C>> = {
            let mut state = self.inner.lock();
            state.channels.insert(name.clone(), Arc::clone(&channel));
            state
                .connections
                .values()
                .map(|connection| connection.server.clone())
                .collect()
        };
        debug!(channel = %name, connections = servers.len(), "channel registered");
        for server in servers {
            server.register_channel(name.clone(), Arc::clone(&channel));
        }
    }

    /// Proxy to channel `name` served by the front-end identified by `ctx`.
    ///
    /// If that front-end is not connected yet, retries with exponential
    /// backoff per [`RegistryConfig`] before failing with
    /// [`ChannelError::NotFound`].
    pub async fn get_channel(&self, ctx: &C, name: &str) -> Result<ChannelProxy> {
        let config = &self.inner.config;
        let mut delay = config.lookup_backoff;
        let attempts = config.lookup_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(client) = self.client(ctx)? {
                return Ok(client.get_channel(name));
            }
            if attempt == attempts {
                break;
            }
            debug!(context = ?ctx, attempt, ?delay, "no connection yet; retrying");
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Err(ChannelError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(config.lookup_backoff_max);
        }
        Err(ChannelError::NotFound(format!("{ctx:?}")))
    }

    /// The live client for `ctx`, without waiting.
    pub fn client(&self, ctx: &C) -> Result<Option<ChannelClient>> {
        let state = self.inner.lock();
        if state.disposed {
            return Err(ChannelError::Canceled);
        }
        Ok(state
            .connections
            .get(ctx)
            .map(|connection| connection.client.clone()))
    }

    /// Contexts of every live connection.
    pub fn connections(&self) -> Vec<C> {
        self.inner.lock().connections.keys().cloned().collect()
    }

    pub fn on_did_add_connection(
        &self,
        listener: impl Fn(C) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.did_add.subscribe(listener)
    }

    pub fn on_did_remove_connection(
        &self,
        listener: impl Fn(C) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.did_remove.subscribe(listener)
    }

    /// Fires once, for the first connection ever established.
    pub fn on_first_connection(&self, listener: impl Fn(C) + Send + Sync + 'static) -> Subscription {
        self.inner.first_connection.subscribe(listener)
    }

    /// Dispose every connection and stop accepting new ones. Idempotent.
    pub fn dispose(&self) {
        let connections: Vec<(C, Connection<C>)> = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.channels.clear();
            state.connections.drain().collect()
        };
        self.inner.shutdown.cancel();
        debug!(connections = connections.len(), "registry disposed");
        for (ctx, connection) in connections {
            connection.dispose();
            connection.protocol.disconnect();
            self.inner.did_remove.fire(ctx);
        }
    }
}

impl<C> RegistryInner<C> {
    fn lock(&self) -> MutexGuard<'_, RegistryState<C>> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: fmt::Debug> fmt::Debug for ConnectionRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ConnectionRegistry")
            .field("channels", &state.channels.len())
            .field("connections", &state.connections.keys().collect::<Vec<_>>())
            .field("disposed", &state.disposed)
            .finish()
    }
}
