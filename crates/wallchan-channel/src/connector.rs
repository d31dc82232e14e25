//! The front-end side of a connection.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wallchan_codec::{encode, to_value};
use wallchan_transport::{ClientConnection, Subscription};

use crate::channel::SharedChannel;
use crate::client::{ChannelClient, ChannelProxy};
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::router::route;
use crate::server::ChannelServer;

/// A front-end's connection to the host.
///
/// Announces `ctx` as the first buffer, then serves its own channels to the
/// host (through a [`ChannelServer`]) and calls the host's channels (through a
/// [`ChannelClient`]). When the transport goes away both halves are disposed,
/// rejecting in-flight calls with [`Canceled`](crate::ChannelError::Canceled).
pub struct IpcClient<C> {
    ctx: C,
    connection: ClientConnection,
    server: ChannelServer<C>,
    client: ChannelClient,
    router: Mutex<Option<Subscription>>,
}

impl<C> IpcClient<C>
where
    C: Serialize + Clone + Send + Sync + 'static,
{
    /// Announce `ctx` on `connection` and start serving.
    pub fn new(connection: ClientConnection, ctx: C, config: ChannelConfig) -> Result<Self> {
        let announcement = encode(&to_value(&ctx)?)?;
        connection.protocol.send(announcement.into_bytes())?;

        let protocol = Arc::clone(&connection.protocol);
        let server = ChannelServer::attached(Arc::clone(&protocol), ctx.clone(), config);
        let client = ChannelClient::attached(Arc::clone(&protocol));

        let router = {
            let (server, client, protocol) = (server.clone(), client.clone(), Arc::clone(&protocol));
            connection.protocol.on_message(Box::new(move |buffer| {
                route(&server, &client, &protocol, buffer);
            }))
        };

        // Once the host is gone nothing can answer; fail what is in flight.
        let (watch_server, watch_client) = (server.clone(), client.clone());
        let disconnected = connection.disconnected.clone();
        tokio::spawn(async move {
            disconnected.cancelled().await;
            watch_server.dispose();
            watch_client.dispose();
        });

        debug!(label = %connection.label, "connected to host");
        Ok(Self {
            ctx,
            connection,
            server,
            client,
            router: Mutex::new(Some(router)),
        })
    }

    /// Connect to a host listening on a Unix socket.
    #[cfg(unix)]
    pub async fn connect(path: impl AsRef<std::path::Path>, ctx: C) -> Result<Self> {
        Self::connect_with(
            path,
            ctx,
            wallchan_transport::FrameConfig::default(),
            ChannelConfig::default(),
        )
        .await
    }

    /// [`connect`](Self::connect) with explicit framing and channel settings.
    #[cfg(unix)]
    pub async fn connect_with(
        path: impl AsRef<std::path::Path>,
        ctx: C,
        frame: wallchan_transport::FrameConfig,
        config: ChannelConfig,
    ) -> Result<Self> {
        let connection = wallchan_transport::UnixDomainSocket::connect_protocol(path, frame).await?;
        Self::new(connection, ctx, config)
    }

    /// Context announced to the host.
    pub fn context(&self) -> &C {
        &self.ctx
    }

    /// Serve `channel` to the host under `name`.
    pub fn register_channel(&self, name: impl Into<String>, channel: SharedChannel<C>) {
        self.server.register_channel(name, channel);
    }

    /// Handle to a channel served by the host.
    pub fn get_channel(&self, name: impl Into<String>) -> ChannelProxy {
        self.client.get_channel(name)
    }

    pub fn server(&self) -> &ChannelServer<C> {
        &self.server
    }

    pub fn client(&self) -> &ChannelClient {
        &self.client
    }

    /// Cancelled once the host connection is gone.
    pub fn disconnected(&self) -> CancellationToken {
        self.connection.disconnected.clone()
    }

    /// Tear down both halves and close the transport. Idempotent.
    pub fn dispose(&self) {
        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if router.is_none() {
            return;
        }
        drop(router);
        self.server.dispose();
        self.client.dispose();
        self.connection.protocol.disconnect();
    }
}

impl<C> Drop for IpcClient<C> {
    fn drop(&mut self) {
        let router = self
            .router
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if router.is_some() {
            drop(router);
            self.connection.protocol.disconnect();
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for IpcClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcClient")
            .field("ctx", &self.ctx)
            .field("label", &self.connection.label)
            .field("client", &self.client)
            .finish()
    }
}
