use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use wallchan_codec::{decode_message, ErrorPayload, Message, Request, RequestId, Response, Value};
use wallchan_transport::{SharedProtocol, Subscription};

use crate::channel::SharedChannel;
use crate::config::ChannelConfig;
use crate::error::{Rejection, UNKNOWN_CHANNEL_NAME};
use crate::pending::PendingQueue;

/// Serves registered channels to one remote party.
///
/// Created when a connection is established; announces itself with a single
/// `Initialize` frame. Requests for channels that are not registered yet are
/// held for [`ChannelConfig::pending_timeout`] and replayed once the channel
/// shows up.
///
/// Cloning yields another handle to the same server. Dropping every handle
/// has the same effect as [`dispose`](Self::dispose).
pub struct ChannelServer<C> {
    inner: Arc<ServerInner<C>>,
}

struct ServerInner<C> {
    ctx: C,
    protocol: SharedProtocol,
    config: ChannelConfig,
    state: Mutex<ServerState<C>>,
}

struct ServerState<C> {
    disposed: bool,
    channels: HashMap<String, SharedChannel<C>>,
    active: HashMap<RequestId, Active>,
    next_generation: u64,
    pending: PendingQueue,
    messages: Option<Subscription>,
}

/// An in-flight call or event subscription. Dropping it cancels the work.
///
/// Ids come from the remote party, so an id can be reused once its previous
/// request was canceled. The generation tells the finishing task whether the
/// entry under its id is still its own.
struct Active {
    generation: u64,
    _cancel: Subscription,
}

impl<C> Clone for ChannelServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + Sync + 'static> ChannelServer<C> {
    /// Create a server that reads requests straight from `protocol`.
    ///
    /// When a client half shares the same protocol, create both before any
    /// traffic arrives, or route through [`IpcClient`](crate::IpcClient) /
    /// [`ConnectionRegistry`](crate::ConnectionRegistry), which feed both
    /// halves from one subscription.
    pub fn new(protocol: SharedProtocol, ctx: C, config: ChannelConfig) -> Self {
        let server = Self::detached(protocol, ctx, config);
        let weak = Arc::downgrade(&server.inner);
        let subscription = server.inner.protocol.on_message(Box::new(move |buffer| {
            if let Some(inner) = weak.upgrade() {
                ChannelServer { inner }.on_buffer(buffer);
            }
        }));
        server.lock().messages = Some(subscription);
        server.inner.send(Response::Initialize);
        server
    }

    /// Create a server whose requests are handed in by the caller through
    /// [`handle_request`](Self::handle_request). Sends `Initialize`.
    pub(crate) fn attached(protocol: SharedProtocol, ctx: C, config: ChannelConfig) -> Self {
        let server = Self::detached(protocol, ctx, config);
        server.inner.send(Response::Initialize);
        server
    }

    fn detached(protocol: SharedProtocol, ctx: C, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                ctx,
                protocol,
                config,
                state: Mutex::new(ServerState {
                    disposed: false,
                    channels: HashMap::new(),
                    active: HashMap::new(),
                    next_generation: 0,
                    pending: PendingQueue::default(),
                    messages: None,
                }),
            }),
        }
    }

    /// Context of the connection this server belongs to.
    pub fn context(&self) -> &C {
        &self.inner.ctx
    }

    /// Make `channel` callable under `name`, replacing any previous one.
    ///
    /// Requests that were waiting for `name` are replayed on a spawned task,
    /// in arrival order.
    pub fn register_channel(&self, name: impl Into<String>, channel: SharedChannel<C>) {
        let name = name.into();
        let backlog = {
            let mut state = self.lock();
            if state.disposed {
                debug!(channel = %name, "ignoring registration on disposed server");
                return;
            }
            state.channels.insert(name.clone(), channel);
            state.pending.take(&name)
        };
        if backlog.is_empty() {
            return;
        }

        debug!(channel = %name, count = backlog.len(), "flushing pending requests");
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            for request in backlog {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                ChannelServer { inner }.handle_request(request);
            }
        });
    }

    /// Names of the registered channels.
    pub fn channel_names(&self) -> Vec<String> {
        self.lock().channels.keys().cloned().collect()
    }

    /// Number of calls and event subscriptions currently being served.
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Number of requests waiting for their channel.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Stop reading requests, cancel every in-flight call and event
    /// subscription, drop pending requests. Idempotent.
    pub fn dispose(&self) {
        let (messages, active) = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.pending.clear();
            state.channels.clear();
            let active: Vec<Active> = state.active.drain().map(|(_, active)| active).collect();
            (state.messages.take(), active)
        };
        drop(messages);
        debug!(active = active.len(), "channel server disposed");
        drop(active);
    }

    fn on_buffer(&self, buffer: Bytes) {
        match decode_message(buffer) {
            Ok(Message::Request(request)) => self.handle_request(request),
            Ok(Message::Response(_)) => {}
            Err(err) => {
                warn!(error = %err, "malformed frame; disconnecting");
                self.inner.protocol.disconnect();
            }
        }
    }

    /// Dispatch one decoded request.
    pub(crate) fn handle_request(&self, request: Request) {
        trace!(id = request.id(), "request");
        match request {
            Request::Promise {
                id,
                channel,
                method,
                arg,
            } => self.on_promise(id, channel, method, arg),
            Request::EventListen {
                id,
                channel,
                event,
                arg,
            } => self.on_listen(id, channel, event, arg),
            Request::PromiseCancel { id } | Request::EventDispose { id } => {
                self.dispose_request(id)
            }
        }
    }

    fn on_promise(&self, id: RequestId, name: String, method: String, arg: Value) {
        let cancel = CancellationToken::new();
        let (channel, generation) = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            if state.active.contains_key(&id) {
                drop(state);
                warn!(id, channel = %name, method = %method, "request id already in flight");
                let message = format!("request id {id} is already in flight");
                self.inner.send(Response::PromiseError {
                    id,
                    error: ErrorPayload::new("Error", message),
                });
                return;
            }
            let Some(channel) = state.channels.get(&name).cloned() else {
                self.enqueue(
                    &mut state,
                    Request::Promise {
                        id,
                        channel: name,
                        method,
                        arg,
                    },
                );
                return;
            };
            let generation = Self::activate(&mut state, id, cancel.clone());
            (channel, generation)
        };

        debug!(id, channel = %name, method = %method, "call");
        let call = channel.call(&self.inner.ctx, &method, arg, cancel);
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let result = call.await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let response = match result {
                Ok(data) => Response::PromiseSuccess { id, data },
                Err(err) => match Rejection::from(err) {
                    Rejection::Error(error) => Response::PromiseError { id, error },
                    Rejection::Value(error) => Response::PromiseErrorObj { id, error },
                },
            };
            let server = ChannelServer { inner };
            let (finished, disposed) = {
                let mut state = server.lock();
                (Self::deactivate(&mut state, id, generation), state.disposed)
            };
            drop(finished);
            if !disposed {
                server.inner.send(response);
            }
        });
    }

    fn on_listen(&self, id: RequestId, name: String, event: String, arg: Value) {
        let stop = CancellationToken::new();
        let (channel, generation) = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            if state.active.contains_key(&id) {
                warn!(id, channel = %name, event = %event, "request id already in flight");
                return;
            }
            match state.channels.get(&name).cloned() {
                Some(channel) => (channel, Self::activate(&mut state, id, stop.clone())),
                None => {
                    self.enqueue(
                        &mut state,
                        Request::EventListen {
                            id,
                            channel: name,
                            event,
                            arg,
                        },
                    );
                    return;
                }
            }
        };

        let mut stream = match channel.listen(&self.inner.ctx, &event, arg) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(id, channel = %name, event = %event, error = %err, "listen failed");
                let slot = Self::deactivate(&mut self.lock(), id, generation);
                drop(slot);
                return;
            }
        };
        debug!(id, channel = %name, event = %event, "listen");

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return,
                    item = stream.next() => match item {
                        Some(data) => {
                            let Some(inner) = weak.upgrade() else {
                                return;
                            };
                            inner.send(Response::EventFire { id, data });
                        }
                        None => break,
                    },
                }
            }
            trace!(id, "event stream ended");
            if let Some(inner) = weak.upgrade() {
                let server = ChannelServer { inner };
                let finished = Self::deactivate(&mut server.lock(), id, generation);
                drop(finished);
            }
        });
    }

    fn dispose_request(&self, id: RequestId) {
        let (active, pending) = {
            let mut state = self.lock();
            let active = state.active.remove(&id);
            let pending = if active.is_none() {
                state.pending.remove_id(id)
            } else {
                None
            };
            (active, pending)
        };
        if active.is_some() || pending.is_some() {
            debug!(id, "request disposed by caller");
        }
        drop(active);
    }

    /// Track a dispatched request under `id`; `cancel` fires when the entry is
    /// dropped.
    fn activate(state: &mut ServerState<C>, id: RequestId, cancel: CancellationToken) -> u64 {
        let generation = state.next_generation;
        state.next_generation += 1;
        let active = Active {
            generation,
            _cancel: Subscription::new(move || cancel.cancel()),
        };
        state.active.insert(id, active);
        generation
    }

    /// Remove the entry under `id` only if it is still the one `generation`
    /// created.
    fn deactivate(state: &mut ServerState<C>, id: RequestId, generation: u64) -> Option<Active> {
        match state.active.get(&id) {
            Some(active) if active.generation == generation => state.active.remove(&id),
            _ => None,
        }
    }

    /// Queue a request for an unknown channel and arm its timer.
    fn enqueue(&self, state: &mut ServerState<C>, request: Request) {
        let Some(channel) = request.channel().map(str::to_owned) else {
            return;
        };
        let key = state.pending.next_key();
        let timeout = self.inner.config.pending_timeout;
        let weak = Arc::downgrade(&self.inner);
        let timer_channel = channel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                ChannelServer { inner }.expire(&timer_channel, key);
            }
        });
        trace!(id = request.id(), channel = %channel, "queued for unknown channel");
        state
            .pending
            .push(&channel, key, request, timer.abort_handle());
    }

    fn expire(&self, channel: &str, key: u64) {
        let Some(request) = self.lock().pending.expire(channel, key) else {
            return;
        };
        let timeout = self.inner.config.pending_timeout;
        match request {
            Request::Promise { id, .. } => {
                debug!(id, channel, "no such channel; rejecting call");
                let message = format!(
                    "Unknown channel '{channel}' (not registered within {}ms)",
                    timeout.as_millis()
                );
                self.inner.send(Response::PromiseError {
                    id,
                    error: ErrorPayload::new(UNKNOWN_CHANNEL_NAME, message),
                });
            }
            other => {
                debug!(id = other.id(), channel, "no such channel; dropping listen");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState<C>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C> ServerInner<C> {
    /// Best effort: a failed send is logged and the disconnect path cleans up.
    fn send(&self, response: Response) {
        let envelope = match response.encode() {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "failed to encode response");
                let Some(id) = response_id(&response) else {
                    return;
                };
                let fallback = Response::PromiseError {
                    id,
                    error: ErrorPayload::new("Error", err.to_string()),
                };
                match fallback.encode() {
                    Ok(envelope) => envelope,
                    Err(_) => return,
                }
            }
        };
        if let Err(err) = self.protocol.send(envelope.into_bytes()) {
            debug!(error = %err, "response dropped");
        }
    }
}

/// Only call results are worth a fallback error; a lost event is just lost.
fn response_id(response: &Response) -> Option<RequestId> {
    match response {
        Response::PromiseSuccess { id, .. }
        | Response::PromiseError { id, .. }
        | Response::PromiseErrorObj { id, .. } => Some(*id),
        Response::Initialize | Response::EventFire { .. } => None,
    }
}

impl<C> fmt::Debug for ChannelServer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ChannelServer")
            .field("channels", &state.channels.len())
            .field("active", &state.active.len())
            .field("pending", &state.pending.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use tokio::sync::mpsc;
    use wallchan_codec::Request;
    use wallchan_transport::{MemoryProtocol, MessagePassingProtocol};

    use super::*;
    use crate::channel::{CallFuture, EventStream, ServerChannel};
    use crate::error::ChannelError;

    struct Echo;

    impl ServerChannel<String> for Echo {
        fn call(&self, ctx: &String, command: &str, arg: Value, _: CancellationToken) -> CallFuture {
            let reply = match command {
                "ctx" => Ok(Value::from(ctx.as_str())),
                "fail" => Err(ChannelError::remote("TypeError", "bad")),
                "reject" => Err(ChannelError::Rejected(arg)),
                _ => Ok(arg),
            };
            Box::pin(async move { reply }) as BoxFuture<'static, _>
        }

        fn listen(&self, _: &String, _: &str, _: Value) -> Result<EventStream, ChannelError> {
            Err(ChannelError::remote("Error", "no events"))
        }
    }

    /// `wait` parks until canceled. Starts and cancellations are reported
    /// with the call's integer argument.
    struct Parked {
        started: mpsc::UnboundedSender<i64>,
        canceled: mpsc::UnboundedSender<i64>,
    }

    impl ServerChannel<()> for Parked {
        fn call(&self, _: &(), _: &str, arg: Value, cancel: CancellationToken) -> CallFuture {
            let tag = arg.as_i64().unwrap_or_default();
            let _ = self.started.send(tag);
            let canceled = self.canceled.clone();
            Box::pin(async move {
                cancel.cancelled().await;
                let _ = canceled.send(tag);
                Err(ChannelError::Canceled)
            })
        }

        fn listen(&self, _: &(), _: &str, _: Value) -> Result<EventStream, ChannelError> {
            Err(ChannelError::remote("Error", "no events"))
        }
    }

    fn parked() -> (Arc<Parked>, mpsc::UnboundedReceiver<i64>, mpsc::UnboundedReceiver<i64>) {
        let (started_tx, started) = mpsc::unbounded_channel();
        let (canceled_tx, canceled) = mpsc::unbounded_channel();
        let channel = Parked {
            started: started_tx,
            canceled: canceled_tx,
        };
        (Arc::new(channel), started, canceled)
    }

    fn wait(id: RequestId, tag: i64) -> Request {
        Request::Promise {
            id,
            channel: "parked".into(),
            method: "wait".into(),
            arg: Value::Int(tag),
        }
    }

    fn frames(protocol: &MemoryProtocol) -> (Subscription, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = protocol.on_message(Box::new(move |buffer| {
            let _ = tx.send(decode_message(buffer).unwrap());
        }));
        (sub, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame expected")
            .expect("protocol open")
    }

    fn send(protocol: &MemoryProtocol, request: Request) {
        protocol.send(request.encode().unwrap().into_bytes()).unwrap();
    }

    #[tokio::test]
    async fn announces_itself_and_answers_calls() {
        let (host, front) = MemoryProtocol::pair();
        let (_sub, mut rx) = frames(&front);
        let server = ChannelServer::new(host, "front-1".to_string(), ChannelConfig::default());
        server.register_channel("echo", Arc::new(Echo));

        assert_eq!(next(&mut rx).await, Response::Initialize.into());

        let call = |id, method: &str| Request::Promise {
            id,
            channel: "echo".into(),
            method: method.into(),
            arg: Value::Int(id as i64),
        };
        send(&front, call(1, "ctx"));
        assert_eq!(
            next(&mut rx).await,
            Response::PromiseSuccess {
                id: 1,
                data: "front-1".into()
            }
            .into()
        );

        send(&front, call(2, "fail"));
        match next(&mut rx).await {
            Message::Response(Response::PromiseError { id: 2, error }) => {
                assert_eq!(error.name, "TypeError");
            }
            other => panic!("unexpected {other:?}"),
        }

        send(&front, call(3, "reject"));
        assert_eq!(
            next(&mut rx).await,
            Response::PromiseErrorObj {
                id: 3,
                error: Value::Int(3)
            }
            .into()
        );
        assert_eq!(server.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_channel_times_out_with_configured_delay() {
        let (host, front) = MemoryProtocol::pair();
        let (_sub, mut rx) = frames(&front);
        let config = ChannelConfig {
            pending_timeout: Duration::from_millis(200),
        };
        let server = ChannelServer::new(host, (), config);
        assert_eq!(next(&mut rx).await, Response::Initialize.into());

        send(
            &front,
            Request::Promise {
                id: 1,
                channel: "missing".into(),
                method: "m".into(),
                arg: Value::Undefined,
            },
        );
        send(
            &front,
            Request::EventListen {
                id: 2,
                channel: "missing".into(),
                event: "e".into(),
                arg: Value::Undefined,
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.pending_count(), 2);

        match next(&mut rx).await {
            Message::Response(Response::PromiseError { id: 1, error }) => {
                assert_eq!(error.name, UNKNOWN_CHANNEL_NAME);
                assert!(error.message.contains("missing"));
                assert!(error.message.contains("200ms"));
            }
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.pending_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_for_queued_request_removes_it() {
        let (host, front) = MemoryProtocol::pair();
        let (_sub, mut rx) = frames(&front);
        let server = ChannelServer::new(host, (), ChannelConfig::default());
        next(&mut rx).await;

        send(
            &front,
            Request::Promise {
                id: 5,
                channel: "later".into(),
                method: "m".into(),
                arg: Value::Undefined,
            },
        );
        send(&front, Request::PromiseCancel { id: 5 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.pending_count(), 0);
    }

    #[tokio::test]
    async fn malformed_frame_disconnects() {
        let (host, front) = MemoryProtocol::pair();
        let closed = host.closed_token();
        let _server = ChannelServer::new(host, (), ChannelConfig::default());

        front.send(Bytes::from_static(&[0xEE])).unwrap();
        tokio::time::timeout(Duration::from_secs(1), closed.cancelled())
            .await
            .expect("server should drop the connection");
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_stops_serving() {
        let (host, front) = MemoryProtocol::pair();
        let (_sub, mut rx) = frames(&front);
        let server = ChannelServer::new(host, (), ChannelConfig::default());
        next(&mut rx).await;

        server.dispose();
        server.dispose();
        assert!(server.is_disposed());

        send(
            &front,
            Request::Promise {
                id: 1,
                channel: "echo".into(),
                method: "m".into(),
                arg: Value::Undefined,
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.pending_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let (host, front) = MemoryProtocol::pair();
        let (_sub, mut rx) = frames(&front);
        let server = ChannelServer::new(host, (), ChannelConfig::default());
        let (channel, mut started, mut canceled) = parked();
        server.register_channel("parked", channel);
        next(&mut rx).await;

        send(&front, wait(1, 10));
        assert_eq!(started.recv().await, Some(10));
        send(&front, wait(1, 20));

        match next(&mut rx).await {
            Message::Response(Response::PromiseError { id: 1, error }) => {
                assert!(error.message.contains("already in flight"), "{error:?}");
            }
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.try_recv().is_err());
        assert!(canceled.try_recv().is_err());
        assert_eq!(server.active_count(), 1);

        send(&front, Request::PromiseCancel { id: 1 });
        assert_eq!(canceled.recv().await, Some(10));
    }

    #[tokio::test]
    async fn finished_call_leaves_a_reused_id_alone() {
        let (host, front) = MemoryProtocol::pair();
        let (_sub, mut rx) = frames(&front);
        let server = ChannelServer::new(host, (), ChannelConfig::default());
        let (channel, mut started, mut canceled) = parked();
        server.register_channel("parked", channel);
        next(&mut rx).await;

        send(&front, wait(1, 10));
        assert_eq!(started.recv().await, Some(10));
        send(&front, Request::PromiseCancel { id: 1 });
        send(&front, wait(1, 20));

        assert_eq!(canceled.recv().await, Some(10));
        assert_eq!(started.recv().await, Some(20));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(canceled.try_recv().is_err());
        assert_eq!(server.active_count(), 1);

        send(&front, Request::PromiseCancel { id: 1 });
        assert_eq!(canceled.recv().await, Some(20));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.active_count(), 0);
    }
}
