use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use wallchan_codec::{decode_message, from_value, to_value, Message, Request, RequestId, Response, Value};
use wallchan_transport::{Emitter, SharedProtocol, Subscription, WeakEmitter};

use crate::error::{ChannelError, Result};

/// Calls channels served by the remote side of one connection.
///
/// Starts uninitialized and becomes usable once the remote server's
/// `Initialize` frame arrives; every outbound request waits for that.
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    protocol: SharedProtocol,
    state: Mutex<ClientState>,
    initialized: watch::Sender<bool>,
    on_did_initialize: Emitter<()>,
    disposed: CancellationToken,
}

struct ClientState {
    next_id: RequestId,
    handlers: HashMap<RequestId, Handler>,
    messages: Option<Subscription>,
}

enum Handler {
    Call(oneshot::Sender<Result<Value>>),
    Event {
        emitter: Emitter<Value>,
        stop: CancellationToken,
    },
}

impl ChannelClient {
    /// Create a client that reads responses straight from `protocol`.
    pub fn new(protocol: SharedProtocol) -> Self {
        let client = Self::attached(protocol);
        let weak = Arc::downgrade(&client.inner);
        let subscription = client.inner.protocol.on_message(Box::new(move |buffer| {
            if let Some(inner) = weak.upgrade() {
                ChannelClient { inner }.on_buffer(buffer);
            }
        }));
        client.inner.lock().messages = Some(subscription);
        client
    }

    /// Create a client whose responses are handed in through
    /// [`handle_response`](Self::handle_response).
    pub(crate) fn attached(protocol: SharedProtocol) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                protocol,
                state: Mutex::new(ClientState {
                    next_id: 1,
                    handlers: HashMap::new(),
                    messages: None,
                }),
                initialized,
                on_did_initialize: Emitter::new(),
                disposed: CancellationToken::new(),
            }),
        }
    }

    /// Handle to the remote channel `name`. Never fails: whether the channel
    /// exists is only known once a call is answered.
    pub fn get_channel(&self, name: impl Into<String>) -> ChannelProxy {
        ChannelProxy {
            client: Arc::clone(&self.inner),
            channel: name.into(),
        }
    }

    /// Whether the remote server has announced itself.
    pub fn is_initialized(&self) -> bool {
        *self.inner.initialized.borrow()
    }

    /// Runs once, when the client leaves the uninitialized state.
    pub fn on_did_initialize(&self, listener: impl Fn(()) + Send + Sync + 'static) -> Subscription {
        self.inner.on_did_initialize.subscribe(listener)
    }

    /// Calls and event subscriptions waiting on the remote side.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }

    /// Stop reading responses, reject every in-flight call with
    /// [`ChannelError::Canceled`] and end every event subscription. Later calls
    /// and listens fail locally. Idempotent.
    pub fn dispose(&self) {
        let (messages, handlers) = {
            let mut state = self.inner.lock();
            if self.inner.disposed.is_cancelled() {
                return;
            }
            self.inner.disposed.cancel();
            let handlers: Vec<(RequestId, Handler)> = state.handlers.drain().collect();
            (state.messages.take(), handlers)
        };
        drop(messages);

        debug!(outstanding = handlers.len(), "channel client disposed");
        for (id, handler) in handlers {
            match handler {
                Handler::Call(reply) => {
                    self.inner.send(Request::PromiseCancel { id });
                    let _ = reply.send(Err(ChannelError::Canceled));
                }
                Handler::Event { stop, .. } => stop.cancel(),
            }
        }
    }

    fn on_buffer(&self, buffer: Bytes) {
        match decode_message(buffer) {
            Ok(Message::Response(response)) => self.handle_response(response),
            Ok(Message::Request(_)) => {}
            Err(err) => {
                warn!(error = %err, "malformed frame; disconnecting");
                self.inner.protocol.disconnect();
            }
        }
    }

    /// Dispatch one decoded response.
    pub(crate) fn handle_response(&self, response: Response) {
        match response {
            Response::Initialize => {
                let changed = self.inner.initialized.send_if_modified(|ready| {
                    let changed = !*ready;
                    *ready = true;
                    changed
                });
                if changed {
                    debug!("channel client initialized");
                    self.inner.on_did_initialize.fire(());
                }
            }
            Response::PromiseSuccess { id, data } => self.inner.complete(id, Ok(data)),
            Response::PromiseError { id, error } => {
                self.inner.complete(id, Err(ChannelError::from_payload(error)))
            }
            Response::PromiseErrorObj { id, error } => {
                self.inner.complete(id, Err(ChannelError::Rejected(error)))
            }
            Response::EventFire { id, data } => {
                let emitter = match self.inner.lock().handlers.get(&id) {
                    Some(Handler::Event { emitter, .. }) => Some(emitter.clone()),
                    _ => None,
                };
                match emitter {
                    Some(emitter) => emitter.fire(data),
                    None => trace!(id, "event for unknown subscription"),
                }
            }
        }
    }
}

impl fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient")
            .field("initialized", &self.is_initialized())
            .field("outstanding", &self.outstanding())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alloc_id(&self) -> RequestId {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Best effort: a failed send is logged and the disconnect path cleans up.
    fn send(&self, request: Request) {
        match request.encode() {
            Ok(envelope) => self.send_bytes(envelope.into_bytes()),
            Err(err) => warn!(id = request.id(), error = %err, "failed to encode request"),
        }
    }

    fn send_bytes(&self, buffer: Bytes) {
        if let Err(err) = self.protocol.send(buffer) {
            debug!(error = %err, "request dropped");
        }
    }

    fn complete(&self, id: RequestId, result: Result<Value>) {
        let reply = {
            let mut state = self.lock();
            match state.handlers.remove(&id) {
                Some(Handler::Call(reply)) => reply,
                Some(other) => {
                    state.handlers.insert(id, other);
                    return;
                }
                None => {
                    trace!(id, "response for unknown call");
                    return;
                }
            }
        };
        let _ = reply.send(result);
    }

    async fn wait_initialized(&self, cancel: &CancellationToken) -> Result<()> {
        let mut ready = self.initialized.subscribe();
        let initialized = async move { ready.wait_for(|ready| *ready).await.map(|_| ()) };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChannelError::Canceled),
            _ = self.disposed.cancelled() => Err(ChannelError::Canceled),
            result = initialized => result.map_err(|_| ChannelError::Canceled),
        }
    }

    async fn call(
        self: &Arc<Self>,
        channel: &str,
        method: &str,
        arg: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        if cancel.is_cancelled() || self.disposed.is_cancelled() {
            return Err(ChannelError::Canceled);
        }
        let id = self.alloc_id();
        self.wait_initialized(&cancel).await?;

        let request = Request::Promise {
            id,
            channel: channel.to_owned(),
            method: method.to_owned(),
            arg,
        };
        let envelope = request.encode()?;

        let (reply, response) = oneshot::channel();
        {
            let mut state = self.lock();
            if self.disposed.is_cancelled() {
                return Err(ChannelError::Canceled);
            }
            state.handlers.insert(id, Handler::Call(reply));
        }
        trace!(id, channel, method, "call sent");
        self.send_bytes(envelope.into_bytes());

        let guard = CallGuard {
            inner: Arc::clone(self),
            id,
        };
        let result = tokio::select! {
            biased;
            result = response => result.unwrap_or(Err(ChannelError::Canceled)),
            _ = cancel.cancelled() => {
                debug!(id, channel, method, "call canceled");
                Err(ChannelError::Canceled)
            }
        };
        drop(guard);
        result
    }
}

/// Cancels a sent call on the remote side unless its response already
/// arrived. Covers both explicit cancellation and a dropped call future.
struct CallGuard {
    inner: Arc<ClientInner>,
    id: RequestId,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let handler = self.inner.lock().handlers.remove(&self.id);
        if handler.is_some() {
            self.inner.send(Request::PromiseCancel { id: self.id });
        }
    }
}

/// Handle to one remote channel.
#[derive(Clone)]
pub struct ChannelProxy {
    client: Arc<ClientInner>,
    channel: String,
}

impl ChannelProxy {
    pub fn name(&self) -> &str {
        &self.channel
    }

    /// Invoke `method` and wait for its result.
    pub async fn call(&self, method: &str, arg: impl Into<Value>) -> Result<Value> {
        self.call_with_cancel(method, arg, CancellationToken::new())
            .await
    }

    /// Invoke `method`; cancelling `cancel` rejects the call locally with
    /// [`ChannelError::Canceled`] and tells the remote side to stop.
    pub async fn call_with_cancel(
        &self,
        method: &str,
        arg: impl Into<Value>,
        cancel: CancellationToken,
    ) -> Result<Value> {
        self.client
            .call(&self.channel, method, arg.into(), cancel)
            .await
    }

    /// [`call`](Self::call) with serde conversion on both ends.
    pub async fn call_typed<A, R>(&self, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let arg = to_value(arg)?;
        let value = self.call(method, arg).await?;
        Ok(from_value(value)?)
    }

    /// Event `event` of this channel. Nothing is sent until the first
    /// listener subscribes.
    pub fn listen(&self, event: &str, arg: impl Into<Value>) -> RemoteEvent {
        RemoteEvent::new(
            Arc::downgrade(&self.client),
            self.channel.clone(),
            event.to_owned(),
            arg.into(),
        )
    }
}

impl fmt::Debug for ChannelProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelProxy")
            .field("channel", &self.channel)
            .finish()
    }
}

/// A lazily activated remote event.
///
/// The first subscriber sends `EventListen` (once the client is
/// initialized); the last one leaving sends `EventDispose`. Subscribing must
/// happen inside a tokio runtime.
#[derive(Clone)]
pub struct RemoteEvent {
    emitter: Emitter<Value>,
}

struct Activation {
    client: Weak<ClientInner>,
    channel: String,
    event: String,
    arg: Value,
    emitter: OnceLock<WeakEmitter<Value>>,
    active: Mutex<Option<(RequestId, CancellationToken)>>,
}

impl RemoteEvent {
    fn new(client: Weak<ClientInner>, channel: String, event: String, arg: Value) -> Self {
        let activation = Arc::new(Activation {
            client,
            channel,
            event,
            arg,
            emitter: OnceLock::new(),
            active: Mutex::new(None),
        });
        let (first, last) = (Arc::clone(&activation), Arc::clone(&activation));
        let emitter = Emitter::with_hooks(move || first.activate(), move || last.deactivate());
        let _ = activation.emitter.set(emitter.downgrade());
        Self { emitter }
    }

    pub fn subscribe(&self, listener: impl Fn(Value) + Send + Sync + 'static) -> Subscription {
        self.emitter.subscribe(listener)
    }

    /// Subscribe and receive the events as a [`Stream`]. Dropping the stream
    /// unsubscribes.
    pub fn stream(&self) -> RemoteEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |value| {
            let _ = tx.send(value);
        });
        RemoteEventStream {
            rx,
            _subscription: subscription,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.emitter.listener_count()
    }
}

impl fmt::Debug for RemoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEvent")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Activation {
    fn activate(&self) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let Some(emitter) = self.emitter.get().and_then(WeakEmitter::upgrade) else {
            return;
        };

        let id = client.alloc_id();
        let stop = CancellationToken::new();
        {
            let mut state = client.lock();
            if client.disposed.is_cancelled() {
                debug!(channel = %self.channel, event = %self.event, "listen on disposed client");
                return;
            }
            state.handlers.insert(
                id,
                Handler::Event {
                    emitter,
                    stop: stop.clone(),
                },
            );
        }
        *lock(&self.active) = Some((id, stop.clone()));

        let request = Request::EventListen {
            id,
            channel: self.channel.clone(),
            event: self.event.clone(),
            arg: self.arg.clone(),
        };
        tokio::spawn(run_listen(client, request, stop));
    }

    fn deactivate(&self) {
        let Some((id, stop)) = lock(&self.active).take() else {
            return;
        };
        if let Some(client) = self.client.upgrade() {
            let handler = client.lock().handlers.remove(&id);
            drop(handler);
        }
        stop.cancel();
    }
}

/// Owns the remote side of one event subscription: `EventListen` once the
/// client is ready, `EventDispose` when stopped. A single task keeps the two
/// frames in order.
async fn run_listen(client: Arc<ClientInner>, request: Request, stop: CancellationToken) {
    let id = request.id();
    if client.wait_initialized(&stop).await.is_err() {
        trace!(id, "listen abandoned before initialization");
        return;
    }
    client.send(request);
    stop.cancelled().await;
    client.send(Request::EventDispose { id });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Events of a [`RemoteEvent`] as a stream.
pub struct RemoteEventStream {
    rx: mpsc::UnboundedReceiver<Value>,
    _subscription: Subscription,
}

impl Stream for RemoteEventStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for RemoteEventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEventStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wallchan_transport::{MemoryProtocol, MessagePassingProtocol};

    use super::*;

    /// The far end of a client under test: decodes what the client sends and
    /// lets the test answer by hand.
    struct Remote {
        protocol: Arc<MemoryProtocol>,
        requests: mpsc::UnboundedReceiver<Request>,
        _sub: Subscription,
    }

    impl Remote {
        fn respond(&self, response: Response) {
            self.protocol
                .send(response.encode().unwrap().into_bytes())
                .unwrap();
        }

        async fn next(&mut self) -> Request {
            tokio::time::timeout(Duration::from_secs(1), self.requests.recv())
                .await
                .expect("request expected")
                .expect("protocol open")
        }

        async fn quiet(&mut self) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(self.requests.try_recv().is_err(), "unexpected request");
        }
    }

    fn setup() -> (ChannelClient, Remote) {
        let (local, remote) = MemoryProtocol::pair();
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = remote.on_message(Box::new(move |buffer| {
            if let Ok(Message::Request(request)) = decode_message(buffer) {
                let _ = tx.send(request);
            }
        }));
        (
            ChannelClient::new(local),
            Remote {
                protocol: remote,
                requests: rx,
                _sub: sub,
            },
        )
    }

    #[tokio::test]
    async fn calls_wait_for_initialize() {
        let (client, mut remote) = setup();
        let proxy = client.get_channel("math");
        let call = tokio::spawn(async move { proxy.call("add", Value::Int(1)).await });

        remote.quiet().await;
        assert!(!client.is_initialized());

        remote.respond(Response::Initialize);
        let Request::Promise { id, channel, method, .. } = remote.next().await else {
            panic!("expected promise");
        };
        assert_eq!((channel.as_str(), method.as_str()), ("math", "add"));

        remote.respond(Response::PromiseSuccess {
            id,
            data: Value::Int(5),
        });
        assert_eq!(call.await.unwrap().unwrap(), Value::Int(5));
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn initialize_transitions_once() {
        let (client, remote) = setup();
        let count = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&count);
        let _sub = client.on_did_initialize(move |()| *seen.lock().unwrap() += 1);

        remote.respond(Response::Initialize);
        remote.respond(Response::Initialize);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(client.is_initialized());
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn rejections_map_to_errors() {
        let (client, mut remote) = setup();
        remote.respond(Response::Initialize);
        let proxy = client.get_channel("c");

        let call = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.call("m", Value::Undefined).await })
        };
        let id = remote.next().await.id();
        remote.respond(Response::PromiseErrorObj {
            id,
            error: "plain".into(),
        });
        assert!(matches!(
            call.await.unwrap(),
            Err(ChannelError::Rejected(Value::String(s))) if s == "plain"
        ));

        let call = tokio::spawn(async move { proxy.call("m", Value::Undefined).await });
        let id = remote.next().await.id();
        remote.respond(Response::PromiseError {
            id,
            error: wallchan_codec::ErrorPayload::new("RangeError", "too big"),
        });
        match call.await.unwrap() {
            Err(ChannelError::Remote(err)) => assert_eq!(err.name, "RangeError"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn typed_calls_convert_both_ways() {
        #[derive(Serialize)]
        struct Args {
            a: i64,
            b: i64,
        }

        let (client, mut remote) = setup();
        remote.respond(Response::Initialize);
        let proxy = client.get_channel("math");
        let call = tokio::spawn(async move {
            proxy
                .call_typed::<_, i64>("add", &Args { a: 2, b: 3 })
                .await
        });

        let Request::Promise { id, arg, .. } = remote.next().await else {
            panic!("expected promise");
        };
        assert_eq!(arg.get("a"), Some(&Value::Int(2)));
        remote.respond(Response::PromiseSuccess {
            id,
            data: Value::Int(5),
        });
        assert_eq!(call.await.unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn dropped_call_future_cancels_remotely() {
        let (client, mut remote) = setup();
        remote.respond(Response::Initialize);
        let proxy = client.get_channel("slow");

        let call = tokio::spawn(async move { proxy.call("wait", Value::Undefined).await });
        let id = remote.next().await.id();
        call.abort();

        assert_eq!(remote.next().await, Request::PromiseCancel { id });
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn dispose_rejects_outstanding_and_later_calls() {
        let (client, mut remote) = setup();
        remote.respond(Response::Initialize);
        let proxy = client.get_channel("slow");

        let call = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.call("wait", Value::Undefined).await })
        };
        let id = remote.next().await.id();

        client.dispose();
        client.dispose();

        assert!(matches!(call.await.unwrap(), Err(ChannelError::Canceled)));
        assert_eq!(remote.next().await, Request::PromiseCancel { id });
        assert!(matches!(
            proxy.call("again", Value::Undefined).await,
            Err(ChannelError::Canceled)
        ));
        remote.quiet().await;
    }

    #[tokio::test]
    async fn late_responses_are_ignored() {
        let (client, mut remote) = setup();
        remote.respond(Response::Initialize);
        remote.respond(Response::PromiseSuccess {
            id: 42,
            data: Value::Null,
        });
        remote.respond(Response::EventFire {
            id: 43,
            data: Value::Null,
        });
        remote.quiet().await;
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn canceled_call_ignores_a_later_success_for_its_id() {
        let (client, mut remote) = setup();
        remote.respond(Response::Initialize);
        let proxy = client.get_channel("slow");

        let cancel = CancellationToken::new();
        let canceled = {
            let proxy = proxy.clone();
            let cancel = cancel.clone();
            tokio::spawn(
                async move { proxy.call_with_cancel("wait", Value::Undefined, cancel).await },
            )
        };
        let id = remote.next().await.id();
        let other = tokio::spawn(async move { proxy.call("wait", Value::Undefined).await });
        let other_id = remote.next().await.id();
        assert_ne!(id, other_id);

        cancel.cancel();
        assert!(matches!(canceled.await.unwrap(), Err(ChannelError::Canceled)));
        assert_eq!(remote.next().await, Request::PromiseCancel { id });

        remote.respond(Response::PromiseSuccess {
            id,
            data: Value::Int(1),
        });
        remote.quiet().await;
        assert_eq!(client.outstanding(), 1);
        assert!(!other.is_finished());

        remote.respond(Response::PromiseSuccess {
            id: other_id,
            data: Value::Int(2),
        });
        assert_eq!(other.await.unwrap().unwrap(), Value::Int(2));
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn remote_event_activates_lazily_and_streams() {
        use futures_util::StreamExt;

        let (client, mut remote) = setup();
        remote.respond(Response::Initialize);
        let event = client.get_channel("clock").listen("tick", Value::Undefined);

        remote.quiet().await;

        let mut stream = event.stream();
        let Request::EventListen { id, event: name, .. } = remote.next().await else {
            panic!("expected listen");
        };
        assert_eq!(name, "tick");

        for n in 0..3 {
            remote.respond(Response::EventFire {
                id,
                data: Value::Int(n),
            });
        }
        for n in 0..3 {
            assert_eq!(stream.next().await, Some(Value::Int(n)));
        }

        drop(stream);
        assert_eq!(remote.next().await, Request::EventDispose { id });
        remote.quiet().await;
    }

    #[tokio::test]
    async fn unsubscribing_before_initialize_sends_nothing() {
        let (client, mut remote) = setup();
        let event = client.get_channel("clock").listen("tick", Value::Undefined);

        let sub = event.subscribe(|_| {});
        drop(sub);
        remote.respond(Response::Initialize);

        remote.quiet().await;
        assert_eq!(client.outstanding(), 0);
    }
}
