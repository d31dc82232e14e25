//! Listener registries with explicit subscription handles.
//!
//! Every subscription returns a [`Subscription`] that owns exactly one
//! unsubscribe action. Dropping the handle (or calling
//! [`Subscription::dispose`]) runs it once.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Callback invoked for every fired event.
pub type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Owns one dispose action and runs it at most once.
#[must_use = "dropping a subscription disposes it immediately"]
pub struct Subscription {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a dispose action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A subscription with nothing to dispose.
    pub fn empty() -> Self {
        Self { action: None }
    }

    /// Run the dispose action. Later calls are no-ops.
    pub fn dispose(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }

    /// Whether the dispose action has already run (or never existed).
    pub fn is_disposed(&self) -> bool {
        self.action.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Multi-listener event source.
///
/// Listeners run synchronously on the firing task, outside the internal lock,
/// so a listener may subscribe, unsubscribe or fire again without deadlocking.
pub struct Emitter<T> {
    inner: Arc<EmitterInner<T>>,
}

struct EmitterInner<T> {
    state: Mutex<EmitterState<T>>,
    on_first_listener: Option<Hook>,
    on_last_listener: Option<Hook>,
}

struct EmitterState<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
    /// `Some` when events fired without listeners are kept for the first one.
    buffer: Option<VecDeque<T>>,
    /// A subscriber is draining `buffer`; new events queue behind it.
    replaying: bool,
}

/// Non-owning handle to an [`Emitter`]; does not keep its listeners alive.
pub struct WeakEmitter<T> {
    inner: Weak<EmitterInner<T>>,
}

impl<T> WeakEmitter<T> {
    pub fn upgrade(&self) -> Option<Emitter<T>> {
        self.inner.upgrade().map(|inner| Emitter { inner })
    }
}

impl<T> Clone for WeakEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WeakEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEmitter")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Events fired with no listeners are dropped.
    pub fn new() -> Self {
        Self::build(false, None, None)
    }

    /// Events fired with no listeners are queued and delivered, in order, to
    /// the next listener that subscribes.
    pub fn buffered() -> Self {
        Self::build(true, None, None)
    }

    /// Run `on_first` when the listener count goes 0 → 1 and `on_last` when it
    /// goes 1 → 0.
    pub fn with_hooks(
        on_first: impl Fn() + Send + Sync + 'static,
        on_last: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::build(false, Some(Arc::new(on_first)), Some(Arc::new(on_last)))
    }

    fn build(buffered: bool, on_first: Option<Hook>, on_last: Option<Hook>) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                state: Mutex::new(EmitterState {
                    next_id: 0,
                    listeners: Vec::new(),
                    buffer: buffered.then(VecDeque::new),
                    replaying: false,
                }),
                on_first_listener: on_first,
                on_last_listener: on_last,
            }),
        }
    }

    /// Attach a listener.
    ///
    /// On a buffered emitter the backlog is replayed one event at a time to
    /// whoever is subscribed at that moment, so a listener that hands over to
    /// other listeners mid-replay passes the rest of the backlog on to them.
    pub fn subscribe(&self, listener: impl Fn(T) + Send + Sync + 'static) -> Subscription {
        let listener: Listener<T> = Arc::new(listener);
        let (id, first, replay) = {
            let mut state = lock(&self.inner.state);
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.push((id, listener));
            let first = state.listeners.len() == 1;
            let replay = !state.replaying
                && state.buffer.as_ref().is_some_and(|buffer| !buffer.is_empty());
            if replay {
                state.replaying = true;
            }
            (id, first, replay)
        };

        if first {
            if let Some(hook) = &self.inner.on_first_listener {
                hook();
            }
        }
        if replay {
            self.replay_backlog();
        }

        let weak: Weak<EmitterInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let emptied = {
                let mut state = lock(&inner.state);
                let before = state.listeners.len();
                state.listeners.retain(|(listener_id, _)| *listener_id != id);
                before != state.listeners.len() && state.listeners.is_empty()
            };
            if emptied {
                if let Some(hook) = &inner.on_last_listener {
                    hook();
                }
            }
        })
    }

    /// Deliver `event` to every current listener.
    pub fn fire(&self, event: T) {
        let listeners: Vec<Listener<T>> = {
            let mut state = lock(&self.inner.state);
            if state.replaying || state.listeners.is_empty() {
                if let Some(buffer) = state.buffer.as_mut() {
                    buffer.push_back(event);
                }
                return;
            }
            snapshot(&state)
        };

        for listener in listeners {
            listener(event.clone());
        }
    }

    fn replay_backlog(&self) {
        loop {
            let (event, listeners) = {
                let mut state = lock(&self.inner.state);
                let next = if state.listeners.is_empty() {
                    None
                } else {
                    state.buffer.as_mut().and_then(VecDeque::pop_front)
                };
                match next {
                    Some(event) => (event, snapshot(&state)),
                    None => {
                        state.replaying = false;
                        return;
                    }
                }
            };
            for listener in listeners {
                listener(event.clone());
            }
        }
    }

    /// A handle that does not keep this emitter alive. Hooks that need to
    /// reach their own emitter capture one of these.
    pub fn downgrade(&self) -> WeakEmitter<T> {
        WeakEmitter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.state).listeners.len()
    }

    /// Drop every listener and any buffered events without running hooks.
    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        state.listeners.clear();
        if let Some(buffer) = state.buffer.as_mut() {
            buffer.clear();
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Emitter")
            .field("listeners", &state.listeners.len())
            .field("buffered", &state.buffer.as_ref().map(VecDeque::len))
            .finish()
    }
}

fn snapshot<T>(state: &EmitterState<T>) -> Vec<Listener<T>> {
    state
        .listeners
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
