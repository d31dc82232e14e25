#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wallchan_channel::{CallFuture, ChannelError, EventStream, ServerChannel};
use wallchan_codec::{decode_message, Message, Object, Request, Value};
use wallchan_transport::{MessagePassingProtocol, Subscription};

/// `add` sums `{a, b}`; `ctx` returns the connection context; `wait` parks
/// until canceled and reports the cancellation.
#[derive(Default)]
pub struct Math {
    pub started: Mutex<Option<mpsc::UnboundedSender<()>>>,
    pub canceled: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl Math {
    pub fn watched() -> (Arc<Self>, mpsc::UnboundedReceiver<()>, mpsc::UnboundedReceiver<()>) {
        let (started_tx, started) = mpsc::unbounded_channel();
        let (canceled_tx, canceled) = mpsc::unbounded_channel();
        let math = Math {
            started: Mutex::new(Some(started_tx)),
            canceled: Mutex::new(Some(canceled_tx)),
        };
        (Arc::new(math), started, canceled)
    }

    fn notify(slot: &Mutex<Option<mpsc::UnboundedSender<()>>>) {
        if let Some(tx) = slot.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }
}

impl ServerChannel<String> for Math {
    fn call(&self, ctx: &String, command: &str, arg: Value, cancel: CancellationToken) -> CallFuture {
        match command {
            "add" => {
                let a = arg.get("a").and_then(Value::as_i64).unwrap_or_default();
                let b = arg.get("b").and_then(Value::as_i64).unwrap_or_default();
                async move { Ok(Value::Int(a + b)) }.boxed()
            }
            "ctx" => {
                let ctx = ctx.clone();
                async move { Ok(Value::from(ctx)) }.boxed()
            }
            "wait" => {
                Math::notify(&self.started);
                let canceled = self.canceled.lock().unwrap().clone();
                async move {
                    cancel.cancelled().await;
                    if let Some(tx) = canceled {
                        let _ = tx.send(());
                    }
                    Err(ChannelError::Canceled)
                }
                .boxed()
            }
            other => {
                let message = format!("no method {other}");
                async move { Err(ChannelError::remote("Error", message)) }.boxed()
            }
        }
    }

    fn listen(&self, _: &String, event: &str, _: Value) -> Result<EventStream, ChannelError> {
        Err(ChannelError::remote("Error", format!("no event {event}")))
    }
}

/// Serves `tick`; each subscription's sender is handed to the test so it
/// decides what fires and can observe when the server drops the stream.
#[derive(Default)]
pub struct Clock {
    pub feeds: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
}

impl Clock {
    pub async fn feed(&self) -> mpsc::UnboundedSender<Value> {
        for _ in 0..100 {
            if let Some(tx) = self.feeds.lock().unwrap().pop() {
                return tx;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no subscription reached the clock");
    }
}

impl ServerChannel<String> for Clock {
    fn call(&self, _: &String, command: &str, _: Value, _: CancellationToken) -> CallFuture {
        let message = format!("no method {command}");
        async move { Err(ChannelError::remote("Error", message)) }.boxed()
    }

    fn listen(&self, _: &String, event: &str, _: Value) -> Result<EventStream, ChannelError> {
        if event != "tick" {
            return Err(ChannelError::remote("Error", format!("no event {event}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        });
        Ok(Box::pin(stream))
    }
}

/// Records every request crossing `protocol` toward its listeners.
pub struct Recorder {
    rx: mpsc::UnboundedReceiver<Message>,
    _sub: Subscription,
}

impl Recorder {
    pub fn attach(protocol: &dyn MessagePassingProtocol) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = protocol.on_message(Box::new(move |buffer| {
            if let Ok(message) = decode_message(buffer) {
                let _ = tx.send(message);
            }
        }));
        Self { rx, _sub: sub }
    }

    /// Next request, skipping responses.
    pub async fn request(&mut self) -> Request {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("frame expected")
                .expect("protocol open");
            if let Message::Request(request) = message {
                return request;
            }
        }
    }

    /// Everything recorded so far, after letting in-flight frames land.
    pub async fn drain(&mut self) -> Vec<Message> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }
}

pub fn add(a: i64, b: i64) -> Value {
    let mut object = Object::new();
    object.insert("a".into(), Value::Int(a));
    object.insert("b".into(), Value::Int(b));
    Value::Object(object)
}
