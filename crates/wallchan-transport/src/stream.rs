use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError};
use crate::event::{Emitter, Subscription};
use crate::framing::{FrameCodec, FrameConfig};
use crate::protocol::{ClientConnection, MessagePassingProtocol};

/// Upper bound on writing out the send queue once the stream is closing.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Message passing over any byte stream (Unix socket, pipe, TCP).
///
/// A reader task decodes frames and fires them to listeners; a writer task
/// drains the send queue. Either task stopping (EOF, I/O error, bad frame,
/// [`disconnect`](MessagePassingProtocol::disconnect)) stops both and cancels
/// the closed token.
pub struct StreamProtocol {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Emitter<Bytes>,
    closed: CancellationToken,
}

impl StreamProtocol {
    /// Take ownership of `stream` and start the reader/writer tasks.
    pub fn spawn<S>(stream: S, config: FrameConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let protocol = Arc::new(Self {
            outbound: tx,
            inbound: Emitter::buffered(),
            closed: CancellationToken::new(),
        });

        tokio::spawn(read_loop(
            FramedRead::new(read_half, FrameCodec::new(config.clone())),
            protocol.inbound.clone(),
            protocol.closed.clone(),
        ));
        tokio::spawn(write_loop(
            FramedWrite::new(write_half, FrameCodec::new(config)),
            rx,
            protocol.closed.clone(),
        ));

        protocol
    }

    /// Cancelled once the stream has stopped.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Wrap as a connection announcement.
    pub fn into_connection(self: Arc<Self>, label: impl Into<String>) -> ClientConnection {
        let closed = self.closed.clone();
        ClientConnection::new(self, closed, label)
    }
}

impl MessagePassingProtocol for StreamProtocol {
    fn send(&self, buffer: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(buffer)
            .map_err(|_| TransportError::Closed)
    }

    fn on_message(&self, listener: Box<dyn Fn(Bytes) + Send + Sync>) -> Subscription {
        self.inbound.subscribe(listener)
    }

    fn disconnect(&self) {
        self.closed.cancel();
    }
}

async fn read_loop<R>(
    mut reader: FramedRead<R, FrameCodec>,
    inbound: Emitter<Bytes>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = reader.next() => match next {
                Some(Ok(buffer)) => {
                    trace!(size = buffer.len(), "received frame");
                    inbound.fire(buffer);
                }
                Some(Err(err)) => {
                    warn!(error = %err, "dropping stream after bad frame");
                    break;
                }
                None => {
                    debug!("stream closed by peer");
                    break;
                }
            },
        }
    }
    closed.cancel();
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => {
                let flush = flush_queued(&mut writer, &mut rx);
                if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await.is_err() {
                    debug!("peer stopped reading; dropping queued frames");
                }
                break;
            }
            next = rx.recv() => match next {
                Some(buffer) => {
                    if let Err(err) = writer.send(buffer).await {
                        debug!(error = %err, "stream write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    closed.cancel();
}

/// Write what was queued before the close so a final cancel or dispose
/// frame still reaches the peer.
async fn flush_queued<W>(
    writer: &mut FramedWrite<W, FrameCodec>,
    rx: &mut mpsc::UnboundedReceiver<Bytes>,
) where
    W: AsyncWrite + Unpin,
{
    rx.close();
    let mut queued = 0usize;
    while let Ok(buffer) = rx.try_recv() {
        if let Err(err) = writer.feed(buffer).await {
            debug!(error = %err, "stream write failed while closing");
            return;
        }
        queued += 1;
    }
    if queued == 0 {
        return;
    }
    match writer.flush().await {
        Ok(()) => trace!(queued, "flushed queued frames on close"),
        Err(err) => debug!(error = %err, "stream flush failed while closing"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn collect(protocol: &StreamProtocol) -> (Subscription, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = protocol.on_message(Box::new(move |buffer| {
            let _ = tx.send(buffer);
        }));
        (sub, rx)
    }

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (a, b) = tokio::io::duplex(64);
        let left = StreamProtocol::spawn(a, FrameConfig::default());
        let right = StreamProtocol::spawn(b, FrameConfig::default());
        let (_sub, mut rx) = collect(&right);

        left.send(Bytes::from_static(b"ping")).unwrap();
        left.send(Bytes::from(vec![0xAB; 1024])).unwrap();

        assert_eq!(rx.recv().await.unwrap().as_ref(), b"ping");
        assert_eq!(rx.recv().await.unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn peer_eof_cancels_closed_token() {
        let (a, b) = tokio::io::duplex(64);
        let left = StreamProtocol::spawn(a, FrameConfig::default());
        drop(b);

        tokio::time::timeout(Duration::from_secs(1), left.closed_token().cancelled())
            .await
            .expect("closed token should fire");
        assert!(matches!(
            left.send(Bytes::from_static(b"x")),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn garbage_on_the_wire_closes_the_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        let left = StreamProtocol::spawn(a, FrameConfig::default());

        b.write_all(&[0xFF, 0xFF, 0, 0, 0, 0]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), left.closed_token().cancelled())
            .await
            .expect("closed token should fire");
    }

    #[tokio::test]
    async fn frames_sent_before_disconnect_still_arrive() {
        let (a, b) = tokio::io::duplex(64);
        let left = StreamProtocol::spawn(a, FrameConfig::default());
        let right = StreamProtocol::spawn(b, FrameConfig::default());
        let (_sub, mut rx) = collect(&right);

        left.send(Bytes::from_static(b"cancel-7")).unwrap();
        left.send(Bytes::from_static(b"dispose-9")).unwrap();
        left.disconnect();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(first.unwrap().as_ref(), b"cancel-7");
        assert_eq!(second.unwrap().as_ref(), b"dispose-9");
    }

    #[tokio::test]
    async fn local_disconnect_stops_both_tasks() {
        let (a, b) = tokio::io::duplex(64);
        let left = StreamProtocol::spawn(a, FrameConfig::default());
        let right = StreamProtocol::spawn(b, FrameConfig::default());

        left.disconnect();

        tokio::time::timeout(Duration::from_secs(1), right.closed_token().cancelled())
            .await
            .expect("remote side should observe EOF");
    }
}
