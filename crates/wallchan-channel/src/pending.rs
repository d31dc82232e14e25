//! Requests held for channels that have not been registered yet.

use std::collections::{HashMap, VecDeque};

use tokio::task::AbortHandle;
use wallchan_codec::{Request, RequestId};

struct PendingRequest {
    key: u64,
    request: Request,
    timer: AbortHandle,
}

/// Per-channel FIFO of requests, each with a running expiry timer.
///
/// Every entry leaves the queue exactly once: through [`take`](Self::take)
/// when its channel is registered, through [`expire`](Self::expire) when its
/// timer fires, or through [`remove_id`](Self::remove_id) / [`clear`](Self::clear).
/// The owner serializes those calls under one lock.
#[derive(Default)]
pub(crate) struct PendingQueue {
    next_key: u64,
    queues: HashMap<String, VecDeque<PendingRequest>>,
}

impl PendingQueue {
    /// Reserve the key the next entry's timer will expire.
    pub(crate) fn next_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    pub(crate) fn push(&mut self, channel: &str, key: u64, request: Request, timer: AbortHandle) {
        self.queues
            .entry(channel.to_owned())
            .or_default()
            .push_back(PendingRequest {
                key,
                request,
                timer,
            });
    }

    /// Remove the entry a timer was armed for. `None` if it already left.
    pub(crate) fn expire(&mut self, channel: &str, key: u64) -> Option<Request> {
        let queue = self.queues.get_mut(channel)?;
        let index = queue.iter().position(|entry| entry.key == key)?;
        let entry = queue.remove(index)?;
        if queue.is_empty() {
            self.queues.remove(channel);
        }
        Some(entry.request)
    }

    /// Drain a channel's queue in arrival order, stopping every timer.
    pub(crate) fn take(&mut self, channel: &str) -> Vec<Request> {
        self.queues
            .remove(channel)
            .map(|queue| {
                queue
                    .into_iter()
                    .map(|entry| {
                        entry.timer.abort();
                        entry.request
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop a queued request by id, e.g. when its caller cancels first.
    pub(crate) fn remove_id(&mut self, id: RequestId) -> Option<Request> {
        let channel = self
            .queues
            .iter()
            .find(|(_, queue)| queue.iter().any(|entry| entry.request.id() == id))
            .map(|(channel, _)| channel.clone())?;
        let queue = self.queues.get_mut(&channel)?;
        let index = queue.iter().position(|entry| entry.request.id() == id)?;
        let entry = queue.remove(index)?;
        if queue.is_empty() {
            self.queues.remove(&channel);
        }
        entry.timer.abort();
        Some(entry.request)
    }

    pub(crate) fn clear(&mut self) {
        for (_, queue) in self.queues.drain() {
            for entry in queue {
                entry.timer.abort();
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}
