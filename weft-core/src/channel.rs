//! In-process async FIFO queue: bounded buffer, direct waiter handoff, best-effort send.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A pending wait was cancelled before a matching `send` arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait cancelled")]
pub struct Cancelled;

/// FIFO queue with a maximum outstanding size. `send` never suspends; a full
/// buffer drops the item. `pop` suspends until an item arrives.
///
/// At any instant either the buffer or the waiter list is non-empty, never
/// both: a send with a waiting consumer hands the item over directly.
pub struct Channel<T> {
    capacity: usize,
    state: Mutex<State<T>>,
}

struct State<T> {
    buffer: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
}

enum Pop<T> {
    Ready(T),
    Wait(oneshot::Receiver<T>),
}

impl<T> Channel<T> {
    /// Channel buffering at most `capacity` items while no consumer waits.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Channel that never rejects a send.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered items plus live waiting consumers. Diagnostics only.
    pub fn size(&self) -> usize {
        let state = self.lock();
        state.buffer.len() + state.waiters.iter().filter(|w| !w.is_closed()).count()
    }

    /// Deliver to the oldest waiting consumer, or buffer if under capacity.
    /// Returns `false` when the buffer is full and nobody waits: the item is
    /// dropped, not queued. Callers must treat `false` as silent loss.
    pub fn send(&self, item: T) -> bool {
        let mut state = self.lock();
        let mut item = item;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return true,
                // The waiter's pop was cancelled; try the next one.
                Err(returned) => item = returned,
            }
        }
        if state.buffer.len() >= self.capacity {
            return false;
        }
        state.buffer.push_back(item);
        true
    }

    /// Dequeue the next item, suspending until a `send` arrives.
    pub async fn pop(&self) -> T {
        match self.begin_pop() {
            Pop::Ready(item) => item,
            Pop::Wait(rx) => match rx.await {
                Ok(item) => item,
                // The paired sender lives in our own waiter queue, which
                // cannot be dropped while `self` is borrowed.
                Err(_) => unreachable!("channel waiter dropped while channel alive"),
            },
        }
    }

    /// Like [`pop`](Self::pop), but resolves with [`Cancelled`] when the token
    /// fires first. The abandoned waiter slot is skipped by later sends.
    pub async fn pop_cancellable(&self, cancel: &CancellationToken) -> Result<T, Cancelled> {
        match self.begin_pop() {
            Pop::Ready(item) => Ok(item),
            Pop::Wait(mut rx) => {
                tokio::select! {
                    biased;
                    item = &mut rx => match item {
                        Ok(item) => Ok(item),
                        Err(_) => unreachable!("channel waiter dropped while channel alive"),
                    },
                    _ = cancel.cancelled() => {
                        // Shut the slot first: a send racing the cancellation
                        // either landed already (salvage it below) or now fails
                        // over to the next waiter or the buffer.
                        rx.close();
                        match rx.try_recv() {
                            Ok(item) => Ok(item),
                            Err(_) => Err(Cancelled),
                        }
                    }
                }
            }
        }
    }

    fn begin_pop(&self) -> Pop<T> {
        let mut state = self.lock();
        if let Some(item) = state.buffer.pop_front() {
            return Pop::Ready(item);
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Pop::Wait(rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        // Lock is only held for queue bookkeeping; poisoning would mean a
        // panic mid-push on a VecDeque, which cannot leave it inconsistent.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
