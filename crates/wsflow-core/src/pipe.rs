//! Backpressure-aware single-consumer FIFO with a terminal marker.
//!
//! A [`Pipe`] is the only channel between two pipeline stages. Producers
//! [`put`](Pipe::put) values, the single consumer [`get`](Pipe::get)s
//! [`Item`]s. Once [`stop`](Pipe::stop) is called the pipe refuses new values
//! and, after every value queued before the stop has been read, yields
//! [`Item::EndOfStream`] forever.
//!
//! ```text
//! producer ──put──► [ v1 v2 v3 | EOS ] ──get──► consumer
//!                              ▲
//!                    stop() records the sentinel position
//! ```
//!
//! The sentinel is positional: it never occupies queue capacity, so stopping a
//! full pipe cannot block and cannot be observed before the buffered values.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::PipeError;

/// One element read from a [`Pipe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item<T> {
    Value(T),
    /// Terminal marker: no more values will ever be produced.
    EndOfStream,
}

impl<T> Item<T> {
    pub fn is_end(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::EndOfStream => None,
        }
    }

    /// Normalize a drained sequence so it ends with exactly one sentinel.
    ///
    /// Everything after the first sentinel is discarded; a sentinel is
    /// appended when none is present.
    pub fn sentinelize(mut items: Vec<Item<T>>) -> Vec<Item<T>> {
        match items.iter().position(Item::is_end) {
            Some(pos) => items.truncate(pos + 1),
            None => items.push(Item::EndOfStream),
        }
        items
    }
}

/// Retry policy for [`Pipe::put_with`].
///
/// The delay before retry `n` is `n * (wait_ms ^ n) / 1000` seconds, capped at
/// `max_wait_per_retry`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PutOptions {
    pub wait_time: Duration,
    pub max_retries: u32,
    pub max_wait_per_retry: Duration,
}

impl Default for PutOptions {
    /// A single non-blocking attempt.
    fn default() -> Self {
        Self {
            wait_time: Duration::ZERO,
            max_retries: 0,
            max_wait_per_retry: Duration::from_secs(10),
        }
    }
}

impl PutOptions {
    /// Budget used by the connectors after a first `Full` failure.
    pub const fn retrying() -> Self {
        Self {
            wait_time: Duration::from_millis(100),
            max_retries: 3,
            max_wait_per_retry: Duration::from_secs(1),
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let wait_ms = self.wait_time.as_secs_f64() * 1000.0;
        let raw = f64::from(retry) * wait_ms.powi(retry as i32) / 1000.0;
        let capped = raw.min(self.max_wait_per_retry.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

struct PipeState<T> {
    queue: VecDeque<T>,
    stopped: bool,
    /// Values left to read before the sentinel becomes visible.
    sentinel_position: Option<usize>,
    /// The sentinel has been handed out at least once.
    terminated: bool,
    /// Accepted puts (and the stop signal) not yet acknowledged by `task_done`.
    unfinished: usize,
}

impl<T> PipeState<T> {
    fn pop(&mut self) -> Option<Item<T>> {
        if self.terminated {
            return Some(Item::EndOfStream);
        }
        match self.sentinel_position {
            Some(0) => {
                self.terminated = true;
                Some(Item::EndOfStream)
            }
            Some(n) => {
                let value = self.queue.pop_front()?;
                self.sentinel_position = Some(n - 1);
                Some(Item::Value(value))
            }
            None => self.queue.pop_front().map(Item::Value),
        }
    }
}

struct Shared<T> {
    state: Mutex<PipeState<T>>,
    changed: Notify,
    capacity: Option<usize>,
    release_to_runtime: bool,
}

/// Cloneable handle to a shared queue. All clones see the same items.
pub struct Pipe<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Pipe")
            .field("size", &st.queue.len())
            .field("capacity", &self.shared.capacity)
            .field("stopped", &st.stopped)
            .field("terminated", &st.terminated)
            .finish()
    }
}

impl<T> Default for Pipe<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> Pipe<T> {
    /// Create a pipe holding at most `capacity` values; `0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self::with_options(capacity, true)
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// `release_to_runtime` yields to the scheduler after every successful
    /// put so consumers get a chance to run between bursts.
    pub fn with_options(capacity: usize, release_to_runtime: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PipeState {
                    queue: VecDeque::new(),
                    stopped: false,
                    sentinel_position: None,
                    terminated: false,
                    unfinished: 0,
                }),
                changed: Notify::new(),
                capacity: (capacity > 0).then_some(capacity),
                release_to_runtime,
            }),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    pub fn size(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        match self.shared.capacity {
            Some(cap) => self.size() >= cap,
            None => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Single non-blocking attempt that hands the value back on failure.
    pub fn offer(&self, value: T) -> Result<(), (PipeError, T)> {
        {
            let mut st = self.shared.state.lock();
            if st.stopped {
                return Err((PipeError::Closed, value));
            }
            if let Some(cap) = self.shared.capacity {
                if st.queue.len() >= cap {
                    return Err((PipeError::Full, value));
                }
            }
            st.queue.push_back(value);
            st.unfinished += 1;
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    /// Single non-blocking attempt.
    pub fn try_put(&self, value: T) -> Result<(), PipeError> {
        self.offer(value).map_err(|(e, _)| e)
    }

    /// Put with the default options: one attempt, `Full` if there is no room.
    pub async fn put(&self, value: T) -> Result<(), PipeError> {
        self.put_with(value, PutOptions::default()).await
    }

    /// Put with bounded retries while the pipe is full.
    ///
    /// A closed pipe fails with [`PipeError::Closed`] immediately, including
    /// when it gets stopped between two retries.
    pub async fn put_with(&self, value: T, options: PutOptions) -> Result<(), PipeError> {
        let mut value = value;
        let mut retry = 0u32;
        loop {
            match self.offer(value) {
                Ok(()) => break,
                Err((PipeError::Closed, _)) => return Err(PipeError::Closed),
                Err((PipeError::Full, rejected)) => {
                    if retry >= options.max_retries {
                        debug!("pipe full after {} attempt(s)", retry + 1);
                        return Err(PipeError::Full);
                    }
                    let delay = options.delay_for(retry);
                    retry += 1;
                    debug!("pipe full {retry}/{} - retrying in {delay:?}", options.max_retries);
                    tokio::time::sleep(delay).await;
                    value = rejected;
                }
            }
        }
        if self.shared.release_to_runtime {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Wait for capacity as long as it takes. Still fails on a closed pipe.
    pub async fn put_wait(&self, value: T) -> Result<(), PipeError> {
        let mut value = value;
        loop {
            let notified = self.shared.changed.notified();
            match self.offer(value) {
                Ok(()) => break,
                Err((PipeError::Closed, _)) => return Err(PipeError::Closed),
                Err((PipeError::Full, rejected)) => {
                    value = rejected;
                    notified.await;
                }
            }
        }
        if self.shared.release_to_runtime {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Non-blocking read. `None` when nothing is available yet.
    pub fn try_get(&self) -> Option<Item<T>> {
        let item = self.shared.state.lock().pop();
        if matches!(item, Some(Item::Value(_))) {
            self.shared.changed.notify_waiters();
        }
        item
    }

    /// Wait for the next value or the sentinel. Cancel-safe: dropping the
    /// future never loses an item.
    pub async fn get(&self) -> Item<T> {
        loop {
            let notified = self.shared.changed.notified();
            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    /// Close the pipe. Only the first call has an effect.
    pub fn stop(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.sentinel_position = Some(st.queue.len());
            st.unfinished += 1;
        }
        self.shared.changed.notify_waiters();
    }

    /// Atomically drain every buffered value, in order.
    ///
    /// On a stopped pipe the sentinel is appended and the pipe becomes
    /// terminal; an open pipe stays open and keeps accepting values.
    pub fn snapshot(&self) -> Vec<Item<T>> {
        let items = {
            let mut st = self.shared.state.lock();
            let mut items: Vec<Item<T>> = st.queue.drain(..).map(Item::Value).collect();
            if st.stopped {
                st.sentinel_position = Some(0);
                if !st.terminated {
                    st.terminated = true;
                    items.push(Item::EndOfStream);
                }
            }
            items
        };
        self.shared.changed.notify_waiters();
        items
    }

    /// Acknowledge one item previously returned by `get`.
    pub fn task_done(&self) {
        let done = {
            let mut st = self.shared.state.lock();
            st.unfinished = st.unfinished.saturating_sub(1);
            st.unfinished == 0
        };
        if done {
            self.shared.changed.notify_waiters();
        }
    }

    /// Wait until every accepted item has been acknowledged with `task_done`.
    pub async fn join(&self) {
        loop {
            let notified = self.shared.changed.notified();
            if self.shared.state.lock().unfinished == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<T: Send + 'static> Pipe<T> {
    /// Adapt the read side into a `Stream` that ends at the sentinel.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        stream::unfold(self, |pipe| async move {
            match pipe.get().await {
                Item::Value(v) => Some((v, pipe)),
                Item::EndOfStream => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    fn fast_retry(max_retries: u32) -> PutOptions {
        PutOptions {
            wait_time: Duration::from_millis(5),
            max_retries,
            max_wait_per_retry: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn values_then_sentinel_forever() {
        let pipe = Pipe::new(10);
        for i in 0..5 {
            pipe.put(i).await.unwrap();
        }
        pipe.stop();

        for i in 0..5 {
            assert_eq!(pipe.get().await, Item::Value(i));
        }
        for _ in 0..3 {
            assert_eq!(pipe.get().await, Item::EndOfStream);
        }
    }

    #[tokio::test]
    async fn put_after_stop_is_closed() {
        let empty: Pipe<u32> = Pipe::new(2);
        empty.stop();
        assert_eq!(empty.put(1).await, Err(PipeError::Closed));

        let full = Pipe::new(1);
        full.put(1).await.unwrap();
        full.stop();
        assert_eq!(full.put(2).await, Err(PipeError::Closed));
        assert_eq!(full.put_with(2, fast_retry(5)).await, Err(PipeError::Closed));
        assert_eq!(full.put_wait(2).await, Err(PipeError::Closed));
    }

    #[tokio::test]
    async fn stop_on_full_pipe_keeps_buffered_value_first() {
        let pipe = Pipe::new(1);
        pipe.put("only").await.unwrap();
        assert!(pipe.is_full());
        pipe.stop();

        assert_eq!(pipe.get().await, Item::Value("only"));
        assert_eq!(pipe.get().await, Item::EndOfStream);
    }

    #[tokio::test]
    async fn stop_twice_is_a_noop() {
        let pipe = Pipe::new(0);
        pipe.put(1).await.unwrap();
        pipe.stop();
        pipe.stop();
        assert_eq!(pipe.get().await, Item::Value(1));
        assert_eq!(pipe.get().await, Item::EndOfStream);
    }

    #[tokio::test]
    async fn snapshot_on_fresh_pipe_is_empty_and_open() {
        let pipe: Pipe<u8> = Pipe::new(4);
        assert!(pipe.snapshot().is_empty());
        assert!(!pipe.is_stopped());
        pipe.put(7).await.unwrap();
        assert_eq!(pipe.get().await, Item::Value(7));
    }

    #[tokio::test]
    async fn snapshot_drains_in_order() {
        let pipe = Pipe::new(0);
        for i in 0..4 {
            pipe.put(i).await.unwrap();
        }
        let snap = pipe.snapshot();
        assert_eq!(snap, vec![Item::Value(0), Item::Value(1), Item::Value(2), Item::Value(3)]);
        assert!(pipe.is_empty());
        assert!(pipe.try_get().is_none());
    }

    #[tokio::test]
    async fn snapshot_of_stopped_pipe_includes_sentinel() {
        let pipe = Pipe::new(2);
        pipe.put(1).await.unwrap();
        pipe.put(2).await.unwrap();
        pipe.stop();

        let snap = pipe.snapshot();
        assert_eq!(snap, vec![Item::Value(1), Item::Value(2), Item::EndOfStream]);
        assert_eq!(pipe.get().await, Item::EndOfStream);
    }

    #[tokio::test]
    async fn default_put_fails_fast_when_full() {
        let pipe = Pipe::new(1);
        pipe.put(1).await.unwrap();
        assert_eq!(pipe.put(2).await, Err(PipeError::Full));
        assert_eq!(pipe.put_with(2, fast_retry(2)).await, Err(PipeError::Full));
        assert_eq!(pipe.size(), 1);
    }

    #[tokio::test]
    async fn put_with_retries_succeeds_once_room_frees_up() {
        let pipe = Pipe::new(1);
        pipe.put(1).await.unwrap();

        let consumer = pipe.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            consumer.get().await
        });

        let options = PutOptions {
            wait_time: Duration::from_millis(10),
            max_retries: 20,
            max_wait_per_retry: Duration::from_millis(10),
        };
        pipe.put_with(2, options).await.unwrap();
        assert_eq!(handle.await.unwrap(), Item::Value(1));
        assert_eq!(pipe.get().await, Item::Value(2));
    }

    #[tokio::test]
    async fn put_wait_blocks_until_consumed() {
        let pipe = Pipe::new(1);
        pipe.put(1).await.unwrap();

        let producer = pipe.clone();
        let handle = tokio::spawn(async move { producer.put_wait(2).await });

        assert!(timeout(SHORT, async { while !handle.is_finished() { tokio::task::yield_now().await } }).await.is_err());
        assert_eq!(pipe.get().await, Item::Value(1));
        handle.await.unwrap().unwrap();
        assert_eq!(pipe.get().await, Item::Value(2));
    }

    #[tokio::test]
    async fn get_waits_for_producer() {
        let pipe: Pipe<u32> = Pipe::new(0);
        assert!(timeout(SHORT, pipe.get()).await.is_err());

        let producer = pipe.clone();
        tokio::spawn(async move {
            producer.put(42).await.unwrap();
        });
        let item = timeout(Duration::from_secs(1), pipe.get()).await.unwrap();
        assert_eq!(item, Item::Value(42));
    }

    #[tokio::test]
    async fn stop_wakes_blocked_consumer() {
        let pipe: Pipe<u32> = Pipe::new(0);
        let consumer = pipe.clone();
        let handle = tokio::spawn(async move { consumer.get().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        pipe.stop();
        let item = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(item, Item::EndOfStream);
    }

    #[tokio::test]
    async fn join_waits_for_task_done() {
        let pipe = Pipe::new(0);
        pipe.put(1).await.unwrap();
        pipe.put(2).await.unwrap();
        assert!(timeout(SHORT, pipe.join()).await.is_err());

        pipe.get().await;
        pipe.task_done();
        pipe.get().await;
        pipe.task_done();
        timeout(Duration::from_secs(1), pipe.join()).await.unwrap();
    }

    #[tokio::test]
    async fn into_stream_ends_at_sentinel() {
        let pipe = Pipe::new(0);
        for s in ["a", "b", "c"] {
            pipe.put(s.to_string()).await.unwrap();
        }
        pipe.stop();
        let collected: Vec<String> = pipe.into_stream().collect().await;
        assert_eq!(collected, vec!["a", "b", "c"]);
    }

    #[test]
    fn sentinelize_appends_or_truncates() {
        let appended = Item::sentinelize(vec![Item::Value(1), Item::Value(2)]);
        assert_eq!(appended, vec![Item::Value(1), Item::Value(2), Item::EndOfStream]);

        let truncated = Item::sentinelize(vec![Item::Value(1), Item::EndOfStream, Item::Value(3)]);
        assert_eq!(truncated, vec![Item::Value(1), Item::EndOfStream]);

        let empty: Vec<Item<u8>> = Item::sentinelize(Vec::new());
        assert_eq!(empty, vec![Item::EndOfStream]);
    }

    #[test]
    fn retry_delay_grows_and_is_capped() {
        let opts = PutOptions::retrying();
        assert_eq!(opts.delay_for(0), Duration::ZERO);
        let first = opts.delay_for(1);
        assert!(first >= Duration::from_millis(99) && first <= Duration::from_millis(101));
        assert_eq!(opts.delay_for(2), Duration::from_secs(1));
        assert_eq!(opts.delay_for(30), Duration::from_secs(1));
        assert_eq!(PutOptions::default().delay_for(3), Duration::ZERO);
    }
}
