// Bounded request dispatcher
// Admits at most N operations at a time, FIFO among waiters, queued work is cancellable

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::error::DispatchError;

const DEFAULT_MAX_CONCURRENT: usize = 6;
const DEFAULT_DRAIN_INTERVAL_MS: u64 = 50;

/// Admission ceiling and scheduling tick, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    pub drain_interval: Duration,
}

impl DispatcherConfig {
    pub fn new(max_concurrent: usize, drain_interval_ms: u64) -> Self {
        Self {
            max_concurrent,
            drain_interval: Duration::from_millis(drain_interval_ms),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT, DEFAULT_DRAIN_INTERVAL_MS)
    }
}

/// Type-erased deferred operation
trait Job: Send {
    /// Run the operation and deliver its output to the submitter
    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;

    /// Reject the submitter without running
    fn cancel(self: Box<Self>);
}

struct Operation<F, T> {
    thunk: F,
    reply: oneshot::Sender<Result<T, DispatchError>>,
}

impl<F, Fut, T> Job for Operation<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Operation { thunk, reply } = *self;
        async move {
            let output = thunk().await;
            // Submitter may have stopped waiting
            let _ = reply.send(Ok(output));
        }
        .boxed()
    }

    fn cancel(self: Box<Self>) {
        let _ = self.reply.send(Err(DispatchError::Cancelled));
    }
}

struct QueuedOperation {
    id: u64,
    job: Box<dyn Job>,
    enqueued_at: Instant,
}

struct QueueState {
    queue: VecDeque<QueuedOperation>,
    in_flight: usize,
    next_id: u64,
    ticker_running: bool,
}

struct DispatcherInner {
    config: DispatcherConfig,
    state: Mutex<QueueState>,
}

impl DispatcherInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dequeue everything that fits under the ceiling, counting it in flight
    ///
    /// Runs under the state lock, so leaving the queue and entering the
    /// in-flight count is one step.
    fn take_admissible(&self, state: &mut QueueState) -> Vec<QueuedOperation> {
        let mut admitted = Vec::new();
        while state.in_flight < self.config.max_concurrent {
            match state.queue.pop_front() {
                Some(op) => {
                    state.in_flight += 1;
                    admitted.push(op);
                }
                None => break,
            }
        }
        admitted
    }

    fn launch(self: &Arc<Self>, ops: Vec<QueuedOperation>) {
        for op in ops {
            let handle = match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    tracing::error!(id = op.id, "No runtime available, dropping operation");
                    // Dropping the job drops its reply sender: the submitter sees Aborted
                    drop(op);
                    self.settle();
                    continue;
                }
            };

            tracing::trace!(
                id = op.id,
                waited_ms = op.enqueued_at.elapsed().as_millis() as u64,
                "Admitting operation"
            );

            let guard = SettleGuard {
                inner: Arc::clone(self),
            };
            handle.spawn(async move {
                let _guard = guard;
                op.job.run().await;
            });
        }
    }

    /// An admitted operation finished; release its slot and admit the next waiters
    fn settle(self: &Arc<Self>) {
        let admitted = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            self.take_admissible(&mut state)
        };
        self.launch(admitted);
    }

    /// Periodic drain; exits once nothing is queued or in flight
    async fn run_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.drain_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let (admitted, idle) = {
                let mut state = self.lock();
                let admitted = self.take_admissible(&mut state);
                let idle = state.queue.is_empty() && state.in_flight == 0 && admitted.is_empty();
                if idle {
                    state.ticker_running = false;
                }
                (admitted, idle)
            };

            self.launch(admitted);
            if idle {
                tracing::trace!("Dispatcher idle, stopping drain ticker");
                break;
            }
        }
    }
}

/// Releases the operation's slot when the task ends, however it ends
struct SettleGuard {
    inner: Arc<DispatcherInner>,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        self.inner.settle();
    }
}

/// Concurrency-limited FIFO queue of asynchronous operations
///
/// Clone is cheap; clones share the same queue and ceiling.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

impl RequestDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let config = if config.max_concurrent == 0 {
            tracing::warn!("max_concurrent of 0 would never admit anything, using 1");
            DispatcherConfig {
                max_concurrent: 1,
                ..config
            }
        } else {
            config
        };

        Self {
            inner: Arc::new(DispatcherInner {
                config,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    in_flight: 0,
                    next_id: 0,
                    ticker_running: false,
                }),
            }),
        }
    }

    /// Enqueue an operation
    ///
    /// The operation is queued (or admitted) when this is called, not when the
    /// returned future is first polled. The future resolves with the
    /// operation's own output, `Cancelled` if `cancel_all` removed it first, or
    /// `Aborted` if it panicked.
    pub fn submit<F, Fut, T>(
        &self,
        thunk: F,
    ) -> impl Future<Output = Result<T, DispatchError>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let job: Box<dyn Job> = Box::new(Operation { thunk, reply });

        let (admitted, start_ticker) = {
            let mut state = self.inner.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(QueuedOperation {
                id,
                job,
                enqueued_at: Instant::now(),
            });

            let admitted = self.inner.take_admissible(&mut state);
            let start_ticker = !state.queue.is_empty() && !state.ticker_running;
            if start_ticker {
                state.ticker_running = true;
            }

            tracing::debug!(
                id = id,
                in_flight = state.in_flight,
                queued = state.queue.len(),
                "Operation submitted"
            );
            (admitted, start_ticker)
        };

        self.inner.launch(admitted);

        if start_ticker {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(Arc::clone(&self.inner).run_ticker());
                }
                Err(_) => {
                    tracing::warn!("No runtime available for drain ticker");
                    self.inner.lock().ticker_running = false;
                }
            }
        }

        async move {
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Aborted),
            }
        }
    }

    /// Reject every operation still waiting for admission
    ///
    /// In-flight operations are unaffected. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let cancelled: Vec<QueuedOperation> = {
            let mut state = self.inner.lock();
            state.queue.drain(..).collect()
        };

        let count = cancelled.len();
        if count > 0 {
            tracing::info!(count = count, "Cancelling queued operations");
        }
        for op in cancelled {
            op.job.cancel();
        }
        count
    }

    /// Operations admitted and not yet settled
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Operations waiting for admission
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn config(&self) -> DispatcherConfig {
        self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Submit `count` operations that each block on their own gate
    fn submit_gated(
        dispatcher: &RequestDispatcher,
        count: usize,
        started: &Arc<Mutex<Vec<usize>>>,
    ) -> (
        Vec<oneshot::Sender<()>>,
        Vec<tokio::task::JoinHandle<Result<usize, DispatchError>>>,
    ) {
        let mut gates = Vec::new();
        let mut results = Vec::new();
        for i in 0..count {
            let (gate_tx, gate_rx) = oneshot::channel::<()>();
            let started = Arc::clone(started);
            let fut = dispatcher.submit(move || async move {
                started.lock().unwrap().push(i);
                let _ = gate_rx.await;
                i
            });
            gates.push(gate_tx);
            results.push(tokio::spawn(fut));
        }
        (gates, results)
    }

    #[tokio::test]
    async fn test_ten_operations_with_ceiling_of_three() {
        // Long tick: admission after a settle must not depend on it
        let dispatcher = RequestDispatcher::new(DispatcherConfig::new(3, 10_000));
        let started = Arc::new(Mutex::new(Vec::new()));

        let (gates, results) = submit_gated(&dispatcher, 10, &started);

        assert_eq!(dispatcher.in_flight(), 3);
        assert_eq!(dispatcher.queued(), 7);
        wait_until(|| started.lock().unwrap().len() == 3).await;

        for (settled, gate) in gates.into_iter().enumerate() {
            gate.send(()).unwrap();
            let expected_started = (settled + 4).min(10);
            wait_until(|| started.lock().unwrap().len() == expected_started).await;
            assert!(dispatcher.in_flight() <= 3);
        }

        for (i, handle) in results.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Ok(i));
        }
        assert_eq!(*started.lock().unwrap(), (0..10).collect::<Vec<_>>());
        wait_until(|| dispatcher.in_flight() == 0).await;
        assert_eq!(dispatcher.queued(), 0);
    }

    #[tokio::test]
    async fn test_ceiling_never_exceeded() {
        let dispatcher = RequestDispatcher::new(DispatcherConfig::new(4, 5));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..40u64 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(dispatcher.submit(move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1 + i % 3)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancel_all_rejects_only_queued() {
        let dispatcher = RequestDispatcher::new(DispatcherConfig::new(2, 10));
        let started = Arc::new(Mutex::new(Vec::new()));

        let (gates, results) = submit_gated(&dispatcher, 5, &started);
        assert_eq!(dispatcher.cancel_all(), 3);
        assert_eq!(dispatcher.queued(), 0);
        assert_eq!(dispatcher.in_flight(), 2);

        for gate in gates {
            let _ = gate.send(());
        }

        let outcomes: Vec<_> = futures::future::join_all(results)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(outcomes[0], Ok(0));
        assert_eq!(outcomes[1], Ok(1));
        for outcome in &outcomes[2..] {
            assert_eq!(*outcome, Err(DispatchError::Cancelled));
        }
        assert_eq!(*started.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let dispatcher = RequestDispatcher::new(DispatcherConfig::new(1, 10));

        let failing = dispatcher.submit(|| async { Err::<u32, &str>("boom") });
        let ok = dispatcher.submit(|| async { Ok::<u32, &str>(7) });

        assert_eq!(failing.await, Ok(Err("boom")));
        assert_eq!(ok.await, Ok(Ok(7)));
    }

    #[tokio::test]
    async fn test_panicking_operation_releases_slot() {
        let dispatcher = RequestDispatcher::new(DispatcherConfig::new(1, 10));

        let panicking = dispatcher.submit(|| async {
            panic!("operation blew up");
        });
        let next = dispatcher.submit(|| async { "still runs" });

        assert_eq!(panicking.await, Err::<(), _>(DispatchError::Aborted));
        assert_eq!(next.await, Ok("still runs"));
        wait_until(|| dispatcher.in_flight() == 0).await;
    }

    #[tokio::test]
    async fn test_ticker_stops_when_idle() {
        let dispatcher = RequestDispatcher::new(DispatcherConfig::new(1, 2));

        let first = dispatcher.submit(|| async { 1 });
        let second = dispatcher.submit(|| async { 2 });
        assert!(dispatcher.inner.lock().ticker_running);

        assert_eq!(first.await, Ok(1));
        assert_eq!(second.await, Ok(2));

        wait_until(|| !dispatcher.inner.lock().ticker_running).await;
    }

    #[test]
    fn test_zero_ceiling_is_clamped() {
        let dispatcher = RequestDispatcher::new(DispatcherConfig::new(0, 10));
        assert_eq!(dispatcher.config().max_concurrent, 1);
    }

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(
            config.drain_interval,
            Duration::from_millis(DEFAULT_DRAIN_INTERVAL_MS)
        );
    }
}
