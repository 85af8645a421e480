//! Admission-controlled front for concurrent sends
//!
//! Every admitted submission runs `TxManager::send` on its own task and writes
//! exactly one `TxResult` to the caller's channel. The number of live sends is
//! bounded by `max_in_flight` (0 = unbounded). No ordering is guaranteed across
//! submissions.

use super::candidate::TxCandidate;
use super::manager::TxManager;
use crate::chain::TxReceipt;
use crate::error::TxMgrResult;
use crate::metrics;

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Outcome of one queued submission, tagged with the caller's correlation value
#[derive(Debug)]
pub struct TxResult<T> {
    pub tag: T,
    pub result: TxMgrResult<TxReceipt>,
}

/// Whether a submission was handed to a publisher
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Bound saturated (`try_submit` only) or queue cancelled
    Rejected,
}

/// Receives the in-flight count after every change
pub type InFlightObserver = Arc<dyn Fn(usize) + Send + Sync>;

/// Counts one live publisher
struct InFlightGuard {
    count: Arc<AtomicUsize>,
    observer: Option<InFlightObserver>,
}

impl InFlightGuard {
    fn enter(count: Arc<AtomicUsize>, observer: Option<InFlightObserver>) -> Self {
        let now = count.fetch_add(1, Ordering::SeqCst) + 1;
        report(now, &observer);
        Self { count, observer }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        report(now, &self.observer);
    }
}

fn report(in_flight: usize, observer: &Option<InFlightObserver>) {
    metrics::record_queue_in_flight(in_flight);
    if let Some(observer) = observer {
        observer(in_flight);
    }
}

/// Spawns publishers for submitted candidates, at most `max_in_flight` at a time
pub struct Queue<T> {
    ctx: CancellationToken,
    manager: Arc<TxManager>,
    permits: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
    observer: Option<InFlightObserver>,
    tasks: TaskTracker,
    _tag: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .field("bounded", &self.permits.is_some())
            .field("cancelled", &self.ctx.is_cancelled())
            .finish()
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Cancelling `ctx` aborts every in-flight publisher and rejects later submissions
    pub fn new(ctx: CancellationToken, manager: Arc<TxManager>, max_in_flight: usize) -> Self {
        Self {
            ctx,
            manager,
            permits: (max_in_flight > 0).then(|| Arc::new(Semaphore::new(max_in_flight))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            observer: None,
            tasks: TaskTracker::new(),
            _tag: PhantomData,
        }
    }

    /// Report the in-flight count to `observer` on every change
    pub fn with_observer(mut self, observer: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Number of publishers currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait for a free slot, then start publishing `candidate`.
    ///
    /// The result arrives on `results` tagged with `tag`. `results` must have
    /// room for every pending result or be drained concurrently; a publisher
    /// blocked on a full channel drops its result once the queue is cancelled.
    pub async fn submit(
        &self,
        tag: T,
        candidate: TxCandidate,
        results: mpsc::Sender<TxResult<T>>,
    ) -> Admission {
        if self.ctx.is_cancelled() {
            return Admission::Rejected;
        }

        let permit = match &self.permits {
            Some(permits) => {
                let acquired = tokio::select! {
                    biased;
                    _ = self.ctx.cancelled() => return Admission::Rejected,
                    permit = permits.clone().acquire_owned() => permit,
                };
                match acquired {
                    Ok(permit) => Some(permit),
                    Err(_) => return Admission::Rejected,
                }
            }
            None => None,
        };

        self.spawn(tag, candidate, results, permit);
        Admission::Admitted
    }

    /// Like `submit`, but rejects instead of waiting when the bound is reached
    pub fn try_submit(
        &self,
        tag: T,
        candidate: TxCandidate,
        results: mpsc::Sender<TxResult<T>>,
    ) -> Admission {
        if self.ctx.is_cancelled() {
            return Admission::Rejected;
        }

        let permit = match &self.permits {
            Some(permits) => match permits.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!(in_flight = self.in_flight(), "Queue saturated, rejecting submission");
                    return Admission::Rejected;
                }
            },
            None => None,
        };

        self.spawn(tag, candidate, results, permit);
        Admission::Admitted
    }

    /// Wait until every spawned publisher has finished
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn spawn(
        &self,
        tag: T,
        candidate: TxCandidate,
        results: mpsc::Sender<TxResult<T>>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let guard = InFlightGuard::enter(self.in_flight.clone(), self.observer.clone());
        let ctx = self.ctx.child_token();
        let manager = self.manager.clone();

        self.tasks.spawn(async move {
            let result = manager.send(&ctx, candidate).await;
            tokio::select! {
                biased;
                sent = results.send(TxResult { tag, result }) => {
                    if sent.is_err() {
                        warn!("Result receiver dropped before the submission finished");
                    }
                }
                _ = ctx.cancelled() => {
                    warn!("Queue cancelled while the result channel was full, dropping result");
                }
            }
            // count down before freeing the slot so the count never exceeds the bound
            drop(guard);
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockBackend;
    use crate::config::TxMgrConfig;
    use crate::tx::signer::MockTxSigner;
    use ethers::types::Address;

    fn manager() -> Arc<TxManager> {
        let mut signer = MockTxSigner::new();
        signer.expect_address().return_const(Address::zero());
        Arc::new(
            TxManager::with_chain_id(
                TxMgrConfig::default(),
                Arc::new(MockBackend::new()),
                Arc::new(signer),
                1,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_cancelled_queue_rejects() {
        let ctx = CancellationToken::new();
        let queue: Queue<u32> = Queue::new(ctx.clone(), manager(), 2);
        let (tx, _rx) = mpsc::channel(1);

        ctx.cancel();
        assert_eq!(
            queue.submit(1, TxCandidate::default(), tx.clone()).await,
            Admission::Rejected
        );
        assert_eq!(
            queue.try_submit(2, TxCandidate::default(), tx),
            Admission::Rejected
        );
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_debug_reports_in_flight() {
        let queue: Queue<u32> = Queue::new(CancellationToken::new(), manager(), 3);
        let rendered = format!("{:?}", queue);
        assert!(rendered.contains("in_flight: 0"));
        assert!(rendered.contains("bounded: true"));
    }

    #[tokio::test]
    async fn test_closed_manager_still_delivers_one_result() {
        let mgr = manager();
        mgr.close();
        let seen = Arc::new(AtomicUsize::new(0));
        let observed = seen.clone();
        let queue = Queue::new(CancellationToken::new(), mgr, 0)
            .with_observer(move |n| {
                observed.fetch_max(n, Ordering::SeqCst);
            });
        let (tx, mut rx) = mpsc::channel(4);

        assert_eq!(
            queue.submit("a", TxCandidate::default(), tx).await,
            Admission::Admitted
        );
        queue.wait().await;

        let result = rx.recv().await.unwrap();
        assert_eq!(result.tag, "a");
        assert_eq!(result.result, Err(crate::error::TxMgrError::Closed));
        // all senders dropped: exactly one value was written
        assert!(rx.recv().await.is_none());
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
