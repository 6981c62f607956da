//! Bounded-concurrency worker pool.
//!
//! `N` tasks pull from one shared queue. Each worker applies the stage
//! operation through the [`RetryPolicy`], spacing its own requests by at least
//! `min_interval`. The pool never touches the checkpoint store: it hands back
//! one [`WorkOutcome`] per item and the controller decides what to persist.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use larder_shared::{ItemId, LarderError, Result, StageConfig};

use crate::retry::{Attempt, RetryPolicy};

/// What one item produced after the retry loop.
#[derive(Debug)]
pub struct WorkOutcome<T> {
    pub id: ItemId,
    /// Calls made for this item during this run.
    pub attempts: u32,
    pub result: Attempt<T>,
}

/// Enforces a minimum spacing between consecutive requests of one worker.
#[derive(Debug)]
pub(crate) struct Pacer {
    interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Reserve the next start slot: no earlier than now and at least
    /// `interval` after the previous slot.
    pub(crate) fn reserve(&mut self) -> Instant {
        let now = Instant::now();
        let slot = match self.last {
            Some(last) => (last + self.interval).max(now),
            None => now,
        };
        self.last = Some(slot);
        slot
    }
}

/// Executor for one stage's per-item operation.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
    min_interval: Duration,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(stage: &StageConfig, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            concurrency: stage.concurrency.max(1),
            min_interval: stage.min_interval(),
            policy,
            cancel,
        }
    }

    /// Run `op` over `items` and collect one outcome per distinct id.
    ///
    /// Duplicate ids are dropped before dispatch so an id is never held by two
    /// workers at once. Once cancellation is requested, workers stop pulling
    /// new items; calls already in flight finish. Items never pulled are simply
    /// absent from the result. A fatal error stops every worker and is returned
    /// as `Err`; outcomes gathered so far are discarded with it. A call that
    /// panics fails only its own item, permanently.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<(ItemId, I)>, op: F) -> Result<Vec<WorkOutcome<T>>>
    where
        I: Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(ItemId, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut seen = HashSet::new();
        let queue: VecDeque<(ItemId, I)> = items
            .into_iter()
            .filter(|(id, _)| seen.insert(id.clone()))
            .collect();
        if queue.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.concurrency.min(queue.len());
        let queue = Arc::new(Mutex::new(queue));
        let op = Arc::new(op);
        // Child token: a fatal error stops this pool without cancelling the run.
        let stop = self.cancel.child_token();
        let mut set = JoinSet::new();

        for worker in 0..workers {
            let queue = queue.clone();
            let op = op.clone();
            let stop = stop.clone();
            let policy = self.policy;
            let mut pacer = Pacer::new(self.min_interval);

            set.spawn(async move {
                let mut done = Vec::new();
                loop {
                    if stop.is_cancelled() {
                        break;
                    }
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some((id, input)) = next else {
                        break;
                    };

                    let (result, attempts) = policy
                        .run(
                            &stop,
                            || tokio::time::sleep_until(pacer.reserve()),
                            || isolated(op(id.clone(), input.clone())),
                        )
                        .await;

                    match result {
                        Ok(result) => done.push(WorkOutcome {
                            id,
                            attempts,
                            result,
                        }),
                        Err(err) => {
                            warn!(worker, %id, error = %err, "fatal error, stopping pool");
                            stop.cancel();
                            return Err(err);
                        }
                    }
                }
                debug!(worker, processed = done.len(), "worker finished");
                Ok(done)
            });
        }

        let mut outcomes = Vec::new();
        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(mut done)) => outcomes.append(&mut done),
                Ok(Err(err)) => {
                    fatal.get_or_insert(err);
                }
                Err(e) => {
                    stop.cancel();
                    fatal.get_or_insert(LarderError::Transform(format!("worker panicked: {e}")));
                }
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }
}

/// Run one call on its own task so a panic stays with that item.
async fn isolated<T, Fut>(call: Fut) -> Result<T>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(LarderError::validation(format!("worker panicked: {e}"))),
        Err(e) => Err(LarderError::Transform(format!("call aborted: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(concurrency: usize, min_interval_ms: u64) -> WorkerPool {
        WorkerPool::new(
            &StageConfig {
                concurrency,
                min_interval_ms,
            },
            RetryPolicy::immediate(3),
            CancellationToken::new(),
        )
    }

    fn items(n: usize) -> Vec<(ItemId, usize)> {
        (0..n).map(|i| (ItemId::new(i.to_string()), i)).collect()
    }

    #[tokio::test]
    async fn every_item_gets_one_outcome() {
        let outcomes = pool(4, 0)
            .run(items(25), |_id, n| async move { Ok(n * 2) })
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 25);
        let mut doubled: Vec<usize> = outcomes
            .into_iter()
            .map(|o| match o.result {
                Attempt::Success(v) => v,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        doubled.sort();
        assert_eq!(doubled, (0..25).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn duplicate_ids_are_dispatched_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut input = items(3);
        input.extend(items(3));

        let outcomes = pool(3, 0)
            .run(input, move |_id, _n| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());

        pool(3, 0)
            .run(items(20), move |_id, _n| {
                let (a, p) = (a.clone(), p.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn pacer_slots_are_spaced() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let mut pacer = Pacer::new(Duration::from_millis(200));
            let a = pacer.reserve();
            let b = pacer.reserve();
            let c = pacer.reserve();
            assert_eq!(b - a, Duration::from_millis(200));
            assert_eq!(c - b, Duration::from_millis(200));
        });
    }

    #[tokio::test(start_paused = true)]
    async fn min_interval_is_a_hard_floor_per_worker() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let s = stamps.clone();

        pool(1, 500)
            .run(items(4), move |_id, _n| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(Instant::now());
                    Ok(())
                }
            })
            .await
            .unwrap();

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 4);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn fatal_error_aborts_the_batch() {
        let result = pool(2, 0)
            .run(items(10), |id, _n| async move {
                if id.as_str() == "3" {
                    Err(LarderError::Storage("disk full".into()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(LarderError::Storage(_))));
    }

    #[tokio::test]
    async fn cancelled_pool_pulls_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pool = WorkerPool::new(
            &StageConfig {
                concurrency: 2,
                min_interval_ms: 0,
            },
            RetryPolicy::immediate(3),
            cancel,
        );
        let outcomes = pool
            .run(items(5), |_id, _n| async move { Ok(()) })
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn panicking_call_fails_only_its_item() {
        let outcomes = pool(2, 0)
            .run(items(4), |id, n| async move {
                if id.as_str() == "2" {
                    panic!("bug on {id}");
                }
                Ok(n)
            })
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 4);
        let panicked = outcomes.iter().find(|o| o.id.as_str() == "2").unwrap();
        assert!(matches!(panicked.result, Attempt::PermanentFailure(_)));
        assert_eq!(panicked.attempts, 1);
        let ok = outcomes
            .iter()
            .filter(|o| matches!(o.result, Attempt::Success(_)))
            .count();
        assert_eq!(ok, 3);
    }

    #[tokio::test]
    async fn failures_become_outcomes_not_errors() {
        let outcomes = pool(2, 0)
            .run(items(4), |id, _n| async move {
                match id.as_str() {
                    "0" => Err(LarderError::NotFound("0".into())),
                    "1" => Err(LarderError::Timeout("1".into())),
                    _ => Ok(()),
                }
            })
            .await
            .unwrap();

        let by_id = |k: &str| outcomes.iter().find(|o| o.id.as_str() == k).unwrap();
        assert!(matches!(by_id("0").result, Attempt::PermanentFailure(_)));
        assert_eq!(by_id("0").attempts, 1);
        assert!(matches!(by_id("1").result, Attempt::TransientFailure(_)));
        assert_eq!(by_id("1").attempts, 3);
        assert!(matches!(by_id("2").result, Attempt::Success(())));
    }
}
