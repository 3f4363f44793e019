//! Per-entity serialization of asynchronous operations.
//!
//! Setup code runs synchronously at enqueue time; only the part of an
//! operation that awaits [`Predecessors`] is ordered behind earlier work.

use crate::core::Result;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type Tail = Shared<BoxFuture<'static, ()>>;

/// Resolves once every operation enqueued before this one has finished.
#[derive(Clone)]
pub struct Predecessors(Tail);

impl Future for Predecessors {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.0).poll(cx)
    }
}

pub struct TaskQueue {
    tail: Mutex<Tail>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tail: Mutex::new(completed()),
        }
    }

    fn lock_tail(&self) -> MutexGuard<'_, Tail> {
        self.tail.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an operation. `start` is called immediately (after the queue
    /// slot is reserved) with a future for the prior work; later operations
    /// wait for the future it returns.
    ///
    /// Dropping the returned future without polling it releases its place in
    /// the queue.
    pub fn enqueue<F, Fut, T>(&self, start: F) -> BoxFuture<'static, Result<T>>
    where
        F: FnOnce(Predecessors) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let mut tail = self.lock_tail();
        let prior = Predecessors(tail.clone());
        let wait_prior = prior.clone();
        *tail = async move {
            wait_prior.await;
            let _ = done_rx.await;
        }
        .boxed()
        .shared();
        drop(tail);

        finish_with(start(prior), done_tx)
    }

    /// Admits one operation into several queues at once.
    ///
    /// Queues are locked in ascending sequence order so concurrent joint
    /// admissions over overlapping sets cannot deadlock. The locks are held
    /// only while the operation is admitted, not while it runs.
    pub fn enqueue_joint<F, Fut, T>(
        queues: &[(u64, &TaskQueue)],
        start: F,
    ) -> BoxFuture<'static, Result<T>>
    where
        F: FnOnce(Predecessors) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut ordered: Vec<(u64, &TaskQueue)> = queues.to_vec();
        ordered.sort_by_key(|(sequence, _)| *sequence);
        ordered.dedup_by_key(|(sequence, _)| *sequence);

        let mut guards: Vec<MutexGuard<'_, Tail>> =
            ordered.iter().map(|(_, queue)| queue.lock_tail()).collect();

        let priors: Vec<Tail> = guards.iter().map(|guard| (**guard).clone()).collect();
        let all_prior = Predecessors(
            join_all(priors.clone())
                .map(|_| ())
                .boxed()
                .shared(),
        );

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done = done_rx.map(|_| ()).boxed().shared();

        for (guard, prior) in guards.iter_mut().zip(priors) {
            let done = done.clone();
            **guard = async move {
                prior.await;
                done.await;
            }
            .boxed()
            .shared();
        }
        drop(guards);

        finish_with(start(all_prior), done_tx)
    }
}

fn completed() -> Tail {
    futures::future::ready(()).boxed().shared()
}

fn finish_with<Fut, T>(task: Fut, done_tx: oneshot::Sender<()>) -> BoxFuture<'static, Result<T>>
where
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    async move {
        let out = task.await;
        let _ = done_tx.send(());
        out
    }
    .boxed()
}
