//! Unbounded FIFO of translation jobs with task-done accounting.
//!
//! Every `push` increments an unfinished counter; every dequeued job is handed
//! out as a [`Ticket`] that decrements it exactly once, either on `done()` or
//! when dropped. `requeue()` pushes the job back *before* releasing the ticket,
//! so the counter never dips to zero while work is still circulating and
//! `join()` only returns once every chain of re-enqueues has ended in `done`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::translate::job::Job;

struct Queued {
    job: Job,
    enqueued_at: Instant,
}

#[derive(Default)]
struct State {
    jobs: VecDeque<Queued>,
    unfinished: usize,
}

#[derive(Default)]
pub struct DispatchQueue {
    state: Mutex<State>,
    available: Notify,
    drained: Notify,
}

impl DispatchQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, job: Job) {
        {
            let mut state = self.state.lock();
            state.jobs.push_back(Queued {
                job,
                enqueued_at: Instant::now(),
            });
            state.unfinished += 1;
        }
        self.available.notify_one();
    }

    /// Wait for the next job. This is the only place a worker idles.
    pub async fn pop(self: &Arc<Self>) -> Ticket {
        loop {
            let notified = self.available.notified();
            if let Some(queued) = self.state.lock().jobs.pop_front() {
                return Ticket {
                    queue: Arc::clone(self),
                    job: Some(queued.job),
                    waited: queued.enqueued_at.elapsed(),
                };
            }
            notified.await;
        }
    }

    /// Jobs waiting to be dequeued (in-flight jobs are not counted).
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs pushed but not yet marked done, including in-flight ones.
    pub fn unfinished(&self) -> usize {
        self.state.lock().unfinished
    }

    /// Block until every pushed job, and every requeue that followed from it,
    /// has been marked done.
    pub async fn join(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.state.lock().unfinished == 0 {
                return;
            }
            drained.await;
        }
    }

    fn task_done(&self) {
        let now_idle = {
            let mut state = self.state.lock();
            state.unfinished = state.unfinished.saturating_sub(1);
            state.unfinished == 0
        };
        if now_idle {
            self.drained.notify_waiters();
        }
    }
}

/// A dequeued job. Marks the job done when dropped unless requeued first.
pub struct Ticket {
    queue: Arc<DispatchQueue>,
    job: Option<Job>,
    waited: Duration,
}

impl Ticket {
    pub fn job(&self) -> &Job {
        self.job.as_ref().expect("ticket holds its job until consumed")
    }

    /// Time the job spent waiting in the queue.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn done(self) {}

    /// Put the job back at the tail of the queue, unchanged.
    pub fn requeue(mut self) {
        if let Some(job) = self.job.take() {
            self.queue.push(job);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::job::render_ja_zh;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn job(text: &str) -> Job {
        Job::new(render_ja_zh, text, Vec::new(), false)
    }

    #[tokio::test]
    async fn fifo_order() {
        let q = DispatchQueue::new();
        q.push(job("一"));
        q.push(job("二"));
        assert_eq!(&*q.pop().await.job().fragment, "一");
        assert_eq!(&*q.pop().await.job().fragment, "二");
        q.join().await;
    }

    #[tokio::test]
    async fn join_on_empty_queue_returns_immediately() {
        let q = DispatchQueue::new();
        q.join().await;
        assert_eq!(q.unfinished(), 0);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = DispatchQueue::new();
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await.job().fragment.to_string() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(job("遅い"));
        assert_eq!(consumer.await.unwrap(), "遅い");
    }

    #[tokio::test]
    async fn join_waits_for_requeue_chain() {
        let q = DispatchQueue::new();
        q.push(job("再"));
        let finished = Arc::new(AtomicBool::new(false));

        let worker = {
            let q = Arc::clone(&q);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                for _ in 0..3 {
                    let ticket = q.pop().await;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticket.requeue();
                }
                let ticket = q.pop().await;
                finished.store(true, Ordering::SeqCst);
                ticket.done();
            })
        };

        q.join().await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(q.unfinished(), 0);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_ticket_counts_as_done() {
        let q = DispatchQueue::new();
        q.push(job("落"));
        drop(q.pop().await);
        q.join().await;
        assert!(q.is_empty());
    }
}
