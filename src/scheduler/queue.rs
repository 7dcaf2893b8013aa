//! Request scheduler with priority ordering, concurrency cap and rate limiting.
//!
//! Dispatch is event driven: it runs after every enqueue and after every
//! settlement, and arms a single timer when the minimum delay has not yet
//! elapsed. There is no polling loop.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::ScheduleError;
use super::priority::Priority;

/// Scheduler configuration, fixed for the lifetime of a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
  /// Upstream calls allowed in parallel
  pub max_concurrent: usize,
  /// Floor between two dispatch starts
  pub min_delay: Duration,
  /// Coalescing window for `batch()`
  pub batch_window: Duration,
  /// Backpressure ceiling; enqueues beyond this are rejected
  pub max_queue_size: usize,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_concurrent: 3,
      min_delay: Duration::from_millis(100),
      batch_window: Duration::from_millis(50),
      max_queue_size: 50,
    }
  }
}

/// Read-only snapshot of scheduler load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
  pub queue_length: usize,
  pub active_requests: usize,
  pub max_concurrent: usize,
}

/// Type-erased executor plus its completion channel
type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueuedRequest {
  id: String,
  priority: Priority,
  enqueued_at: Instant,
  job: Job,
}

#[derive(Default)]
struct SchedulerState {
  queue: VecDeque<QueuedRequest>,
  active: usize,
  last_dispatch: Option<Instant>,
  /// A delayed dispatch is already pending
  timer_armed: bool,
}

struct Inner {
  name: String,
  config: QueueConfig,
  state: Mutex<SchedulerState>,
}

impl Inner {
  fn lock(&self) -> MutexGuard<'_, SchedulerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Start as many queued requests as capacity and the delay floor allow.
  fn dispatch(self: &Arc<Self>) {
    loop {
      let request = {
        let mut state = self.lock();

        if state.active >= self.config.max_concurrent || state.queue.is_empty() {
          return;
        }

        if let Some(last) = state.last_dispatch {
          let elapsed = last.elapsed();
          if elapsed < self.config.min_delay {
            if !state.timer_armed {
              state.timer_armed = true;
              let remaining = self.config.min_delay - elapsed;
              let inner = Arc::clone(self);
              tokio::spawn(async move {
                tokio::time::sleep(remaining).await;
                inner.lock().timer_armed = false;
                inner.dispatch();
              });
            }
            return;
          }
        }

        let Some(request) = state.queue.pop_front() else {
          return;
        };
        state.active += 1;
        state.last_dispatch = Some(Instant::now());
        request
      };

      debug!(
        "[{}] dispatching {} ({}, waited {:?})",
        self.name,
        request.id,
        request.priority,
        request.enqueued_at.elapsed()
      );

      let guard = ActiveGuard {
        inner: Arc::clone(self),
      };
      tokio::spawn(async move {
        (request.job)().await;
        drop(guard);
      });
    }
  }
}

/// Releases an execution slot and drains the queue further once a job ends.
struct ActiveGuard {
  inner: Arc<Inner>,
}

impl Drop for ActiveGuard {
  fn drop(&mut self) {
    {
      let mut state = self.inner.lock();
      state.active = state.active.saturating_sub(1);
    }
    self.inner.dispatch();
  }
}

/// Priority queue in front of a rate-limited upstream.
///
/// Cheap to clone; clones share the same queue. Must be used from within a
/// tokio runtime.
#[derive(Clone)]
pub struct RequestScheduler {
  inner: Arc<Inner>,
}

impl RequestScheduler {
  pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        name: name.into(),
        config,
        state: Mutex::new(SchedulerState::default()),
      }),
    }
  }

  /// Queue `executor` and return a future for its outcome.
  ///
  /// Admission happens immediately, not when the returned future is first
  /// polled: a full queue yields `QueueFull` and the request is never added.
  /// Higher priority requests are placed ahead of lower ones; equal
  /// priorities keep insertion order.
  pub fn enqueue<T, E, F, Fut>(
    &self,
    id: impl Into<String>,
    priority: Priority,
    executor: F,
  ) -> impl Future<Output = Result<T, ScheduleError<E>>> + Send + 'static
  where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let id = id.into();
    let job_id = id.clone();
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move || {
      async move {
        let outcome = AssertUnwindSafe(async move { executor().await })
          .catch_unwind()
          .await
          .map_err(|panic| {
            warn!("Executor for {} panicked: {}", job_id, panic_message(&*panic));
          });
        // Receiver may have been dropped; the outcome is simply discarded then
        let _ = tx.send(outcome);
      }
      .boxed()
    });

    let admitted = self.admit(QueuedRequest {
      id,
      priority,
      enqueued_at: Instant::now(),
      job,
    });

    async move {
      if let Err(capacity) = admitted {
        return Err(ScheduleError::QueueFull { capacity });
      }

      match rx.await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(ScheduleError::Executor(e)),
        Ok(Err(())) => Err(ScheduleError::ExecutorPanicked),
        // Sender dropped unsent: removed by clear()
        Err(_) => Err(ScheduleError::QueueCleared),
      }
    }
  }

  /// Queue every request now and resolve once the batch window, counted
  /// from this call, has elapsed and every request has settled. Yields one
  /// outcome per request in input order.
  pub fn batch<T, E, F, Fut>(
    &self,
    requests: Vec<(String, F)>,
    priority: Priority,
  ) -> impl Future<Output = Vec<Result<T, ScheduleError<E>>>> + Send + 'static
  where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let pending: Vec<_> = requests
      .into_iter()
      .map(|(id, executor)| self.enqueue(id, priority, executor))
      .collect();
    let window = tokio::time::sleep(self.inner.config.batch_window);

    async move {
      let (outcomes, ()) = tokio::join!(join_all(pending), window);
      outcomes
    }
  }

  /// Reject every request that has not been dispatched yet with
  /// `QueueCleared`. Requests already running are unaffected.
  ///
  /// Returns the number of requests removed.
  pub fn clear(&self) -> usize {
    let cleared: Vec<QueuedRequest> = self.inner.lock().queue.drain(..).collect();
    let count = cleared.len();
    // Dropping the jobs drops their completion senders, which rejects callers
    drop(cleared);

    if count > 0 {
      info!("[{}] cleared {} queued requests", self.inner.name, count);
    }
    count
  }

  pub fn stats(&self) -> SchedulerStats {
    let state = self.inner.lock();
    SchedulerStats {
      queue_length: state.queue.len(),
      active_requests: state.active,
      max_concurrent: self.inner.config.max_concurrent,
    }
  }

  fn admit(&self, request: QueuedRequest) -> Result<(), usize> {
    {
      let mut state = self.inner.lock();
      if state.queue.len() >= self.inner.config.max_queue_size {
        warn!(
          "[{}] queue full, rejecting {}",
          self.inner.name, request.id
        );
        return Err(self.inner.config.max_queue_size);
      }

      // Insert before the first strictly lower priority entry
      let position = state
        .queue
        .iter()
        .position(|queued| queued.priority > request.priority)
        .unwrap_or(state.queue.len());
      debug!(
        "[{}] queued {} ({}) at position {}",
        self.inner.name, request.id, request.priority, position
      );
      state.queue.insert(position, request);
    }

    self.inner.dispatch();
    Ok(())
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
  if let Some(message) = panic.downcast_ref::<&str>() {
    message
  } else if let Some(message) = panic.downcast_ref::<String>() {
    message
  } else {
    "non-string panic payload"
  }
}
