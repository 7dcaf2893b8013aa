//! Detached work that has to finish before the process exits.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Shared set of background tasks: cache revalidations and sync passes
/// started on behalf of a command.
///
/// Cheap to clone; clones share the same set.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
  set: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start `task` and keep track of it until it completes or is drained.
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let mut set = self.lock();
    // Reap what already finished so a long-running process does not pile up results
    while let Some(done) = set.try_join_next() {
      if let Err(e) = done {
        warn!("Background task failed: {}", e);
      }
    }
    set.spawn(task);
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  /// Wait up to `limit` for every tracked task, including tasks spawned
  /// while waiting. Whatever is still running afterwards is aborted.
  ///
  /// Returns how many tasks were abandoned.
  pub async fn drain(&self, limit: Duration) -> usize {
    let deadline = Instant::now() + limit;

    loop {
      let mut set = std::mem::take(&mut *self.lock());
      if set.is_empty() {
        return 0;
      }
      debug!("Waiting for {} background tasks", set.len());

      loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
          Ok(Some(Ok(()))) => {}
          Ok(Some(Err(e))) => warn!("Background task failed: {}", e),
          Ok(None) => break,
          Err(_) => {
            let abandoned = set.len() + self.lock().len();
            warn!(
              "Abandoning {} background tasks after {:?}",
              abandoned, limit
            );
            self.lock().abort_all();
            return abandoned;
          }
        }
      }
    }
  }

  fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
    self.set.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn test_drain_waits_for_nested_spawns() {
    let tasks = BackgroundTasks::new();
    let finished = Arc::new(AtomicUsize::new(0));

    let outer = {
      let tasks = tasks.clone();
      let finished = finished.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let inner = finished.clone();
        tasks.spawn(async move {
          tokio::time::sleep(Duration::from_millis(10)).await;
          inner.fetch_add(1, Ordering::SeqCst);
        });
        finished.fetch_add(1, Ordering::SeqCst);
      }
    };
    tasks.spawn(outer);

    assert_eq!(tasks.drain(Duration::from_secs(1)).await, 0);
    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert_eq!(tasks.len(), 0);
  }

  #[tokio::test]
  async fn test_drain_gives_up_after_limit() {
    let tasks = BackgroundTasks::new();
    tasks.spawn(async {
      tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let started = Instant::now();
    assert_eq!(tasks.drain(Duration::from_millis(20)).await, 1);
    assert!(started.elapsed() < Duration::from_secs(1));
  }
}
