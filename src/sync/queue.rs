//! The persisted queue and its processing pass.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connectivity::{BackgroundSync, Connectivity};
use super::error::SyncError;
use super::handlers::HandlerRegistry;
use super::mutation::{MutationKind, PendingMutation, SyncResult};
use crate::scheduler::Priority;
use crate::storage::KeyValueStore;
use crate::tasks::BackgroundTasks;

/// Attempts a mutation gets before it is dropped.
pub const MAX_RETRY_COUNT: u32 = 3;

/// Spacing between automatic passes while work is pending.
pub const RETRY_DELAY: Duration = Duration::from_millis(5000);

/// Key holding the JSON array of pending mutations.
pub const PENDING_MUTATIONS_KEY: &str = "nimbus.pending_mutations";

const BACKGROUND_SYNC_TAG: &str = "nimbus-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
  pub max_retry_count: u32,
  pub retry_delay: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retry_count: MAX_RETRY_COUNT,
      retry_delay: RETRY_DELAY,
    }
  }
}

struct Inner {
  store: Arc<dyn KeyValueStore>,
  handlers: HandlerRegistry,
  connectivity: Arc<dyn Connectivity>,
  background: Option<Arc<dyn BackgroundSync>>,
  config: SyncConfig,
  /// Single-flight flag for `process_pending`
  processing: AtomicBool,
  /// Serializes every read-modify-write of the persisted list. Holds the
  /// number of `clear()` calls so far.
  list_lock: Mutex<u64>,
}

/// Clears the single-flight flag when a pass ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Durable queue of mutations replayed when connectivity allows.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OfflineSyncQueue {
  inner: Arc<Inner>,
  tasks: BackgroundTasks,
}

impl OfflineSyncQueue {
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    handlers: HandlerRegistry,
    connectivity: Arc<dyn Connectivity>,
    config: SyncConfig,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        handlers,
        connectivity,
        background: None,
        config,
        processing: AtomicBool::new(false),
        list_lock: Mutex::new(0),
      }),
      tasks: BackgroundTasks::new(),
    }
  }

  /// Track passes started by `queue_mutation` in `tasks`.
  pub fn with_tasks(mut self, tasks: BackgroundTasks) -> Self {
    self.tasks = tasks;
    self
  }

  /// Attach a platform background-sync capability. Must be called before the
  /// queue is cloned.
  pub fn with_background_sync(mut self, background: Arc<dyn BackgroundSync>) -> Self {
    match Arc::get_mut(&mut self.inner) {
      Some(inner) => inner.background = Some(background),
      None => warn!("Background sync attached to a shared queue; ignoring"),
    }
    self
  }

  /// Persist a new mutation and, when online, start a pass in the background.
  ///
  /// Returns the id of the queued mutation.
  pub fn queue_mutation(
    &self,
    kind: MutationKind,
    payload: Value,
    priority: Priority,
  ) -> Result<String> {
    let mutation = PendingMutation {
      id: uuid::Uuid::new_v4().to_string(),
      kind,
      payload,
      timestamp: Utc::now().timestamp_millis(),
      retry_count: 0,
      priority,
    };
    let id = mutation.id.clone();

    {
      let _lock = self.lock_list();
      let mut pending = self.load();
      pending.push(mutation);
      self.save(&pending)?;
    }
    info!("Queued {} mutation {} ({})", kind, id, priority);

    if self.inner.connectivity.is_online() {
      let queue = self.clone();
      self.tasks.spawn(async move {
        let result = queue.process_pending().await;
        debug!("Immediate sync pass: {:?}", result);
      });
    }

    Ok(id)
  }

  /// Run one processing pass over every pending mutation.
  ///
  /// Returns without touching persisted state when a pass is already running
  /// or the device is offline.
  pub async fn process_pending(&self) -> SyncResult {
    if self
      .inner
      .processing
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("Sync pass already running");
      return SyncResult::skipped("Sync already in progress");
    }
    let _guard = ProcessingGuard(&self.inner.processing);

    if !self.inner.connectivity.is_online() {
      debug!("Offline, skipping sync pass");
      return SyncResult::skipped("Device is offline");
    }

    let (mut pending, generation) = {
      let clears = self.lock_list();
      (self.load(), *clears)
    };
    let snapshot_ids: HashSet<String> = pending.iter().map(|m| m.id.clone()).collect();
    sort_for_processing(&mut pending);

    let mut result = SyncResult::default();
    let mut survivors = Vec::new();

    for mut mutation in pending {
      match self.run_handler(&mutation).await {
        Ok(()) => {
          debug!("Mutation {} ({}) synced", mutation.id, mutation.kind);
          result.processed += 1;
        }
        Err(e) => {
          result.failed += 1;
          mutation.retry_count += 1;

          if mutation.retry_count < self.inner.config.max_retry_count {
            debug!(
              "Mutation {} ({}) failed, attempt {}/{}: {}",
              mutation.id,
              mutation.kind,
              mutation.retry_count,
              self.inner.config.max_retry_count,
              e
            );
            survivors.push(mutation);
          } else {
            warn!(
              "Dropping mutation {} ({}) after {} attempts: {}",
              mutation.id, mutation.kind, mutation.retry_count, e
            );
            result.errors.push(format!(
              "Mutation {} ({}) dropped after {} attempts: {}",
              mutation.id, mutation.kind, mutation.retry_count, e
            ));
          }
        }
      }
    }

    // Keep anything queued while the pass was running
    {
      let clears = self.lock_list();
      if *clears != generation {
        debug!(
          "Queue cleared during pass, discarding {} survivors",
          survivors.len()
        );
        survivors.clear();
      }
      let arrived: Vec<PendingMutation> = self
        .load()
        .into_iter()
        .filter(|m| !snapshot_ids.contains(&m.id))
        .collect();
      survivors.extend(arrived);

      if let Err(e) = self.save(&survivors) {
        warn!("Failed to persist pending mutations: {}", e);
        result.errors.push(e.to_string());
      }
    }

    result.success = result.failed == 0 && result.errors.is_empty();
    info!(
      "Sync pass finished: {} processed, {} failed, {} remaining",
      result.processed,
      result.failed,
      survivors.len()
    );
    result
  }

  /// Every pending mutation in persisted order.
  pub fn pending(&self) -> Vec<PendingMutation> {
    let _lock = self.lock_list();
    self.load()
  }

  pub fn pending_count(&self) -> usize {
    self.pending().len()
  }

  /// Drop every pending mutation. Returns how many were removed.
  ///
  /// A pass running concurrently will not write back what it had read.
  pub fn clear(&self) -> Result<usize> {
    let mut clears = self.lock_list();
    let count = self.load().len();
    self.inner.store.remove(PENDING_MUTATIONS_KEY)?;
    *clears = clears.wrapping_add(1);
    info!("Cleared {} pending mutations", count);
    Ok(count)
  }

  /// Ask the platform to wake the app for a sync later.
  ///
  /// Best effort: `false` when the capability is missing or refuses.
  pub fn register_background_sync(&self) -> bool {
    let Some(background) = &self.inner.background else {
      debug!("Background sync not available");
      return false;
    };

    match background.register(BACKGROUND_SYNC_TAG) {
      Ok(()) => {
        info!("Registered background sync '{}'", BACKGROUND_SYNC_TAG);
        true
      }
      Err(e) => {
        warn!("Background sync registration failed: {}", e);
        false
      }
    }
  }

  /// Run a pass every `retry_delay` while online and work is pending.
  pub fn spawn_auto_sync(&self) -> JoinHandle<()> {
    let queue = self.clone();
    let period = self.inner.config.retry_delay;

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      let mut was_online = queue.inner.connectivity.is_online();

      loop {
        ticker.tick().await;
        let online = queue.inner.connectivity.is_online();
        if online && !was_online {
          info!("Connectivity restored");
        }
        was_online = online;

        if online && queue.pending_count() > 0 {
          let result = queue.process_pending().await;
          debug!("Automatic sync pass: {:?}", result);
        }
      }
    })
  }

  async fn run_handler(&self, mutation: &PendingMutation) -> Result<(), SyncError> {
    let Some(handler) = self.inner.handlers.get(mutation.kind) else {
      warn!("No handler for mutation {} ({})", mutation.id, mutation.kind);
      return Err(SyncError::NoHandler(mutation.kind));
    };
    handler.handle(&mutation.payload).await
  }

  fn lock_list(&self) -> MutexGuard<'_, u64> {
    self
      .inner
      .list_lock
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Read the persisted list. Missing or unreadable data is an empty list.
  fn load(&self) -> Vec<PendingMutation> {
    let raw = match self.inner.store.get(PENDING_MUTATIONS_KEY) {
      Ok(Some(raw)) => raw,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!("Failed to read pending mutations: {}", e);
        return Vec::new();
      }
    };

    serde_json::from_str(&raw).unwrap_or_else(|e| {
      warn!("Pending mutations unreadable, starting empty: {}", e);
      Vec::new()
    })
  }

  /// Replace the persisted list wholesale.
  fn save(&self, pending: &[PendingMutation]) -> Result<()> {
    let json = serde_json::to_string(pending)
      .map_err(|e| eyre!("Failed to serialize pending mutations: {}", e))?;
    self.inner.store.set(PENDING_MUTATIONS_KEY, &json)
  }
}

/// High priority first; oldest first within a priority.
fn sort_for_processing(pending: &mut [PendingMutation]) {
  pending.sort_by(|a, b| {
    a.priority
      .cmp(&b.priority)
      .then_with(|| a.timestamp.cmp(&b.timestamp))
  });
}
