//! Environment capabilities the sync queue consults.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the device currently has network connectivity.
pub trait Connectivity: Send + Sync {
  fn is_online(&self) -> bool;
}

/// Connectivity flag flipped by the embedding application.
#[derive(Debug)]
pub struct OnlineFlag {
  online: AtomicBool,
}

impl OnlineFlag {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

impl Default for OnlineFlag {
  fn default() -> Self {
    Self::new(true)
  }
}

impl Connectivity for OnlineFlag {
  fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}

/// Optional platform hook for waking the app to sync in the background.
pub trait BackgroundSync: Send + Sync {
  fn register(&self, tag: &str) -> Result<(), String>;
}
