use std::sync::Arc;
use tokio::sync::watch;

/// Change notifications shared by the object cache and the request tracker.
///
/// Every mutation bumps a version number. Subscribers wake up, re-read the
/// state they care about and decide for themselves what changed.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
  tx: Arc<watch::Sender<u64>>,
}

impl ChangeFeed {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(0);
    Self { tx: Arc::new(tx) }
  }

  /// Signal that cache or tracker state changed.
  pub fn notify(&self) {
    self.tx.send_modify(|version| *version = version.wrapping_add(1));
  }

  /// A receiver that resolves `changed()` on the next notification.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.tx.subscribe()
  }

  /// Current version; only useful for diagnostics and tests.
  pub fn version(&self) -> u64 {
    *self.tx.borrow()
  }
}

impl Default for ChangeFeed {
  fn default() -> Self {
    Self::new()
  }
}
