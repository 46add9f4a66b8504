use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

use super::{DeviceError, DeviceHandle, Result};

/// Exclusive access to the handle. Dropping the guard releases it on every exit path.
pub type DeviceGuard = OwnedMutexGuard<Box<dyn DeviceHandle>>;

/// Single-owner gate around the device handle, shared by the poller and
/// command issuers.
///
/// A guard must be held from the first register access of a sequence to the
/// last, so poll cycles and commands never interleave on the wire.
#[derive(Clone)]
pub struct AccessSerializer {
    handle: Arc<Mutex<Box<dyn DeviceHandle>>>,
}

impl AccessSerializer {
    pub fn new(handle: Box<dyn DeviceHandle>) -> Self {
        Self {
            handle: Arc::new(Mutex::new(handle)),
        }
    }

    /// Take the guard if nobody holds it, without waiting.
    pub fn try_acquire(&self) -> Option<DeviceGuard> {
        self.handle.clone().try_lock_owned().ok()
    }

    /// Wait for the guard. Waiters are served in arrival order.
    pub async fn acquire(&self) -> DeviceGuard {
        self.handle.clone().lock_owned().await
    }

    /// Wait at most `patience` for the guard.
    pub async fn acquire_timeout(&self, patience: Duration) -> Result<DeviceGuard> {
        timeout(patience, self.acquire())
            .await
            .map_err(|_| DeviceError::Busy(patience))
    }

    pub fn is_busy(&self) -> bool {
        self.handle.try_lock().is_err()
    }
}
