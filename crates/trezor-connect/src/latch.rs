use parking_lot::Mutex;
use tracing::debug;

use crate::error::{DeviceError, Result};

/// What a signer is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerState<C> {
    Idle,
    Signing(C),
}

/// Admits one signing operation at a time; a second caller gets `Busy`.
#[derive(Debug)]
pub(crate) struct SignerLatch<C> {
    state: Mutex<SignerState<C>>,
}

impl<C: Clone> SignerLatch<C> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SignerState::Idle),
        }
    }

    pub(crate) fn begin(&self, context: C) -> Result<LatchGuard<'_, C>> {
        let mut state = self.state.lock();
        if let SignerState::Signing(_) = *state {
            debug!("signing already in progress");
            return Err(DeviceError::Busy);
        }
        *state = SignerState::Signing(context);
        Ok(LatchGuard { latch: self })
    }

    pub(crate) fn snapshot(&self) -> SignerState<C> {
        self.state.lock().clone()
    }
}

/// Returns the latch to `Idle` when dropped, including when the signing
/// future itself is dropped.
pub(crate) struct LatchGuard<'a, C> {
    latch: &'a SignerLatch<C>,
}

impl<C> Drop for LatchGuard<'_, C> {
    fn drop(&mut self) {
        *self.latch.state.lock() = SignerState::Idle;
    }
}
