//! Admission control for geometry kernel work.
//!
//! Tessellation is CPU bound and runs on the blocking pool, so an unbounded burst of uploads
//! would pile up threads. [`ConversionLimiter`] caps how many conversions run at once and how many
//! may queue behind them; everything beyond that is answered with HTTP 429.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LimitsConfig;
use crate::errors::{Error, Result};

const BUSY_MESSAGE: &str = "Too many conversions in progress. Please retry later.";

/// Bounded queue in front of the geometry kernel.
#[derive(Debug)]
pub struct ConversionLimiter {
    semaphore: Arc<Semaphore>,
    /// Requests currently waiting for a permit
    waiting_count: AtomicUsize,
    /// None = unlimited
    max_waiting: Option<usize>,
    max_wait: Duration,
}

impl ConversionLimiter {
    /// Returns `None` when `max_concurrent_conversions` is 0, meaning conversions are not limited.
    pub fn new(config: &LimitsConfig) -> Option<Self> {
        if config.max_concurrent_conversions == 0 {
            return None;
        }

        Some(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_conversions)),
            waiting_count: AtomicUsize::new(0),
            max_waiting: (config.max_waiting_conversions != 0).then_some(config.max_waiting_conversions),
            max_wait: config.max_wait,
        })
    }

    /// Wait for a conversion slot.
    ///
    /// Fails with [`Error::TooManyRequests`] when the waiting queue is full or no slot frees up
    /// within `max_wait`.
    pub async fn acquire(&self) -> Result<ConversionPermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(ConversionPermit { _permit: permit });
        }

        let current_waiting = self.waiting_count.fetch_add(1, Ordering::SeqCst);
        if let Some(max_waiting) = self.max_waiting
            && current_waiting >= max_waiting
        {
            self.waiting_count.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::TooManyRequests {
                message: BUSY_MESSAGE.to_string(),
            });
        }

        // A slot may have been released between the first attempt and joining the queue.
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            self.waiting_count.fetch_sub(1, Ordering::SeqCst);
            return Ok(ConversionPermit { _permit: permit });
        }

        let result = if self.max_wait.is_zero() {
            Err(Error::TooManyRequests {
                message: BUSY_MESSAGE.to_string(),
            })
        } else {
            match tokio::time::timeout(self.max_wait, self.semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => Ok(ConversionPermit { _permit: permit }),
                Ok(Err(_)) => Err(Error::TooManyRequests {
                    message: "Conversion service temporarily unavailable.".to_string(),
                }),
                Err(_) => Err(Error::TooManyRequests {
                    message: "Timed out waiting for a conversion slot. Please retry later.".to_string(),
                }),
            }
        };

        self.waiting_count.fetch_sub(1, Ordering::SeqCst);

        result
    }

    /// Conversions that can start right now.
    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Held for the duration of one kernel run; the slot is released on drop.
///
/// Owned so it can be moved into the blocking task together with the upload.
#[must_use]
pub struct ConversionPermit {
    _permit: OwnedSemaphorePermit,
}
