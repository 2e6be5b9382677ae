//! Completion bridge
//!
//! Converts the vendor SDK's callback-based completion model into an awaitable
//! wait for sequential orchestration code.
//!
//! Each in-flight operation gets its own [`CompletionToken`]. The SDK calls
//! [`CompletionToken::complete`] from whatever thread it likes; the counter
//! lives in a `tokio::sync::watch` channel so the waiting task is woken
//! without polling. While waiting, the bridge keeps driving the SDK's message
//! pump, since some SDKs only deliver callbacks from inside it. Every wait is
//! bounded by a deadline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::CaptureSettings;
use crate::error::{AppResult, CaptureError};
use crate::sdk::{CapabilityId, CaptureSdk, ObjectHandle, SdkError, SdkResult};

struct TokenInner {
    count: watch::Sender<u32>,
    fault: Mutex<Option<SdkError>>,
}

/// Completion counter shared with the vendor SDK for one operation.
#[derive(Clone)]
pub struct CompletionToken {
    inner: Arc<TokenInner>,
}

impl CompletionToken {
    /// Create a token with a zero count.
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(TokenInner {
                count,
                fault: Mutex::new(None),
            }),
        }
    }

    /// Record one completion. The first reported fault is kept.
    pub fn complete(&self, result: SdkResult<()>) {
        if let Err(err) = result {
            self.inner.fault.lock().get_or_insert(err);
        }
        self.inner.count.send_modify(|count| *count += 1);
    }

    /// Number of completions recorded so far.
    pub fn count(&self) -> u32 {
        *self.inner.count.borrow()
    }

    /// Remove and return the recorded fault, if any.
    pub fn take_fault(&self) -> Option<SdkError> {
        self.inner.fault.lock().take()
    }

    fn subscribe(&self) -> watch::Receiver<u32> {
        self.inner.count.subscribe()
    }
}

impl Default for CompletionToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for vendor completions with a deadline.
#[derive(Debug, Clone, Copy)]
pub struct CompletionBridge {
    pump_interval: Duration,
    timeout: Duration,
}

impl CompletionBridge {
    /// Create a bridge that pumps every `pump_interval` and gives up after `timeout`.
    pub fn new(pump_interval: Duration, timeout: Duration) -> Self {
        Self {
            pump_interval,
            timeout,
        }
    }

    /// Build a bridge from capture settings.
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        Self::new(settings.pump_interval, settings.completion_timeout)
    }

    /// Deadline applied to each wait.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until `token` has counted `target` completions.
    ///
    /// Fails with [`CaptureError::CompletionTimedOut`] when the deadline passes
    /// and with [`CaptureError::CompletionFailed`] when the SDK reported a fault
    /// through the token.
    pub async fn wait_for_completion(
        &self,
        sdk: &dyn CaptureSdk,
        handle: ObjectHandle,
        capability: CapabilityId,
        token: &CompletionToken,
        target: u32,
    ) -> AppResult<()> {
        let mut rx = token.subscribe();

        let wait = async {
            loop {
                if let Err(err) = sdk.pump(handle) {
                    warn!("Message pump for {:?} failed: {}", capability, err);
                }
                if *rx.borrow_and_update() >= target {
                    return;
                }
                tokio::select! {
                    _ = rx.changed() => {}
                    _ = sleep(self.pump_interval) => {}
                }
            }
        };

        timeout(self.timeout, wait)
            .await
            .map_err(|_| CaptureError::CompletionTimedOut {
                capability,
                timeout: self.timeout,
            })?;

        if let Some(source) = token.take_fault() {
            return Err(CaptureError::CompletionFailed { capability, source });
        }
        debug!("{:?} completed ({} of {})", capability, token.count(), target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::mock::MockCaptureSdk;

    fn bridge() -> CompletionBridge {
        CompletionBridge::new(Duration::from_millis(10), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_completion_from_foreign_thread() {
        let sdk = MockCaptureSdk::default();
        let token = CompletionToken::new();
        let remote = token.clone();

        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.complete(Ok(()));
        });

        bridge()
            .wait_for_completion(&sdk, ObjectHandle(0), CapabilityId::Capture, &token, 1)
            .await
            .unwrap();
        assert_eq!(token.count(), 1);
        worker.join().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let sdk = MockCaptureSdk::default();
        let token = CompletionToken::new();

        let err = bridge()
            .wait_for_completion(&sdk, ObjectHandle(0), CapabilityId::Acquire, &token, 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::CompletionTimedOut {
                capability: CapabilityId::Acquire,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fault_is_reported() {
        let sdk = MockCaptureSdk::default();
        let token = CompletionToken::new();
        token.complete(Err(SdkError::new(-12, "card full")));

        let err = bridge()
            .wait_for_completion(&sdk, ObjectHandle(0), CapabilityId::Capture, &token, 1)
            .await
            .unwrap_err();
        match err {
            CaptureError::CompletionFailed { source, .. } => assert_eq!(source.code, -12),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_toward_target() {
        let sdk = MockCaptureSdk::default();
        let token = CompletionToken::new();
        token.complete(Ok(()));

        let err = bridge()
            .wait_for_completion(&sdk, ObjectHandle(0), CapabilityId::Capture, &token, 2)
            .await;
        assert!(err.is_err());

        token.complete(Ok(()));
        bridge()
            .wait_for_completion(&sdk, ObjectHandle(0), CapabilityId::Capture, &token, 2)
            .await
            .unwrap();
    }
}
