//! Sleep dependency for retry delays, swappable in tests so retries run
//! without waiting.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await
        }
    }
}

/// Returns immediately.
pub struct Insomniac;

#[async_trait]
impl Sleeper for Insomniac {
    async fn sleep(&self, _duration: Duration) {}
}

/// Returns immediately and remembers every requested delay.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}
