use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A repeating background job with a single owner.
///
/// At most one task is alive per `Repeating`: starting again aborts the
/// previous task, and dropping the owner aborts it as well.
#[derive(Default)]
pub struct Repeating {
    handle: Option<JoinHandle<()>>,
}

impl Repeating {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` every `period`, the first run one period from now.
    /// The task ends when `job` returns `ControlFlow::Break`.
    pub fn start<F, Fut>(&mut self, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        self.stop();
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if job().await.is_break() {
                    break;
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for Repeating {
    fn drop(&mut self) {
        self.stop();
    }
}
