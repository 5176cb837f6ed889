//! CPU duty-cycling
//!
//! Within each period the task tree runs for `percent` of the time and is
//! held with SIGSTOP for the rest.

use crate::process::{descendants, signal, Signal};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuThrottle {
    percent: u32,
    period: Duration,
}

impl CpuThrottle {
    /// `None` when the limit does not require throttling (0 or >= 100)
    pub fn new(percent: u32) -> Option<Self> {
        (percent > 0 && percent < 100).then_some(Self {
            percent,
            period: PERIOD,
        })
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn run_slice(&self) -> Duration {
        self.period * self.percent / 100
    }

    pub fn stop_slice(&self) -> Duration {
        self.period - self.run_slice()
    }

    /// Cycle the descendants of `root` until the task is aborted
    pub async fn run(self, root: i32) {
        debug!("Throttling tree of {} to {}%", root, self.percent);
        loop {
            Self::signal_tree(root, Signal::Cont);
            sleep(self.run_slice()).await;
            Self::signal_tree(root, Signal::Stop);
            sleep(self.stop_slice()).await;
        }
    }

    /// Continue everything under `root`; used when throttling ends
    pub fn resume(root: i32) {
        Self::signal_tree(root, Signal::Cont);
    }

    fn signal_tree(root: i32, sig: Signal) {
        let tree: Vec<_> = descendants(root).iter().map(|s| s.identity()).collect();
        if let Err(e) = signal::send_all(&tree, sig) {
            warn!("Throttle could not signal tree of {}: {}", root, e);
        }
    }
}
