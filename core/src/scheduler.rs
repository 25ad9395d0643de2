//! Background thread that runs settlement ticks on a fixed interval.

use crate::shop::Shop;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Sleep granularity while waiting for the next tick, so `stop` is prompt.
const STOP_POLL: Duration = Duration::from_millis(50);

pub struct ReconcilerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Signal the loop and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("reconciler thread panicked");
            }
        }
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start calling `shop.tick()` every `interval`. The first tick runs
/// immediately. Tick errors are logged and the loop carries on.
pub fn spawn_reconciler(shop: Arc<Shop>, interval: Duration) -> std::io::Result<ReconcilerHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let thread = thread::Builder::new()
        .name("reconciler".into())
        .spawn(move || {
            log::info!("reconciler started, interval {interval:?}");
            while !flag.load(Ordering::Relaxed) {
                match shop.tick() {
                    Ok(report) if report.confirmed > 0 || report.dropped_stale > 0 => {
                        log::info!("settlement: {report:?}")
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("settlement tick failed: {e}"),
                }
                let mut slept = Duration::ZERO;
                while slept < interval && !flag.load(Ordering::Relaxed) {
                    let step = STOP_POLL.min(interval - slept);
                    thread::sleep(step);
                    slept += step;
                }
            }
            log::info!("reconciler stopped");
        })?;
    Ok(ReconcilerHandle {
        stop,
        thread: Some(thread),
    })
}
