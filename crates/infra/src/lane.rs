use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// What one lane tick accomplished.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing left to do until the next tick or trigger.
    Idle,
    /// Work remains; run again without waiting for the cadence.
    MoreWork,
    /// The tick failed; retried with bounded exponential backoff.
    Failed,
}

/// Cadence and retry settings of one lane.
#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub interval: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl LaneConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
        }
    }
}

/// Cloneable trigger hook of a lane, for wiring one lane to another.
#[derive(Debug, Clone)]
pub struct LaneTrigger(mpsc::SyncSender<()>);

impl LaneTrigger {
    pub fn trigger(&self) {
        let _ = self.0.try_send(());
    }
}

/// Handle for a running lane thread (shutdown + trigger hook).
#[derive(Debug)]
pub struct LaneHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl LaneHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask for a tick now.
    ///
    /// Triggers are coalesced (capacity 1); triggering a pending lane is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    pub fn trigger_handle(&self) -> LaneTrigger {
        LaneTrigger(self.trigger.clone())
    }

    /// Stop the lane and wait for its current tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Spawn a named lane that runs `tick` on startup, every `interval` and on
/// every trigger. Failures never propagate out of the lane.
pub fn spawn_lane<F>(name: impl Into<String>, cfg: LaneConfig, tick: F) -> io::Result<LaneHandle>
where
    F: FnMut() -> TickOutcome + Send + 'static,
{
    let name = name.into();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

    let lane_name = name.clone();
    let join = thread::Builder::new()
        .name(name.clone())
        .spawn(move || lane_loop(&lane_name, cfg, shutdown_rx, trigger_rx, tick))?;

    Ok(LaneHandle {
        name,
        shutdown: shutdown_tx,
        trigger: trigger_tx,
        join: Some(join),
    })
}

fn lane_loop<F>(
    name: &str,
    cfg: LaneConfig,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> TickOutcome,
{
    info!(lane = name, interval_ms = cfg.interval.as_millis() as u64, "lane started");

    let mut next_tick = Instant::now() + cfg.interval;
    let mut pending = true; // run once on startup
    let mut failures: u32 = 0;
    let mut backoff_until: Option<Instant> = None;

    loop {
        // Shutdown has priority.
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            // Keep a stable cadence even if we were delayed.
            while next_tick <= now {
                next_tick += cfg.interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if let Some(until) = backoff_until {
            if Instant::now() < until {
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            backoff_until = None;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(250));
            thread::sleep(sleep_for);
            continue;
        }

        pending = false;

        match tick() {
            TickOutcome::Idle => failures = 0,
            TickOutcome::MoreWork => {
                failures = 0;
                pending = true;
            }
            TickOutcome::Failed => {
                failures += 1;
                if failures <= cfg.max_retries {
                    pending = true;
                    let delay = backoff(cfg.base_backoff, failures);
                    warn!(lane = name, failures, delay_ms = delay.as_millis() as u64, "lane tick failed");
                    backoff_until = Some(Instant::now() + delay);
                } else {
                    // Give up until the next tick or trigger.
                    warn!(lane = name, failures, "lane tick failed, waiting for next cadence");
                    failures = 0;
                }
            }
        }
    }

    info!(lane = name, "lane stopped");
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    // Exponential backoff: base * 2^(attempt-1), capped.
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(pow as u128);
    Duration::from_millis(ms.min(10_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_for(counter: &AtomicUsize, at_least: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if counter.load(Ordering::SeqCst) >= at_least {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn runs_on_startup_and_on_trigger() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();
        let handle = spawn_lane("test-lane", LaneConfig::every(Duration::from_secs(3600)), move || {
            seen.fetch_add(1, Ordering::SeqCst);
            TickOutcome::Idle
        })
        .unwrap();

        assert!(wait_for(&ticks, 1));
        handle.trigger();
        assert!(wait_for(&ticks, 2));
        handle.shutdown();
    }

    #[test]
    fn more_work_reruns_immediately() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();
        let handle = spawn_lane("drain-lane", LaneConfig::every(Duration::from_secs(3600)), move || {
            if seen.fetch_add(1, Ordering::SeqCst) < 3 {
                TickOutcome::MoreWork
            } else {
                TickOutcome::Idle
            }
        })
        .unwrap();

        assert!(wait_for(&ticks, 4));
        handle.shutdown();
    }

    #[test]
    fn failures_retry_with_backoff() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();
        let cfg = LaneConfig {
            interval: Duration::from_secs(3600),
            max_retries: 2,
            base_backoff: Duration::from_millis(10),
        };
        let handle = spawn_lane("flaky-lane", cfg, move || {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                TickOutcome::Failed
            } else {
                TickOutcome::Idle
            }
        })
        .unwrap();

        assert!(wait_for(&ticks, 2));
        handle.shutdown();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(Duration::from_millis(250), 1), Duration::from_millis(250));
        assert_eq!(backoff(Duration::from_millis(250), 3), Duration::from_millis(1000));
        assert_eq!(backoff(Duration::from_millis(250), 30), Duration::from_secs(10));
    }
}
