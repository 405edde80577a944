use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Slot {
    id: String,
    interval: Duration,
    next_due: Mutex<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was still running.
    Skipped,
    Idle,
    Refreshed(Vec<String>),
}

/// Decides which targets are due and refreshes them, one pass at a time.
#[derive(Debug)]
pub struct RefreshScheduler {
    slots: Vec<Slot>,
    pass_lock: AsyncMutex<()>,
}

impl RefreshScheduler {
    /// Every target starts due.
    pub fn new<I>(targets: I) -> Self
    where
        I: IntoIterator<Item = (String, Duration)>,
    {
        let now = Instant::now();
        let slots = targets
            .into_iter()
            .map(|(id, interval)| Slot {
                id,
                interval,
                next_due: Mutex::new(now),
            })
            .collect();
        Self {
            slots,
            pass_lock: AsyncMutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Ids due at `now`; each returned slot has its next due time pushed out by its
    /// interval.
    fn take_due(&self, now: Instant) -> Vec<String> {
        self.slots
            .iter()
            .filter(|slot| {
                let mut next_due = slot
                    .next_due
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if now >= *next_due {
                    *next_due = now + slot.interval;
                    true
                } else {
                    false
                }
            })
            .map(|slot| slot.id.clone())
            .collect()
    }

    /// Marks every target due so the next pass refreshes all of them.
    pub fn mark_all_due(&self) {
        let now = Instant::now();
        for slot in &self.slots {
            *slot
                .next_due
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = now;
        }
    }

    pub async fn run_pass<F, Fut>(&self, fetch: &F) -> PassOutcome
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!(event = "refresh_pass_skipped");
            return PassOutcome::Skipped;
        };
        let due = self.take_due(Instant::now());
        if due.is_empty() {
            return PassOutcome::Idle;
        }

        let mut fetches = JoinSet::new();
        for id in &due {
            fetches.spawn(fetch(id.clone()));
        }
        while let Some(joined) = fetches.join_next().await {
            if let Err(err) = joined {
                warn!(event = "refresh_fetch_failed", error = %err);
            }
        }
        debug!(event = "refresh_pass_done", targets = due.len());
        PassOutcome::Refreshed(due)
    }

    /// Ticks every [`TICK_INTERVAL`] and starts a pass on each tick until shutdown. Passes
    /// still running at shutdown are aborted and awaited before the task ends.
    pub fn spawn<F, Fut>(
        self: Arc<Self>,
        fetch: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fetch = Arc::new(fetch);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut passes = JoinSet::new();
            info!(event = "refresh_scheduler_start", targets = self.len());
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    Some(joined) = passes.join_next(), if !passes.is_empty() => {
                        if let Err(err) = joined {
                            warn!(event = "refresh_pass_failed", error = %err);
                        }
                    }
                    _ = ticker.tick() => {
                        let scheduler = self.clone();
                        let fetch = fetch.clone();
                        passes.spawn(async move {
                            scheduler.run_pass(fetch.as_ref()).await;
                        });
                    }
                }
            }
            let pending = passes.len();
            passes.shutdown().await;
            info!(event = "refresh_scheduler_stop", aborted_passes = pending);
        })
    }
}
