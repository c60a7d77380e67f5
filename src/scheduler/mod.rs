//! Periodic job dispatcher.
//!
//! Every job gets its own ticker task. A tick never runs the job body inline:
//! the body is spawned, so a slow job delays neither the ticker nor other
//! jobs. The first run happens one full period after the ticker starts.
//!
//! Three things bound what runs at once:
//! - an optional global cap ([`Scheduler::with_limit`]): due bodies wait for a
//!   permit instead of running;
//! - a per-job running flag: a tick that finds the previous run of the same
//!   job still active (or still waiting for a permit) is skipped;
//! - [`Scheduler::drain`], which waits for in-flight bodies and cancels the
//!   stragglers once the grace period is over.

use futures::future::BoxFuture;
use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tracing::{debug, warn};

/// A job body. Called once per tick.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    name: String,
    period: Duration,
    job: Job,
    running: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    started: bool,
}

struct Shared {
    state: Mutex<State>,
    limiter: Option<Arc<Semaphore>>,
    in_flight: watch::Sender<usize>,
    cancel: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.len())
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// A scheduler without a concurrency cap.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A scheduler running at most `limit` job bodies at once. `0` means no cap.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self::build((limit > 0).then(|| Arc::new(Semaphore::new(limit))))
    }

    fn build(limiter: Option<Arc<Semaphore>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                limiter,
                in_flight: watch::channel(0).0,
                cancel: watch::channel(0).0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `job` to run every `period`. Starts ticking right away if
    /// the scheduler is running.
    pub fn schedule(&self, name: impl Into<String>, period: Duration, job: Job) {
        let mut entry = Entry {
            name: name.into(),
            period: period.max(Duration::from_millis(1)),
            job,
            running: Arc::new(AtomicBool::new(false)),
            ticker: None,
        };

        let mut state = self.state();
        if state.started {
            entry.ticker = Some(self.spawn_ticker(&entry));
        }
        debug!(job = %entry.name, period = ?entry.period, "job scheduled");
        state.entries.push(entry);
    }

    /// Begin dispatching. Calling it on a running scheduler does nothing.
    pub fn start(&self) {
        let mut state = self.state();
        if state.started {
            return;
        }
        state.started = true;

        for entry in &mut state.entries {
            entry.ticker = Some(self.spawn_ticker(entry));
        }

        debug!(jobs = state.entries.len(), "scheduler started");
    }

    /// Stop dispatching. Jobs stay registered; bodies already running are
    /// left alone (see [`Self::drain`]).
    pub fn stop(&self) {
        let mut state = self.state();
        state.started = false;
        for entry in &mut state.entries {
            if let Some(ticker) = entry.ticker.take() {
                ticker.abort();
            }
        }
    }

    /// Remove every job. Safe to call while running.
    pub fn clear(&self) {
        let mut state = self.state();
        for entry in state.entries.drain(..) {
            if let Some(ticker) = entry.ticker {
                ticker.abort();
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state().started
    }

    /// Names of the registered jobs, in registration order.
    #[must_use]
    pub fn job_names(&self) -> Vec<String> {
        self.state().entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Job bodies currently running or waiting for a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.borrow()
    }

    /// Wait for in-flight bodies to finish. After `grace`, cancel the rest
    /// and wait for them to be dropped.
    ///
    /// Returns `true` if everything finished within `grace`.
    pub async fn drain(&self, grace: Duration) -> bool {
        let mut rx = self.shared.in_flight.subscribe();

        if timeout(grace, rx.wait_for(|n| *n == 0)).await.is_ok() {
            return true;
        }

        warn!(in_flight = self.in_flight(), ?grace, "cancelling jobs still running after grace period");
        self.shared.cancel.send_modify(|generation| *generation += 1);
        let _ = rx.wait_for(|n| *n == 0).await;

        false
    }

    fn spawn_ticker(&self, entry: &Entry) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let job = Arc::clone(&entry.job);
        let running = Arc::clone(&entry.running);
        let name = entry.name.clone();
        let period = entry.period;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if running.swap(true, Ordering::AcqRel) {
                    debug!(job = %name, "previous run still active, skipping tick");
                    continue;
                }

                dispatch(&shared, Arc::clone(&job), Arc::clone(&running));
            }
        })
    }
}

/// Counts one body as in flight until dropped.
struct InFlight {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
}

impl InFlight {
    fn enter(shared: Arc<Shared>, running: Arc<AtomicBool>) -> Self {
        shared.in_flight.send_modify(|n| *n += 1);
        Self { shared, running }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.shared.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

fn dispatch(shared: &Arc<Shared>, job: Job, running: Arc<AtomicBool>) {
    let guard = InFlight::enter(Arc::clone(shared), running);
    let limiter = shared.limiter.clone();
    let mut cancel = shared.cancel.subscribe();

    tokio::spawn(async move {
        let _guard = guard;

        let body = async {
            let _permit = match limiter {
                Some(limiter) => match limiter.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };
            job().await;
        };

        tokio::select! {
            () = body => {}
            _ = cancel.changed() => debug!("job cancelled"),
        }
    });
}
