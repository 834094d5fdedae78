//! §5 shared state and mutex discipline: the `Arc<Mutex<EngineState>>` the
//! public embedding API and the I/O loop task both touch, plus the
//! registration refcount and splice bookkeeping.
//!
//! Grounded on `original_source/zwint/zwint.c`'s single `pthread_mutex_t`
//! guarding `monitors`/`registered`/the HTTP queue state — the same
//! coarse single-mutex discipline DESIGN NOTES endorse, expressed with
//! `tokio::sync::Mutex` so the I/O loop can hold it across nothing but
//! short in-memory operations and release it across the readiness wait
//! (§5 "Suspension points"). Method bodies otherwise follow
//! `services/receiver/src/db.rs`'s `Result`-returning method style.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{EngineConfig, Limits};
use crate::error::Error;
use crate::ioloop;
use crate::notify::NotifyQueue;
use crate::rule::{Direction, Rule, RuleStore};
use crate::splice::{SplicedEndpoints, Splicer};

/// Everything the I/O loop and the API methods share, behind one mutex.
pub struct EngineState {
    pub rules: RuleStore,
    pub queue: NotifyQueue,
    pub registered: u32,
    device_path: Option<String>,
    endpoints: Option<SplicedEndpoints>,
    limits: Limits,
}

/// `Arc<Mutex<_>>` alias matching the shape `ioloop::run` expects.
pub type Shared = Arc<AsyncMutex<EngineState>>;

/// The engine's public embedding-API surface (§6.1), generic over the
/// [`Splicer`] an embedder supplies for `register`.
pub struct Engine<S: Splicer + 'static> {
    shared: Shared,
    splicer: Arc<AsyncMutex<S>>,
    epoch: Instant,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<S: Splicer + 'static> Engine<S> {
    pub fn new(splicer: S, config: EngineConfig) -> Self {
        let shared = Arc::new(AsyncMutex::new(EngineState {
            rules: RuleStore::new(),
            queue: NotifyQueue::new(config.http),
            registered: 0,
            device_path: None,
            endpoints: None,
            limits: config.limits,
        }));
        Engine {
            shared,
            splicer: Arc::new(AsyncMutex::new(splicer)),
            epoch: Instant::now(),
            task: AsyncMutex::new(None),
        }
    }

    fn now_ms(&self) -> u64 {
        ioloop::now_ms(self.epoch)
    }

    /// §6.1 `register(device_path)`: splices the host's existing open fd
    /// on first call and starts the I/O task; subsequent calls with a
    /// matching path just bump the refcount.
    pub async fn register(&self, device_path: &str) -> Result<(), Error> {
        {
            let mut state = self.shared.lock().await;
            if state.registered > 0 {
                if state.device_path.as_deref() != Some(device_path) {
                    return Err(Error::BadArgument(
                        "device_path does not match already registered name".into(),
                    ));
                }
                state.registered += 1;
                return Ok(());
            }
        }

        let endpoints = {
            let mut splicer = self.splicer.lock().await;
            splicer.splice(device_path)?
        };

        let handle = {
            let mut state = self.shared.lock().await;
            state.registered = 1;
            state.device_path = Some(device_path.to_string());
            state.endpoints = Some(endpoints);
            let limits = state.limits.clone();
            tokio::spawn(ioloop::run(self.shared.clone(), endpoints, limits, self.epoch))
        };
        *self.task.lock().await = Some(handle);
        info!(device_path, "registered");
        Ok(())
    }

    /// §6.1 `unregister([device_num])`: drops the refcount, restoring the
    /// spliced fd and removing every rule when it hits zero, otherwise
    /// removing only rules tagged with `device_num` (or all, if `None`
    /// was passed explicitly).
    pub async fn unregister(&self, device_num: Option<i64>) -> Result<(), Error> {
        let endpoints_to_restore = {
            let mut state = self.shared.lock().await;
            if state.registered == 0 {
                return Err(Error::NotRegistered);
            }
            state.registered -= 1;
            let effective_filter = if state.registered == 0 { None } else { device_num };
            state.rules.unregister(effective_filter);
            if state.registered == 0 {
                state.device_path = None;
                state.endpoints.take()
            } else {
                None
            }
        };

        if let Some(endpoints) = endpoints_to_restore {
            let mut splicer = self.splicer.lock().await;
            splicer.restore(&endpoints)?;
            info!("unregistered, fd restored");
        }
        Ok(())
    }

    /// §6.1 `monitor(...)`: insert a receive-direction (controller→host)
    /// rule.
    #[allow(clippy::too_many_arguments)]
    pub async fn monitor(
        &self,
        device_num: i64,
        key: String,
        pattern: &str,
        oneshot: bool,
        timeout_ms: u64,
        arm_pattern: Option<&str>,
        response: Option<String>,
        forward: bool,
    ) -> Result<(), Error> {
        self.insert_rule(
            device_num,
            key,
            Direction::Monitor,
            pattern,
            oneshot,
            timeout_ms,
            arm_pattern,
            response,
            forward,
        )
        .await
    }

    /// §6.1 `intercept(...)`: insert a send-direction (host→controller)
    /// rule.
    #[allow(clippy::too_many_arguments)]
    pub async fn intercept(
        &self,
        device_num: i64,
        key: String,
        pattern: &str,
        oneshot: bool,
        timeout_ms: u64,
        arm_pattern: Option<&str>,
        response: Option<String>,
        forward: bool,
    ) -> Result<(), Error> {
        self.insert_rule(
            device_num,
            key,
            Direction::Intercept,
            pattern,
            oneshot,
            timeout_ms,
            arm_pattern,
            response,
            forward,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_rule(
        &self,
        device_num: i64,
        key: String,
        direction: Direction,
        pattern: &str,
        oneshot: bool,
        timeout_ms: u64,
        arm_pattern: Option<&str>,
        response: Option<String>,
        forward: bool,
    ) -> Result<(), Error> {
        let deadline = if timeout_ms == 0 { 0 } else { self.now_ms() + timeout_ms };
        let rule = Rule::new(device_num, key, direction, pattern, oneshot, deadline, arm_pattern, response, forward)?;
        let mut state = self.shared.lock().await;
        state.rules.insert(rule);
        Ok(())
    }

    /// §6.1 `cancel(device_num, key)`: removes the first matching rule,
    /// returning whether one was found.
    pub async fn cancel(&self, device_num: i64, key: &str) -> Result<bool, Error> {
        let mut state = self.shared.lock().await;
        Ok(state.rules.cancel(device_num, key))
    }

    /// Test/shutdown helper: waits for the I/O loop task to exit (it does
    /// so on its own once `unregister` drops the refcount to zero).
    #[cfg(any(test, feature = "test-util"))]
    pub async fn join_io_task(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Test/integration helper: reach into the splicer this engine owns,
    /// e.g. to pull the `PairSplicer` test-side streams out after
    /// `register` has spliced them in.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn with_splicer<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut splicer = self.splicer.lock().await;
        f(&mut splicer)
    }
}
