//! Cooperative cancellation of guest calls.
//!
//! The engine runs with epoch interruption. A background ticker bumps the
//! epoch at a fixed interval and every store checks its armed
//! [`Checkpoint`] whenever its deadline of one tick expires. Cancelling a
//! token therefore never touches the running guest directly; the guest
//! stops at its next checkpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use plinth_core::{CancelReason, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wasmtime::{Engine, Store, UpdateDeadline};

use crate::store::StoreData;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    token: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl CallOptions {
    /// Options with no token and no timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes `token`; cancelling it stops the call at its next checkpoint.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Fails the call with a timeout once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The token observed by the call, if any.
    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }

    /// The call's own timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// What the epoch callback consults while a call is running.
#[derive(Debug, Default)]
pub(crate) struct Checkpoint {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
    observed: Option<CancelReason>,
}

impl Checkpoint {
    pub(crate) fn arm(&mut self, token: CancellationToken, deadline: Option<Instant>) {
        self.token = Some(token);
        self.deadline = deadline;
        self.observed = None;
    }

    pub(crate) fn disarm(&mut self) {
        self.token = None;
        self.deadline = None;
    }

    pub(crate) fn take_observed(&mut self) -> Option<CancelReason> {
        self.observed.take()
    }

    /// Checks the armed token and deadline, recording what stopped the call.
    pub(crate) fn poll(&mut self) -> Option<CancelReason> {
        let reason = if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            CancelReason::Requested
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            CancelReason::Timeout
        } else {
            return None;
        };
        self.observed = Some(reason);
        Some(reason)
    }
}

/// Installs the checkpoint callback on a fresh store.
pub(crate) fn install(store: &mut Store<StoreData>) {
    store.epoch_deadline_callback(|mut ctx| {
        let data = ctx.data_mut();
        match data.checkpoint.poll() {
            Some(reason) => {
                debug!(plugin = %data.plugin_id, %reason, "guest stopped at checkpoint");
                Err(wasmtime::Error::msg(format!("interrupted: {reason}")))
            }
            None => Ok(UpdateDeadline::Continue(1)),
        }
    });
    store.set_epoch_deadline(1);
}

/// Background thread advancing the engine epoch.
pub(crate) struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    pub(crate) fn start(engine: Engine, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("plinth-epoch-ticker".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
