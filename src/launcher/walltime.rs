// src/launcher/walltime.rs

//! Walltime enforcement and the single termination reason of a run.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Killed,
    Walltime,
}

/// Cancels a run and remembers why. The first reason wins.
#[derive(Debug, Default)]
pub struct KillSwitch {
    token: CancellationToken,
    reason: OnceLock<Termination>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns whether this call decided the reason.
    pub fn trip(&self, reason: Termination) -> bool {
        let won = self.reason.set(reason).is_ok();
        self.token.cancel();
        won
    }

    pub fn reason(&self) -> Option<Termination> {
        self.reason.get().copied()
    }

    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }
}

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const DISARMED: u8 = 2;

/// Trips a [`KillSwitch`] with [`Termination::Walltime`] once the walltime
/// elapses, unless disarmed first. Firing and disarming race on a single
/// compare-and-swap, so exactly one of them happens.
#[derive(Debug)]
pub struct WalltimeTimer {
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl WalltimeTimer {
    /// Must be called within a Tokio runtime.
    pub fn arm(walltime: Duration, switch: Arc<KillSwitch>, task_id: TaskId) -> Self {
        let state = Arc::new(AtomicU8::new(ARMED));
        let handle = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                tokio::time::sleep(walltime).await;
                if state
                    .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    warn!(
                        task = %task_id,
                        walltime_ms = walltime.as_millis() as u64,
                        "walltime exceeded, killing task"
                    );
                    switch.trip(Termination::Walltime);
                }
            }
        });
        Self {
            state,
            handle: Some(handle),
        }
    }

    /// Stop the timer. Returns whether it had already fired.
    pub fn disarm(&mut self) -> bool {
        let fired = match self.state.compare_exchange(
            ARMED,
            DISARMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(current) => current == FIRED,
        };
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        fired
    }
}

impl Drop for WalltimeTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
