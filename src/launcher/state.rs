// src/launcher/state.rs

//! Launcher state machine, free of IO.
//!
//! ```text
//! Idle ──doTask──▶ Running ──finish──▶ Terminated
//!   │                 │                    ▲
//!   └──kill──▶ Killed ◀──kill──┘           │
//!                 └───────finish───────────┘
//! ```
//!
//! `doTask` is accepted once. `kill` is accepted in every state and only
//! has an effect before `Terminated`. At most one notification is claimed.

use crate::errors::{LaunchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherState {
    Idle,
    Running,
    Killed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoTaskDecision {
    /// Run the pipeline.
    Start,
    /// A kill arrived first: notify a killed result without doing any work.
    KilledBeforeStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillDecision {
    /// Work is in flight and must be interrupted.
    Interrupt,
    /// No work yet; the next `doTask` will not start any.
    Recorded,
    AlreadyKilled,
    /// The launcher has terminated.
    Ignored,
}

#[derive(Debug)]
pub struct LauncherCore {
    state: LauncherState,
    accepted: bool,
    notified: bool,
}

impl Default for LauncherCore {
    fn default() -> Self {
        Self::new()
    }
}

impl LauncherCore {
    pub fn new() -> Self {
        Self {
            state: LauncherState::Idle,
            accepted: false,
            notified: false,
        }
    }

    pub fn state(&self) -> LauncherState {
        self.state
    }

    pub fn accept_do_task(&mut self) -> Result<DoTaskDecision> {
        if self.accepted {
            return Err(LaunchError::AlreadyStarted);
        }
        self.accepted = true;
        match self.state {
            LauncherState::Idle => {
                self.state = LauncherState::Running;
                Ok(DoTaskDecision::Start)
            }
            LauncherState::Killed => Ok(DoTaskDecision::KilledBeforeStart),
            LauncherState::Running | LauncherState::Terminated => Err(LaunchError::AlreadyStarted),
        }
    }

    pub fn kill(&mut self) -> KillDecision {
        match self.state {
            LauncherState::Idle => {
                self.state = LauncherState::Killed;
                KillDecision::Recorded
            }
            LauncherState::Running => {
                self.state = LauncherState::Killed;
                KillDecision::Interrupt
            }
            LauncherState::Killed => KillDecision::AlreadyKilled,
            LauncherState::Terminated => KillDecision::Ignored,
        }
    }

    /// True exactly once.
    pub fn claim_notification(&mut self) -> bool {
        !std::mem::replace(&mut self.notified, true)
    }

    pub fn finish(&mut self) {
        self.state = LauncherState::Terminated;
    }
}
