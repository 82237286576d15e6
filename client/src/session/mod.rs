//! The voice session state machine.
//!
//! [`GatewayDriver`] reacts to decoded control-plane messages; the runner owns
//! the websocket, feeds the driver in arrival order and applies the
//! resume-or-reconnect policy when the socket closes.

mod driver;
mod runner;

pub(crate) use driver::GatewayDriver;
pub(crate) use driver::Flow;
pub(crate) use runner::{SessionEnd, VoiceSession};

use std::fmt;

use crate::error::VoiceError;

/// Handshake progress of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not connected, or waiting for Hello
    #[default]
    None,
    /// Identify sent, waiting for Ready
    Identify,
    /// SelectProtocol sent, waiting for SessionDescription
    SelectProtocol,
    /// Media flowing, heartbeats acknowledged
    Heartbeating,
    /// Resume sent on a fresh websocket, waiting for Resumed
    Resuming,
}

impl fmt::Display for SessionState {
    // ---
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        fmt::Debug::fmt(self, f)
    }
}

/// Out-of-band notices from session tasks to the websocket loop.
#[derive(Debug)]
pub(crate) enum SessionSignal {
    HeartbeatOverdue(VoiceError),
}

/// Readiness of the current session attempt.
///
/// Every new attempt bumps `generation` and clears `ready`, so a waiter never
/// sees a previous attempt's readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Readiness {
    // ---
    pub(crate) generation: u64,
    pub(crate) ready: bool,
}
