//! Heartbeat bookkeeping and the timer task that drives it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::GatewayMessage;
use crate::error::{Result, VoiceError};
use crate::session::SessionSignal;

/// Milliseconds since the Unix epoch; the heartbeat nonce.
pub fn unix_millis() -> u64 {
    // ---
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// FIFO of heartbeats sent but not yet acknowledged.
///
/// Written by the heartbeat task and drained by the websocket read loop.
#[derive(Debug)]
pub struct HeartbeatTracker {
    // ---
    outstanding: VecDeque<u64>,
    max_outstanding: usize,
    strict: bool,
    last_rtt: Option<Duration>,
}

impl HeartbeatTracker {
    // ---
    /// # Arguments
    ///
    /// * `max_outstanding` - queue length beyond which the peer is considered gone
    /// * `strict` - reject acks that do not echo the oldest nonce
    pub fn new(max_outstanding: usize, strict: bool) -> Self {
        // ---
        Self {
            outstanding: VecDeque::with_capacity(max_outstanding + 1),
            max_outstanding,
            strict,
            last_rtt: None,
        }
    }

    /// Records a heartbeat about to be sent.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::ProtocolViolation`] without recording anything if
    /// more than `max_outstanding` heartbeats are already unacknowledged.
    pub fn beat(&mut self, nonce: u64) -> Result<()> {
        // ---
        if self.outstanding.len() > self.max_outstanding {
            return Err(VoiceError::protocol(format!(
                "{} heartbeats unacknowledged",
                self.outstanding.len()
            )));
        }
        self.outstanding.push_back(nonce);
        Ok(())
    }

    /// Pops the oldest outstanding heartbeat for an ack carrying `value`.
    ///
    /// # Returns
    ///
    /// The round trip measured against `now_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::ProtocolViolation`] if nothing is outstanding or,
    /// in strict mode, `value` is not the oldest nonce.
    pub fn acknowledge(&mut self, value: u64, now_ms: u64) -> Result<Duration> {
        // ---
        let oldest = self
            .outstanding
            .pop_front()
            .ok_or_else(|| VoiceError::protocol("heartbeat ack with no heartbeat outstanding"))?;

        if self.strict && value != oldest {
            return Err(VoiceError::protocol(format!(
                "heartbeat ack {value} does not match oldest heartbeat {oldest}"
            )));
        }

        let rtt = Duration::from_millis(now_ms.saturating_sub(oldest));
        self.last_rtt = Some(rtt);
        Ok(rtt)
    }

    pub fn outstanding(&self) -> usize {
        // ---
        self.outstanding.len()
    }

    pub fn rtt(&self) -> Option<Duration> {
        // ---
        self.last_rtt
    }

    /// Forgets outstanding heartbeats, e.g. when a new websocket is opened.
    pub fn reset(&mut self) {
        // ---
        self.outstanding.clear();
    }
}

/// Spawns the heartbeat timer.
///
/// The first heartbeat goes out one full `period` after the call. If the
/// tracker reports the peer overdue, the task signals the session and stops.
pub(crate) fn spawn_heartbeat(
    server_id: u64,
    period: Duration,
    tracker: Arc<Mutex<HeartbeatTracker>>,
    outbound: mpsc::UnboundedSender<GatewayMessage>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        // ---
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Connection {}: heartbeating every {:?}", server_id, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let nonce = unix_millis();
                    let beat = tracker
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .beat(nonce);

                    if let Err(e) = beat {
                        warn!("Connection {}: {}", server_id, e);
                        let _ = signals.send(SessionSignal::HeartbeatOverdue(e));
                        break;
                    }

                    trace!("Connection {}: heartbeat {}", server_id, nonce);
                    if outbound.send(GatewayMessage::heartbeat(nonce)).is_err() {
                        break;
                    }
                }
            }
        }

        trace!("Connection {}: heartbeat task stopped", server_id);
    })
}
