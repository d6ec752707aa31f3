//! Heartbeat supervision for a single connection.
//!
//! The monitor probes the connection every `interval` and disconnects it
//! once no liveness acknowledgment has arrived for `timeout`. A silent
//! connection is therefore torn down within `timeout + interval`.
//!
//! ```text
//!   Alive --(tick, silent < timeout)--> Alive   (probe sent)
//!   Alive --(tick, silent >= timeout)--> Disconnected
//!   Alive --(connection closed elsewhere)--> Disconnected
//! ```

use crate::connection::{DisconnectReason, LiveConnection};
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Default time a connection may stay silent.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl HeartbeatConfig {
    /// Probe at half the timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: (timeout / 2).max(Duration::from_millis(1)),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

/// Outcome of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Expired { silent_for: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Alive,
    /// Terminal.
    Disconnected,
}

/// Why [`HeartbeatMonitor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The monitor disconnected a silent connection.
    TimedOut,
    /// The connection was closed by something else.
    ConnectionClosed,
}

pub struct HeartbeatMonitor {
    connection: Arc<LiveConnection>,
    registry: ConnectionRegistry,
    config: HeartbeatConfig,
    state: HeartbeatState,
    timed_out: bool,
}

impl HeartbeatMonitor {
    pub fn new(
        connection: Arc<LiveConnection>,
        registry: ConnectionRegistry,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            connection,
            registry,
            config,
            state: HeartbeatState::Alive,
            timed_out: false,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn check(&self, now: Instant) -> Liveness {
        let silent_for = self.connection.silent_for(now);
        if silent_for >= self.config.timeout {
            Liveness::Expired { silent_for }
        } else {
            Liveness::Alive
        }
    }

    /// Advance the state machine once: disconnect on expiry, otherwise
    /// send a probe.
    pub fn tick(&mut self, now: Instant) -> HeartbeatState {
        if self.state == HeartbeatState::Disconnected {
            return self.state;
        }
        if self.connection.is_closed() {
            self.state = HeartbeatState::Disconnected;
            return self.state;
        }

        match self.check(now) {
            Liveness::Expired { silent_for } => {
                warn!(
                    key = %self.connection.key(),
                    connection_id = %self.connection.id(),
                    silent_ms = silent_for.as_millis() as u64,
                    "heartbeat timed out"
                );
                self.timed_out = self
                    .registry
                    .disconnect(&self.connection, DisconnectReason::HeartbeatTimeout);
                self.state = HeartbeatState::Disconnected;
            }
            Liveness::Alive => {
                if !self.connection.probe() {
                    debug!(
                        connection_id = %self.connection.id(),
                        "probe not queued, writer is behind"
                    );
                }
            }
        }

        self.state
    }

    /// Tick every interval until the connection goes away.
    pub async fn run(mut self) -> HeartbeatExit {
        let connection = self.connection.clone();
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = connection.closed() => {
                    self.state = HeartbeatState::Disconnected;
                }
                _ = ticker.tick() => {
                    self.tick(Instant::now());
                }
            }

            if self.state == HeartbeatState::Disconnected {
                return if self.timed_out {
                    HeartbeatExit::TimedOut
                } else {
                    HeartbeatExit::ConnectionClosed
                };
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<HeartbeatExit> {
        tokio::spawn(self.run())
    }
}
