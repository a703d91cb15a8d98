use std::cmp::min;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ConnectionConfig;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatAction {
    /// nothing to do before the given time
    Wait(Instant),
    /// send a heartbeat, to all known endpoints if `all_endpoints`, and check again at `next`
    Probe { all_endpoints: bool, next: Instant },
    /// nothing was received for too long
    Break,
}

/// Liveness tracking of an established connection, based on the time anything was last received
///  from the peer
#[derive(Debug)]
pub struct HeartbeatTracker {
    last_recv: Instant,
    num_probes: u32,
    config: ConnectionConfig,
}

impl HeartbeatTracker {
    /// every n-th probe is sent to all known endpoints, bypassing the transport's route cache
    pub const FULL_PROBE_INTERVAL: u32 = 3;

    pub fn new(config: ConnectionConfig, now: Instant) -> HeartbeatTracker {
        HeartbeatTracker {
            last_recv: now,
            num_probes: 0,
            config,
        }
    }

    pub fn on_recv(&mut self, now: Instant) {
        self.last_recv = now;
        self.num_probes = 0;
    }

    pub fn first_check(&self) -> Instant {
        self.last_recv + self.config.heartbeat_begin
    }

    pub fn on_timer(&mut self, now: Instant) -> HeartbeatAction {
        let idle = now.saturating_duration_since(self.last_recv);
        let break_at = self.last_recv + self.config.heartbeat_break;

        if idle >= self.config.heartbeat_break {
            debug!("nothing received for {:?}", idle);
            return HeartbeatAction::Break;
        }
        if idle < self.config.heartbeat_begin {
            return HeartbeatAction::Wait(self.first_check());
        }

        self.num_probes += 1;
        trace!("heartbeat probe #{} after {:?} idle", self.num_probes, idle);
        HeartbeatAction::Probe {
            all_endpoints: self.num_probes % Self::FULL_PROBE_INTERVAL == 0,
            next: min(now + self.config.heartbeat_interval, break_at),
        }
    }
}
