//! Candidate bookkeeping while a connection is being set up: which endpoints the handshake is
//!  sent to, which rendezvous peers are asked to relay a call, and the ephemeral socket used as a
//!  last resort.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::collaborators::{DynamicSocket, SocketId};
use crate::config::HolePunchConfig;
use crate::endpoint::Endpoint;
use crate::peer::PeerInfo;
use crate::util::exponential_backoff::ExponentialBackoff;

/// A rendezvous peer that is asked to relay our handshake to the remote peer
#[derive(Debug)]
struct RendezvousTry {
    sn_peerid: String,
    endpoints: Vec<Endpoint>,
    call_times: u32,
    next_call: Instant,
    backoff: ExponentialBackoff,
    responded: bool,
}

/// A relay call that is due
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DueCall {
    pub sn_peerid: String,
    pub endpoints: Vec<Endpoint>,
}

pub struct HolePunch {
    config: HolePunchConfig,
    candidates: Vec<Endpoint>,
    tries: Vec<RendezvousTry>,
    sn_search_backoff: ExponentialBackoff,
    sn_searches: u32,
    dynamic_socket: Option<Box<dyn DynamicSocket>>,
    /// lookups and socket creation in flight, aborted when the attempt ends
    tasks: Vec<JoinHandle<()>>,
}

impl HolePunch {
    pub fn new(config: HolePunchConfig) -> HolePunch {
        HolePunch {
            sn_search_backoff: ExponentialBackoff::new(config.sn_search_initial_interval, config.sn_search_max_interval),
            config,
            candidates: Vec::new(),
            tries: Vec::new(),
            sn_searches: 0,
            dynamic_socket: None,
            tasks: Vec::new(),
        }
    }

    pub fn candidates(&self) -> &[Endpoint] {
        &self.candidates
    }

    /// returns `true` if the endpoint was not known before
    pub fn add_endpoint(&mut self, endpoint: Endpoint) -> bool {
        if self.candidates.contains(&endpoint) {
            return false;
        }
        trace!("new candidate endpoint {}", endpoint);
        self.candidates.push(endpoint);
        true
    }

    /// Adds an endpoint observed from the outside, i.e. a NAT mapping, together with guesses of
    ///  neighboring ports for NATs that allocate ports sequentially but not deterministically.
    pub fn add_nat_mapped(&mut self, endpoint: Endpoint) -> bool {
        let port = endpoint.addr.port();
        let mut added = self.add_endpoint(endpoint);

        for distance in 1..=self.config.port_guess_range {
            for guess in [port.checked_add(distance), port.checked_sub(distance)].into_iter().flatten() {
                if guess != 0 {
                    added |= self.add_endpoint(endpoint.with_port(guess));
                }
            }
        }
        added
    }

    /// Starts a rendezvous peer search. Returns whether it may be answered from the peer finder's
    ///  cache, which only the first search may, and the delay before the next search.
    pub fn start_sn_search(&mut self) -> (bool, Duration) {
        let from_cache = self.sn_searches == 0;
        self.sn_searches += 1;
        (from_cache, self.sn_search_backoff.next_delay())
    }

    /// registers rendezvous peers from an SN lookup; known ones are left alone
    pub fn on_sn_found(&mut self, sns: Vec<PeerInfo>, local_peerid: &str, now: Instant) {
        for sn in sns {
            if sn.peerid == local_peerid || self.tries.iter().any(|t| t.sn_peerid == sn.peerid) {
                continue;
            }
            debug!("new rendezvous peer {} with {} endpoints", sn.peerid, sn.endpoints.len());
            self.tries.push(RendezvousTry {
                sn_peerid: sn.peerid,
                endpoints: sn.endpoints,
                call_times: 0,
                next_call: now + self.config.call_delay,
                backoff: ExponentialBackoff::new(self.config.call_interval, self.config.call_interval * 2u32.pow(self.config.max_call_times.min(16))),
                responded: false,
            });
        }
    }

    /// the next time a relay call is due, if any
    pub fn next_call_time(&self) -> Option<Instant> {
        self.tries.iter()
            .filter(|t| !t.responded && t.call_times < self.config.max_call_times)
            .map(|t| t.next_call)
            .min()
    }

    /// returns the calls that are due and schedules their repetitions
    pub fn due_calls(&mut self, now: Instant) -> Vec<DueCall> {
        let max_call_times = self.config.max_call_times;

        self.tries.iter_mut()
            .filter(|t| !t.responded && t.call_times < max_call_times && t.next_call <= now)
            .map(|t| {
                t.call_times += 1;
                t.next_call = now + t.backoff.next_delay();
                DueCall {
                    sn_peerid: t.sn_peerid.clone(),
                    endpoints: t.endpoints.clone(),
                }
            })
            .collect()
    }

    /// A rendezvous peer answered a call with the endpoints it sees for the remote peer. Returns
    ///  `true` if new candidates were learned.
    pub fn on_call_resp(&mut self, sn_peerid: Option<&str>, endpoints: &[Endpoint]) -> bool {
        if let Some(sn_peerid) = sn_peerid {
            for t in self.tries.iter_mut().filter(|t| t.sn_peerid == sn_peerid) {
                t.responded = true;
            }
        }

        let mut added = false;
        for endpoint in endpoints {
            added |= self.add_nat_mapped(*endpoint);
        }
        added
    }

    pub fn set_dynamic_socket(&mut self, socket: Box<dyn DynamicSocket>) {
        debug!("using dynamic socket {:?}", socket.id());
        self.dynamic_socket = Some(socket);
    }

    pub fn dynamic_socket_id(&self) -> Option<SocketId> {
        self.dynamic_socket.as_ref()
            .map(|s| s.id())
    }

    pub fn add_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }
}

impl Drop for HolePunch {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(socket) = &self.dynamic_socket {
            trace!("releasing dynamic socket {:?}", socket.id());
        }
    }
}
