use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::collaborators::{DynamicSocket, MockPeerFinder, SendOptions, SendStatus, SocketId, Transport};
use crate::config::BdtConfig;
use crate::endpoint::{Endpoint, Family};
use crate::error::{BdtError, BdtResult};
use crate::package::{CommandType, Package, PackageFlags, PackageHeader};
use crate::peer::PeerInfo;
use crate::stack::Stack;
use crate::transfer::{TransferEvent, TransferHost};

/// A [TransferHost] that records everything a transfer posts and emits
#[derive(Default)]
pub struct RecordingHost {
    pub posted: Vec<Package>,
    pub events: Vec<TransferEvent>,
}

impl RecordingHost {
    pub fn take_posted(&mut self) -> Vec<Package> {
        std::mem::take(&mut self.posted)
    }

    pub fn posted_resends(&self) -> Vec<Package> {
        self.posted.iter()
            .filter(|p| p.header.flags.contains(PackageFlags::RESEND))
            .cloned()
            .collect()
    }

    /// all data emitted so far, concatenated
    pub fn received_data(&self) -> Vec<u8> {
        self.events.iter()
            .flat_map(|e| match e {
                TransferEvent::Data(data) => data.clone(),
                _ => Bytes::new(),
            })
            .collect()
    }
}

impl TransferHost for RecordingHost {
    fn new_package(&self, cmd_type: CommandType) -> Package {
        let mut header = PackageHeader::new(cmd_type);
        header.session_id = 7;
        Package::new(header)
    }

    fn post_package(&mut self, package: &mut Package) {
        package.encode().unwrap();
        self.posted.push(package.clone());
    }

    fn emit(&mut self, event: TransferEvent) {
        self.events.push(event);
    }
}

/// An in-memory network of stacks, each reachable at its own endpoints. Every package is delivered
///  in a spawned task so that a sending stack never waits for the receiving one.
///
/// The network can also play a rendezvous peer (SN) at a given endpoint, and hand out dynamic
///  sockets that record when they are closed.
#[derive(Clone, Default)]
pub struct TestNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    stacks: FxHashMap<Endpoint, Stack>,
    peers: FxHashMap<String, Vec<Endpoint>>,
    /// peers that `find_peer` does not know; only the rendezvous peer does
    hidden: FxHashSet<String>,
    rendezvous: Option<Endpoint>,
    /// returns `true` for packages to drop
    filter: Option<Box<dyn FnMut(&Package) -> bool + Send>>,
    sent: Vec<Package>,

    dynamic_sockets_enabled: bool,
    dynamic_sockets: Arc<DynamicSocketLog>,
}

#[derive(Default)]
pub struct DynamicSocketLog {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    /// sends that asked for a dynamic socket
    pub used: AtomicUsize,
}

impl TestNetwork {
    pub const RENDEZVOUS_PEERID: &'static str = "sn";

    /// a stack attached to this network at the given endpoint; it still needs to be opened
    pub fn stack(&self, peerid: &str, endpoint: Endpoint, config: BdtConfig) -> Stack {
        let mut peer_finder = MockPeerFinder::new();
        peer_finder.expect_local_endpoints()
            .returning(move || vec![endpoint]);
        let network = self.clone();
        peer_finder.expect_find_peer()
            .returning(move |peerid| network.peer_info(peerid));
        let network = self.clone();
        peer_finder.expect_find_sn()
            .returning(move |_, _| Ok(network.rendezvous_info()));

        let transport = Arc::new(LinkedTransport {
            local: endpoint,
            network: self.clone(),
        });
        let stack = Stack::new(config, peerid, transport, Arc::new(peer_finder)).unwrap();

        let mut inner = self.inner.lock().unwrap();
        inner.stacks.insert(endpoint, stack.clone());
        inner.peers.entry(peerid.to_string()).or_default().push(endpoint);
        stack
    }

    pub fn peer_info(&self, peerid: &str) -> Option<PeerInfo> {
        let inner = self.inner.lock().unwrap();
        if inner.hidden.contains(peerid) {
            return None;
        }
        inner.peers.get(peerid)
            .map(|endpoints| PeerInfo::new(peerid, endpoints.clone()))
    }

    pub fn hide(&self, peerid: &str) {
        self.inner.lock().unwrap().hidden.insert(peerid.to_string());
    }

    pub fn set_rendezvous(&self, endpoint: Endpoint) {
        self.inner.lock().unwrap().rendezvous = Some(endpoint);
    }

    fn rendezvous_info(&self) -> Vec<PeerInfo> {
        self.inner.lock().unwrap()
            .rendezvous
            .map(|endpoint| PeerInfo::new(Self::RENDEZVOUS_PEERID, vec![endpoint]))
            .into_iter()
            .collect()
    }

    pub fn enable_dynamic_sockets(&self) {
        self.inner.lock().unwrap().dynamic_sockets_enabled = true;
    }

    pub fn dynamic_sockets(&self) -> Arc<DynamicSocketLog> {
        self.inner.lock().unwrap().dynamic_sockets.clone()
    }

    pub fn set_filter(&self, filter: impl FnMut(&Package) -> bool + Send + 'static) {
        self.inner.lock().unwrap().filter = Some(Box::new(filter));
    }

    /// all packages sent to a stack or the rendezvous peer on this network, including dropped ones
    pub fn sent(&self) -> Vec<Package> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn count_sent(&self, cmd_type: CommandType) -> usize {
        self.inner.lock().unwrap()
            .sent.iter()
            .filter(|p| p.cmd_type() == cmd_type)
            .count()
    }
}

impl NetworkInner {
    /// Answers a callReq the way a rendezvous peer does: the called peer gets a calledReq carrying
    ///  the caller's endpoint as the rendezvous peer saw it, the caller a callResp with the called
    ///  peer's endpoints.
    fn answer_call(&self, caller: Endpoint, call: &Package) -> Vec<(Endpoint, Package)> {
        if call.cmd_type() != CommandType::CallReq {
            return Vec::new();
        }
        let Some(callee) = call.body.dest_peerid.as_ref() else {
            return Vec::new();
        };
        let Some(callee_endpoints) = self.peers.get(callee) else {
            return Vec::new();
        };

        let mut called = call.clone();
        called.header.cmd_type = CommandType::CalledReq;
        called.body.endpoints = vec![caller];
        called.invalidate();

        let mut header = PackageHeader::new(CommandType::CallResp);
        header.dest_peerid_hash = call.header.src_peerid_hash;
        header.session_id = call.header.session_id;
        let mut resp = Package::new(header);
        resp.body.src_peerid = Some(callee.clone());
        resp.body.sn_peerid = Some(TestNetwork::RENDEZVOUS_PEERID.to_string());
        resp.body.endpoints = callee_endpoints.clone();

        callee_endpoints.iter()
            .map(|endpoint| (*endpoint, called.clone()))
            .chain(std::iter::once((caller, resp)))
            .collect()
    }

    fn deliver(&mut self, from: Endpoint, to: Endpoint, package: &Package) -> BdtResult<()> {
        let Some(stack) = self.stacks.get(&to).cloned() else {
            return Ok(());
        };
        self.sent.push(package.clone());
        if self.filter.as_mut().is_some_and(|filter| filter(package)) {
            return Ok(());
        }

        let buf = package.clone().encode()?;
        tokio::spawn(async move {
            stack.deliver_bytes(SocketId(1), &buf, from, to).await;
        });
        Ok(())
    }
}

pub struct LinkedTransport {
    local: Endpoint,
    network: TestNetwork,
}

#[async_trait]
impl Transport for LinkedTransport {
    async fn send(&self, buf: &[u8], endpoints: &[Endpoint], options: &SendOptions) -> BdtResult<SendStatus> {
        let package = Package::decode(buf)?;

        let mut inner = self.network.inner.lock().unwrap();
        if options.preferred_socket.is_some_and(|s| s.0 >= TestSocket::FIRST_ID) {
            inner.dynamic_sockets.used.fetch_add(1, Ordering::SeqCst);
        }
        for endpoint in endpoints {
            if inner.rendezvous == Some(*endpoint) {
                inner.sent.push(package.clone());
                for (to, reply) in inner.answer_call(self.local, &package) {
                    inner.deliver(*endpoint, to, &reply)?;
                }
                continue;
            }
            inner.deliver(self.local, *endpoint, &package)?;
        }
        Ok(SendStatus::Sent)
    }

    async fn create_dynamic_socket(&self, _family: Family) -> BdtResult<Box<dyn DynamicSocket>> {
        let inner = self.network.inner.lock().unwrap();
        if !inner.dynamic_sockets_enabled {
            return Err(BdtError::InvalidState);
        }
        let n = inner.dynamic_sockets.opened.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(Box::new(TestSocket {
            id: SocketId(TestSocket::FIRST_ID + n),
            log: inner.dynamic_sockets.clone(),
        }))
    }
}

pub struct TestSocket {
    id: SocketId,
    log: Arc<DynamicSocketLog>,
}

impl TestSocket {
    const FIRST_ID: u64 = 100;
}

impl DynamicSocket for TestSocket {
    fn id(&self) -> SocketId {
        self.id
    }
}

impl Drop for TestSocket {
    fn drop(&mut self) {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
    }
}
