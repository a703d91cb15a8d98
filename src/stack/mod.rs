//! The stack is where everything comes together: it owns all connections and acceptors of the
//!  local peer, demultiplexes inbound packages to them, and sends their outbound packages through
//!  the transport.
//!
//! All mutable state lives in [StackInner] behind a single async mutex. Every entry point
//!  (an inbound package, a timer, an application call) locks it, runs the synchronous protocol
//!  logic, and then sends the packages that logic queued in the outbox before releasing the lock.
//!  Processing is therefore serialized in the order of delivery.

pub mod id_allocator;
pub mod reachability;

use std::cmp::max;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, debug_span, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::acceptor::{Acceptor, AcceptorCore, AcceptorId, AcceptorOptions, AcceptorState};
use crate::collaborators::{DynamicSocket, PeerFinder, SendOptions, SendStatus, SocketId, Transport};
use crate::config::BdtConfig;
use crate::connection::core::{ConnTimer, ConnectionCore};
use crate::connection::state::ConnectionState;
use crate::connection::{ConnId, Connection, ConnectionEvent, RemoteInfo};
use crate::endpoint::Endpoint;
use crate::error::{BdtError, BdtResult};
use crate::package::{CommandType, Package};
use crate::peer::{peerid_hash, PeerInfo};
use crate::stack::id_allocator::IdAllocator;
use crate::stack::reachability::ReachabilityCache;
use crate::util::random::{Random, RngRandom};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackState {
    Init,
    Open,
    /// waiting for connections and acceptors to close
    Closing,
    Closed,
}

/// an encoded package waiting to be handed to the transport
pub(crate) struct Outgoing {
    buf: Bytes,
    endpoints: Vec<Endpoint>,
    options: SendOptions,
    conn: Option<ConnId>,
}

/// Things connections report to the stack, handled after the connection's operation returned
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Notice {
    /// an inbound connection completed its handshake
    Established(ConnId),
    Closed(ConnId),
}

/// The part of the stack's state that connections work with
pub(crate) struct Shared {
    pub config: Arc<BdtConfig>,
    pub local_peerid: String,
    pub local_hash: u16,
    pub local_endpoints: Vec<Endpoint>,
    pub transport: Arc<dyn Transport>,
    pub peer_finder: Arc<dyn PeerFinder>,

    pub reachability: ReachabilityCache,
    pub vports: IdAllocator<RngRandom>,
    pub sessions: IdAllocator<RngRandom>,
    /// source of initial sequence numbers
    pub next_isn: fn() -> u32,

    outbox: VecDeque<Outgoing>,
    pub notices: Vec<Notice>,
    /// for timers and lookups to get back into the stack
    pub self_ref: Weak<Mutex<StackInner>>,
}

impl Shared {
    pub fn post_package(&mut self, package: &mut Package, endpoints: Vec<Endpoint>, options: SendOptions, conn: Option<ConnId>) {
        match package.encode() {
            Ok(buf) => {
                trace!("sending {:?} to {:?}", package, endpoints);
                self.outbox.push_back(Outgoing {
                    buf,
                    endpoints,
                    options,
                    conn,
                });
            }
            Err(e) => error!("failed to encode {:?}: {}", package, e),
        }
    }
}

pub(crate) struct StackInner {
    shared: Shared,
    state: StackState,

    connections: FxHashMap<ConnId, ConnectionCore>,
    acceptors: FxHashMap<AcceptorId, AcceptorCore>,
    /// connections by their local session id
    sessions: FxHashMap<u32, ConnId>,
    acceptor_by_vport: FxHashMap<u16, AcceptorId>,
    next_id: u64,
    close_waiters: Vec<oneshot::Sender<()>>,
}

/// The protocol stack of the local peer. Cloning gives another handle to the same stack.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<Mutex<StackInner>>,
}

impl Stack {
    pub fn new(config: BdtConfig, local_peerid: impl Into<String>, transport: Arc<dyn Transport>, peer_finder: Arc<dyn PeerFinder>) -> anyhow::Result<Stack> {
        config.validate()?;
        let local_peerid = local_peerid.into();
        if local_peerid.is_empty() {
            bail!("local peer id must not be empty");
        }
        info!("creating stack for peer {}", local_peerid);

        let config = Arc::new(config);
        let inner = Arc::new_cyclic(|self_ref| Mutex::new(StackInner {
            shared: Shared {
                local_hash: peerid_hash(&local_peerid),
                local_peerid,
                local_endpoints: Vec::new(),
                transport,
                peer_finder,
                reachability: ReachabilityCache::new(config.reachability_ttl),
                vports: IdAllocator::new(max(config.reserved_vports, 1) as u32, u16::MAX as u32),
                sessions: IdAllocator::new(1, u32::MAX),
                next_isn: RngRandom::next_u32,
                outbox: VecDeque::new(),
                notices: Vec::new(),
                self_ref: self_ref.clone(),
                config,
            },
            state: StackState::Init,
            connections: FxHashMap::default(),
            acceptors: FxHashMap::default(),
            sessions: FxHashMap::default(),
            acceptor_by_vport: FxHashMap::default(),
            next_id: 1,
            close_waiters: Vec::new(),
        }));

        Ok(Stack { inner })
    }

    /// makes the stack ready for connecting and accepting
    pub async fn open(&self) -> BdtResult<()> {
        self.inner.lock().await
            .open()
    }

    /// Closes all acceptors and connections gracefully, returning when the last of them is closed
    pub async fn close(&self) {
        let (sender, receiver) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.close(sender);
            inner.flush().await;
        }
        let _ = receiver.await;
    }

    pub async fn state(&self) -> StackState {
        self.inner.lock().await.state
    }

    pub async fn local_peerid(&self) -> String {
        self.inner.lock().await.shared.local_peerid.clone()
    }

    /// to be called by the transport for every package it received
    pub async fn deliver(&self, socket: SocketId, package: Package, remote: Endpoint, local: Endpoint) {
        let mut inner = self.inner.lock().await;
        inner.on_package(socket, package, remote, local);
        inner.flush().await;
    }

    /// decodes a received buffer and delivers it; undecodable buffers are dropped
    pub async fn deliver_bytes(&self, socket: SocketId, buf: &[u8], remote: Endpoint, local: Endpoint) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "package_received", ?correlation_id);

        let package = match Package::decode(buf) {
            Ok(package) => package,
            Err(e) if e.is_framing() => {
                span.in_scope(|| debug!("dropping undecodable package from {}: {}", remote, e));
                return;
            }
            Err(e) => {
                span.in_scope(|| warn!("dropping package from {}: {}", remote, e));
                return;
            }
        };
        self.deliver(socket, package, remote, local)
            .instrument(span)
            .await;
    }

    /// a reliable stream that reported back pressure can take data again
    pub async fn on_stream_writable(&self, socket: SocketId) {
        let mut inner = self.inner.lock().await;
        inner.on_stream_writable(socket);
        inner.flush().await;
    }

    /// a reliable stream broke: every connection on it breaks as well
    pub async fn on_stream_closed(&self, socket: SocketId) {
        let mut inner = self.inner.lock().await;
        inner.on_stream_closed(socket);
        inner.flush().await;
    }

    pub async fn new_acceptor(&self, options: AcceptorOptions) -> BdtResult<Acceptor> {
        let mut inner = self.inner.lock().await;
        let (id, vport, incoming) = inner.new_acceptor(options)?;
        Ok(Acceptor::new(id, vport, self.inner.clone(), incoming))
    }

    pub async fn new_connection(&self) -> BdtResult<Connection> {
        let mut inner = self.inner.lock().await;
        let (id, events) = inner.new_connection()?;
        Ok(Connection::new(id, self.inner.clone(), events))
    }
}

impl StackInner {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn open(&mut self) -> BdtResult<()> {
        if self.state != StackState::Init {
            return Err(BdtError::InvalidState);
        }
        self.shared.local_endpoints = self.shared.peer_finder.local_endpoints();
        info!("stack {} open at {:?}", self.shared.local_peerid, self.shared.local_endpoints);
        self.state = StackState::Open;
        Ok(())
    }

    fn close(&mut self, waiter: oneshot::Sender<()>) {
        match self.state {
            StackState::Closed => {
                let _ = waiter.send(());
                return;
            }
            StackState::Init => {
                info!("stack {} closed before it was opened", self.shared.local_peerid);
                self.state = StackState::Closed;
                let _ = waiter.send(());
                return;
            }
            StackState::Open | StackState::Closing => {}
        }
        self.close_waiters.push(waiter);

        if self.state == StackState::Open {
            info!("closing stack {} with {} acceptors and {} connections", self.shared.local_peerid, self.acceptors.len(), self.connections.len());
            self.state = StackState::Closing;

            let acceptors = self.acceptors.keys().copied().collect::<Vec<_>>();
            for id in acceptors {
                self.close_acceptor(id, None);
            }

            let now = Instant::now();
            for conn in self.connections.values_mut() {
                conn.close(&mut self.shared, false, None, now);
            }
        }
        self.check_closed();
    }

    fn check_closed(&mut self) {
        if self.state == StackState::Closing && self.connections.is_empty() && self.acceptors.is_empty() {
            info!("stack {} closed", self.shared.local_peerid);
            self.state = StackState::Closed;
            for waiter in self.close_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Sends everything in the outbox, handling notices that connections left for the stack
    ///  along the way. Every entry point calls this before it releases the lock.
    pub(crate) async fn flush(&mut self) {
        loop {
            self.settle_notices();

            let Some(outgoing) = self.shared.outbox.pop_front() else {
                break;
            };
            match self.shared.transport.send(&outgoing.buf, &outgoing.endpoints, &outgoing.options).await {
                Ok(SendStatus::Sent) => {}
                Ok(SendStatus::Busy) => {
                    if let Some(conn) = outgoing.conn.and_then(|id| self.connections.get_mut(&id)) {
                        conn.on_stream_busy();
                    }
                }
                Err(e) => warn!("sending to {:?} failed: {}", outgoing.endpoints, e),
            }
        }
    }

    fn settle_notices(&mut self) {
        while !self.shared.notices.is_empty() {
            for notice in std::mem::take(&mut self.shared.notices) {
                match notice {
                    Notice::Established(id) => self.on_inbound_established(id),
                    Notice::Closed(id) => self.on_connection_closed(id),
                }
            }
        }
        self.check_closed();
    }

    fn on_inbound_established(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let (Some(acceptor_id), Some(events)) = (conn.acceptor, conn.receiver.take()) else {
            return;
        };
        let Some(stack) = self.shared.self_ref.upgrade() else {
            return;
        };

        let connection = Connection::new(id, stack, events);
        let delivered = match self.acceptors.get(&acceptor_id) {
            Some(acceptor) => acceptor.deliver(connection).is_ok(),
            None => false,
        };
        if !delivered {
            debug!("nobody accepts {:?} any more, closing it", id);
            conn.close(&mut self.shared, true, None, Instant::now());
        }
    }

    fn on_connection_closed(&mut self, id: ConnId) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };

        if conn.local_session != 0 {
            if self.sessions.get(&conn.local_session) == Some(&id) {
                self.sessions.remove(&conn.local_session);
            }
            self.shared.sessions.release(conn.local_session);
        }
        if conn.owns_vport {
            if let Some(vport) = conn.local_vport {
                self.shared.vports.release(vport as u32);
            }
        }
        if let Some(acceptor_id) = conn.acceptor {
            if let Some(acceptor) = self.acceptors.get_mut(&acceptor_id) {
                acceptor.remove_child(id);
            }
            self.try_finish_acceptor(acceptor_id);
        }
        debug!("released {:?}", id);
    }

    //------------------------------ inbound

    fn on_package(&mut self, socket: SocketId, package: Package, from: Endpoint, local: Endpoint) {
        trace!("received {:?} from {} at {}", package, from, local);
        // a closing stack still needs packages to complete the close handshakes
        if matches!(self.state, StackState::Init | StackState::Closed) {
            trace!("stack is {:?}, dropping package", self.state);
            return;
        }

        let cmd_type = package.cmd_type();
        if cmd_type.is_rendezvous() {
            trace!("ignoring rendezvous package {:?}", cmd_type);
            return;
        }
        if package.header.dest_peerid_hash != self.shared.local_hash {
            debug!("package for peer id hash {:04x} is not for us - dropping", package.header.dest_peerid_hash);
            return;
        }

        let now = Instant::now();
        match cmd_type {
            _ if cmd_type.is_handshake_request() => self.on_handshake_request(socket, &package, from, now),
            CommandType::CallResp => self.on_call_resp(&package, now),
            CommandType::CallReq | CommandType::CalledResp => {
                trace!("ignoring {:?}, not a rendezvous peer", cmd_type);
            }
            _ => {
                let session = package.header.session_id;
                let Some(conn) = self.sessions.get(&session).and_then(|id| self.connections.get_mut(id)) else {
                    debug!("no connection for session {} - dropping {:?}", session, cmd_type);
                    return;
                };
                if conn.remote_hash() != Some(package.header.src_peerid_hash) {
                    debug!("peer id hash mismatch for session {} - dropping", session);
                    return;
                }
                let shared = &mut self.shared;
                debug_span!("connection", id = ?conn.id)
                    .in_scope(|| conn.on_package(shared, &package, from, socket, now));
            }
        }
    }

    fn on_handshake_request(&mut self, socket: SocketId, package: &Package, from: Endpoint, now: Instant) {
        let header = &package.header;
        let Some(acceptor_id) = self.acceptor_by_vport.get(&header.dest_vport).copied() else {
            debug!("no acceptor at vport {} - dropping {:?}", header.dest_vport, header.cmd_type);
            return;
        };
        let Some(acceptor) = self.acceptors.get(&acceptor_id) else {
            return;
        };
        if acceptor.state != AcceptorState::Listening {
            debug!("acceptor {:?} is {:?} - dropping {:?}", acceptor_id, acceptor.state, header.cmd_type);
            return;
        }
        let Some(src_peerid) = package.body.src_peerid.clone() else {
            debug!("{:?} without source peer id - dropping", header.cmd_type);
            return;
        };
        if peerid_hash(&src_peerid) != header.src_peerid_hash {
            warn!("{:?} from {}: peer id {} does not match its hash - dropping", header.cmd_type, from, src_peerid);
            return;
        }

        if let Some(existing) = acceptor.child(&src_peerid, header.session_id) {
            if let Some(conn) = self.connections.get_mut(&existing) {
                conn.on_handshake_repeat(&mut self.shared, package, from, socket);
            }
            return;
        }

        let (allow_half_open, vport) = (acceptor.allow_half_open, acceptor.vport);
        let session = match self.shared.sessions.allocate() {
            Ok(session) => session,
            Err(e) => {
                warn!("rejecting {:?} from {}: {}", header.cmd_type, src_peerid, e);
                return;
            }
        };
        let id = ConnId(self.next_id());
        debug!("inbound {:?} from {}:{} at {}", id, src_peerid, header.src_vport, from);

        if let Some(acceptor) = self.acceptors.get_mut(&acceptor_id) {
            acceptor.add_child(src_peerid.clone(), header.session_id, id);
        }
        let conn = ConnectionCore::new_inbound(id, acceptor_id, allow_half_open, vport, session, &mut self.shared, package, src_peerid, from, socket, now);
        self.sessions.insert(session, id);
        self.connections.insert(id, conn);
    }

    fn on_call_resp(&mut self, package: &Package, now: Instant) {
        let remote_hash = package.body.src_peerid.as_deref()
            .map(peerid_hash)
            .unwrap_or(package.header.src_peerid_hash);
        if !package.body.endpoints.is_empty() {
            self.shared.reachability.purge_expired(now);
            self.shared.reachability.insert(remote_hash, &package.body.endpoints, now);
        }

        if let Some(conn) = self.sessions.get(&package.header.session_id).and_then(|id| self.connections.get_mut(id)) {
            conn.on_call_resp(&mut self.shared, package);
        }
    }

    fn on_stream_writable(&mut self, socket: SocketId) {
        let now = Instant::now();
        for conn in self.connections.values_mut().filter(|c| c.is_on_socket(socket)) {
            conn.on_stream_writable(&mut self.shared, now);
        }
    }

    fn on_stream_closed(&mut self, socket: SocketId) {
        for conn in self.connections.values_mut().filter(|c| c.is_on_socket(socket)) {
            debug!("stream {:?} closed under {:?}", socket, conn.id);
            conn.on_break(&mut self.shared);
        }
    }

    //------------------------------ timers and lookups

    pub(crate) async fn on_connection_timer(&mut self, id: ConnId, kind: ConnTimer, token: u64) {
        if let Some(conn) = self.connections.get_mut(&id) {
            let shared = &mut self.shared;
            debug_span!("connection", id = ?id)
                .in_scope(|| conn.on_timer(shared, kind, token, Instant::now()));
        }
        self.flush().await;
    }

    pub(crate) async fn on_peer_found(&mut self, id: ConnId, peer: Option<PeerInfo>) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.on_peer_found(&mut self.shared, peer);
        }
        self.flush().await;
    }

    pub(crate) async fn on_sn_found(&mut self, id: ConnId, found: BdtResult<Vec<PeerInfo>>) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.on_sn_found(&mut self.shared, found, Instant::now());
        }
        self.flush().await;
    }

    pub(crate) async fn on_dynamic_socket(&mut self, id: ConnId, socket: Box<dyn DynamicSocket>) {
        match self.connections.get_mut(&id) {
            Some(conn) => conn.on_dynamic_socket(&mut self.shared, socket),
            None => trace!("{:?} is gone, dropping dynamic socket {:?}", id, socket.id()),
        }
        self.flush().await;
    }

    //------------------------------ connection API

    fn new_connection(&mut self) -> BdtResult<(ConnId, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        if matches!(self.state, StackState::Closing | StackState::Closed) {
            return Err(BdtError::InvalidState);
        }
        let id = ConnId(self.next_id());
        let (sender, receiver) = mpsc::unbounded_channel();
        self.connections.insert(id, ConnectionCore::new(id, sender));
        Ok((id, receiver))
    }

    pub(crate) fn bind_connection(&mut self, id: ConnId, vport: Option<u16>) -> BdtResult<u16> {
        let conn = self.connections.get_mut(&id).ok_or(BdtError::InvalidState)?;
        conn.bind(&mut self.shared, vport)
    }

    pub(crate) fn connect(&mut self, id: ConnId, peerid: &str, vport: u16, waiter: oneshot::Sender<BdtResult<()>>) -> BdtResult<()> {
        if self.state != StackState::Open {
            return Err(BdtError::InvalidState);
        }
        let conn = self.connections.get_mut(&id).ok_or(BdtError::InvalidState)?;
        if conn.state != ConnectionState::Init {
            return Err(BdtError::InvalidState);
        }

        let session = self.shared.sessions.allocate()?;
        if let Err(e) = conn.connect(&mut self.shared, peerid, vport, session, waiter, Instant::now()) {
            self.shared.sessions.release(session);
            return Err(e);
        }
        self.sessions.insert(session, id);
        Ok(())
    }

    pub(crate) fn send(&mut self, id: ConnId, data: &[u8]) -> BdtResult<usize> {
        let conn = self.connections.get_mut(&id).ok_or(BdtError::InvalidState)?;
        conn.send(&mut self.shared, data, Instant::now())
    }

    pub(crate) fn close_connection(&mut self, id: ConnId, force: bool, waiter: oneshot::Sender<()>) {
        match self.connections.get_mut(&id) {
            Some(conn) => conn.close(&mut self.shared, force, Some(waiter), Instant::now()),
            None => {
                let _ = waiter.send(());
            }
        }
    }

    pub(crate) fn on_handle_dropped(&mut self, id: ConnId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            trace!("handle of {:?} dropped", id);
            conn.close(&mut self.shared, false, None, Instant::now());
        }
    }

    pub(crate) fn connection_state(&self, id: ConnId) -> ConnectionState {
        self.connections.get(&id)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub(crate) fn connection_remote(&self, id: ConnId) -> Option<RemoteInfo> {
        self.connections.get(&id)
            .and_then(|c| c.remote_info())
    }

    pub(crate) fn connection_vport(&self, id: ConnId) -> Option<u16> {
        self.connections.get(&id)
            .and_then(|c| c.local_vport)
    }

    //------------------------------ acceptor API

    fn new_acceptor(&mut self, options: AcceptorOptions) -> BdtResult<(AcceptorId, u16, mpsc::UnboundedReceiver<Connection>)> {
        if matches!(self.state, StackState::Closing | StackState::Closed) {
            return Err(BdtError::InvalidState);
        }
        let vport = match options.vport {
            Some(vport) => {
                self.shared.vports.reserve(vport as u32)?;
                vport
            }
            None => self.shared.vports.allocate()? as u16,
        };

        let id = AcceptorId(self.next_id());
        let (sender, receiver) = mpsc::unbounded_channel();
        self.acceptors.insert(id, AcceptorCore::new(id, vport, options.allow_half_open, sender));
        self.acceptor_by_vport.insert(vport, id);
        debug!("new acceptor {:?} at vport {}", id, vport);
        Ok((id, vport, receiver))
    }

    pub(crate) fn listen(&mut self, id: AcceptorId) -> BdtResult<()> {
        if self.state != StackState::Open {
            return Err(BdtError::InvalidState);
        }
        self.acceptors.get_mut(&id)
            .ok_or(BdtError::InvalidState)?
            .listen()
    }

    pub(crate) fn close_acceptor(&mut self, id: AcceptorId, waiter: Option<oneshot::Sender<()>>) {
        let Some(acceptor) = self.acceptors.get_mut(&id) else {
            if let Some(waiter) = waiter {
                let _ = waiter.send(());
            }
            return;
        };

        let now = Instant::now();
        for child in acceptor.begin_close(waiter) {
            if let Some(conn) = self.connections.get_mut(&child) {
                conn.close(&mut self.shared, false, None, now);
            }
        }
        self.try_finish_acceptor(id);
    }

    fn try_finish_acceptor(&mut self, id: AcceptorId) {
        let Some(acceptor) = self.acceptors.get_mut(&id) else {
            return;
        };
        if acceptor.try_complete_close() {
            let vport = acceptor.vport;
            self.acceptors.remove(&id);
            self.acceptor_by_vport.remove(&vport);
            self.shared.vports.release(vport as u32);
        }
    }

    pub(crate) fn acceptor_state(&self, id: AcceptorId) -> AcceptorState {
        self.acceptors.get(&id)
            .map(|a| a.state)
            .unwrap_or(AcceptorState::Closed)
    }
}
