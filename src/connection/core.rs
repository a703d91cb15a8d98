use std::sync::Weak;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::acceptor::AcceptorId;
use crate::collaborators::{DynamicSocket, SendOptions, SocketId};
use crate::connection::heartbeat::{HeartbeatAction, HeartbeatTracker};
use crate::connection::hole_punch::HolePunch;
use crate::connection::state::ConnectionState;
use crate::connection::{ConnId, ConnectionEvent, RemoteInfo};
use crate::endpoint::{Endpoint, Family, Protocol};
use crate::error::{BdtError, BdtResult};
use crate::package::{CommandType, Package, PackageHeader};
use crate::peer::{peerid_hash, PeerInfo};
use crate::sequence::SeqNum;
use crate::stack::{Notice, Shared, StackInner};
use crate::transfer::tcp::TcpTransfer;
use crate::transfer::udp::UdpTransfer;
use crate::transfer::{Transfer, TransferEvent, TransferHost};
use crate::util::timers::Timers;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) enum ConnTimer {
    /// re-sending the handshake package to all candidates
    Syn,
    SnSearch,
    /// relay calls through rendezvous peers
    Call,
    DynamicSocket,
    ConnectTimeout,
    Transfer,
    Heartbeat,
    TimeWait,
}

struct Remote {
    peerid: String,
    hash: u16,
    vport: u16,
    /// 0 until the peer told us
    session: u32,
}

/// Addressing of an established connection: everything needed to send a package to the peer
struct Route {
    local_vport: u16,
    local_hash: u16,
    remote_vport: u16,
    remote_hash: u16,
    remote_session: u32,
    endpoint: Endpoint,
    socket: Option<SocketId>,
}

impl Route {
    fn new_package(&self, cmd_type: CommandType) -> Package {
        let mut header = PackageHeader::new(cmd_type);
        header.src_vport = self.local_vport;
        header.dest_vport = self.remote_vport;
        header.src_peerid_hash = self.local_hash;
        header.dest_peerid_hash = self.remote_hash;
        header.session_id = self.remote_session;
        Package::new(header)
    }

    fn send_options(&self) -> SendOptions {
        SendOptions {
            preferred_socket: self.socket,
            ..SendOptions::default()
        }
    }
}

/// The [TransferHost] of an established connection: packages go to the stack's outbox, events are
///  collected and handled by the connection after the transfer returns
struct RouteHost<'a> {
    shared: &'a mut Shared,
    route: &'a Route,
    conn: ConnId,
    events: Vec<TransferEvent>,
}

impl TransferHost for RouteHost<'_> {
    fn new_package(&self, cmd_type: CommandType) -> Package {
        self.route.new_package(cmd_type)
    }

    fn post_package(&mut self, package: &mut Package) {
        self.shared.post_package(package, vec![self.route.endpoint], self.route.send_options(), Some(self.conn));
    }

    fn emit(&mut self, event: TransferEvent) {
        self.events.push(event);
    }
}

/// The state of a single connection, owned by the stack. All operations run with the stack locked,
///  and everything they send goes through the stack's outbox.
pub(crate) struct ConnectionCore {
    pub id: ConnId,
    pub state: ConnectionState,
    /// set for inbound connections
    pub acceptor: Option<AcceptorId>,
    allow_half_open: bool,

    pub local_vport: Option<u16>,
    /// `false` for inbound connections which share their acceptor's vport
    pub owns_vport: bool,
    /// 0 until connecting
    pub local_session: u32,
    remote: Option<Remote>,

    local_isn: SeqNum,
    remote_isn: SeqNum,
    remote_window: u16,

    hole_punch: Option<HolePunch>,
    route: Option<Route>,
    /// all endpoints the peer was ever a candidate at, for heartbeat probes
    known_endpoints: Vec<Endpoint>,
    transfer: Option<Box<dyn Transfer>>,
    heartbeat: Option<HeartbeatTracker>,
    timers: Timers<ConnTimer>,

    events: mpsc::UnboundedSender<ConnectionEvent>,
    /// inbound connections keep their event channel here until they are accepted
    pub receiver: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    connect_waiter: Option<oneshot::Sender<BdtResult<()>>>,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl ConnectionCore {
    pub fn new(id: ConnId, events: mpsc::UnboundedSender<ConnectionEvent>) -> ConnectionCore {
        ConnectionCore {
            id,
            state: ConnectionState::Init,
            acceptor: None,
            allow_half_open: false,
            local_vport: None,
            owns_vport: false,
            local_session: 0,
            remote: None,
            local_isn: SeqNum::ZERO,
            remote_isn: SeqNum::ZERO,
            remote_window: 0,
            hole_punch: None,
            route: None,
            known_endpoints: Vec::new(),
            transfer: None,
            heartbeat: None,
            timers: Timers::default(),
            events,
            receiver: None,
            connect_waiter: None,
            close_waiters: Vec::new(),
        }
    }

    /// A connection for a handshake request (syn or relayed calledReq) that arrived at a listening
    ///  acceptor. It answers with a synAck right away.
    #[allow(clippy::too_many_arguments)]
    pub fn new_inbound(
        id: ConnId,
        acceptor: AcceptorId,
        allow_half_open: bool,
        local_vport: u16,
        local_session: u32,
        shared: &mut Shared,
        request: &Package,
        src_peerid: String,
        from: Endpoint,
        socket: SocketId,
        now: Instant,
    ) -> ConnectionCore {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut core = ConnectionCore::new(id, sender);
        core.receiver = Some(receiver);
        core.acceptor = Some(acceptor);
        core.allow_half_open = allow_half_open;
        core.local_vport = Some(local_vport);
        core.local_session = local_session;

        let header = &request.header;
        core.remote = Some(Remote {
            peerid: src_peerid,
            hash: header.src_peerid_hash,
            vport: header.src_vport,
            session: header.session_id,
        });
        core.local_isn = SeqNum::from_raw((shared.next_isn)());
        core.remote_isn = header.seq;
        core.remote_window = header.window_size;

        core.hole_punch = Some(HolePunch::new(shared.config.hole_punch.clone()));
        core.add_request_candidates(request, from);

        core.set_state(ConnectionState::WaitAckAck);
        if request.cmd_type() == CommandType::CalledReq {
            core.send_called_resp(shared, request, from, socket);
        }
        core.send_handshake(shared);
        core.schedule(shared, ConnTimer::Syn, now + shared.config.hole_punch.syn_interval);
        core.schedule(shared, ConnTimer::ConnectTimeout, now + shared.config.connection.connect_timeout);
        core
    }

    pub fn remote_info(&self) -> Option<RemoteInfo> {
        self.remote.as_ref()
            .map(|r| RemoteInfo {
                peerid: r.peerid.clone(),
                vport: r.vport,
            })
    }

    pub fn remote_hash(&self) -> Option<u16> {
        self.remote.as_ref()
            .map(|r| r.hash)
    }

    pub fn is_on_socket(&self, socket: SocketId) -> bool {
        self.route.as_ref()
            .is_some_and(|r| r.socket == Some(socket))
    }

    fn set_state(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            error!("connection {:?}: illegal transition {} -> {}", self.id, self.state, next);
        }
        debug!("connection {:?}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            trace!("connection {:?}: event receiver is gone", self.id);
        }
    }

    fn schedule(&mut self, shared: &Shared, kind: ConnTimer, at: Instant) {
        let stack = shared.self_ref.clone();
        let id = self.id;
        self.timers.schedule(kind, at, move |token| fire_timer(stack, id, kind, token));
    }

    fn schedule_no_later(&mut self, shared: &Shared, kind: ConnTimer, at: Instant) {
        let stack = shared.self_ref.clone();
        let id = self.id;
        self.timers.schedule_no_later(kind, at, move |token| fire_timer(stack, id, kind, token));
    }

    pub fn bind(&mut self, shared: &mut Shared, vport: Option<u16>) -> BdtResult<u16> {
        if self.state != ConnectionState::Init || self.local_vport.is_some() {
            return Err(BdtError::InvalidState);
        }

        let vport = match vport {
            Some(vport) => {
                shared.vports.reserve(vport as u32)?;
                vport
            }
            None => shared.vports.allocate()? as u16,
        };
        debug!("connection {:?}: bound to vport {}", self.id, vport);
        self.local_vport = Some(vport);
        self.owns_vport = true;
        Ok(vport)
    }

    /// starts the handshake; the caller allocated the session id
    pub fn connect(&mut self, shared: &mut Shared, peerid: &str, vport: u16, session: u32, waiter: oneshot::Sender<BdtResult<()>>, now: Instant) -> BdtResult<()> {
        if self.state != ConnectionState::Init {
            return Err(BdtError::InvalidState);
        }
        if peerid.is_empty() || vport == 0 {
            return Err(BdtError::InvalidArgs);
        }
        if self.local_vport.is_none() {
            self.bind(shared, None)?;
        }

        let hash = peerid_hash(peerid);
        self.local_session = session;
        self.remote = Some(Remote {
            peerid: peerid.to_string(),
            hash,
            vport,
            session: 0,
        });
        self.local_isn = SeqNum::from_raw((shared.next_isn)());

        let to_self = peerid == shared.local_peerid;
        let mut hole_punch = HolePunch::new(shared.config.hole_punch.clone());
        for endpoint in shared.reachability.get(hash, now) {
            hole_punch.add_endpoint(endpoint);
        }
        if to_self {
            for endpoint in &shared.local_endpoints {
                hole_punch.add_endpoint(*endpoint);
            }
        }
        self.hole_punch = Some(hole_punch);
        self.connect_waiter = Some(waiter);

        info!("connection {:?}: connecting to {}:{}", self.id, peerid, vport);
        self.set_state(ConnectionState::WaitAck);
        self.send_handshake(shared);

        let config = shared.config.clone();
        self.schedule(shared, ConnTimer::Syn, now + config.hole_punch.syn_interval);
        self.schedule(shared, ConnTimer::ConnectTimeout, now + config.connection.connect_timeout);
        if !to_self {
            self.spawn_find_peer(shared);
            self.schedule(shared, ConnTimer::SnSearch, now);
            self.schedule(shared, ConnTimer::DynamicSocket, now + config.hole_punch.dynamic_socket_delay);
        }
        Ok(())
    }

    pub fn send(&mut self, shared: &mut Shared, data: &[u8], now: Instant) -> BdtResult<usize> {
        if !self.state.can_send() {
            return Err(BdtError::InvalidState);
        }
        self.with_transfer(shared, now, |transfer, host| transfer.send(host, data, now))
            .unwrap_or(Err(BdtError::InvalidState))
    }

    /// Graceful close sends a fin behind all buffered data; `force` and connections that are not
    ///  established yet go to `Closed` right away. The waiter is notified once `Closed` is reached.
    pub fn close(&mut self, shared: &mut Shared, force: bool, waiter: Option<oneshot::Sender<()>>, now: Instant) {
        if let Some(waiter) = waiter {
            if self.state.is_closed() {
                let _ = waiter.send(());
                return;
            }
            self.close_waiters.push(waiter);
        }

        use ConnectionState::*;
        match self.state {
            Closed => {}
            _ if force => self.to_closed(shared, None),
            Init | WaitAck | WaitAckAck | Break => self.to_closed(shared, None),
            Establish => {
                self.set_state(FinWait1);
                self.with_transfer(shared, now, |transfer, host| transfer.close(host, now));
            }
            CloseWait => {
                self.set_state(LastAck);
                self.with_transfer(shared, now, |transfer, host| transfer.close(host, now));
            }
            FinWait1 | FinWait2 | Closing | TimeWait | LastAck => {
                trace!("connection {:?}: already closing", self.id);
            }
        }
    }

    /// abnormal termination: the peer went silent or the stream carrying the connection broke
    pub fn on_break(&mut self, shared: &mut Shared) {
        if self.state.is_closed() {
            return;
        }
        debug!("connection {:?}: broken in state {}", self.id, self.state);
        self.set_state(ConnectionState::Break);
        self.to_closed(shared, Some(BdtError::Timeout));
    }

    fn to_closed(&mut self, shared: &mut Shared, reason: Option<BdtError>) {
        if self.state.is_closed() {
            return;
        }
        if let Some(reason) = reason {
            self.emit(ConnectionEvent::Error(reason));
        }
        self.set_state(ConnectionState::Closed);

        self.timers.cancel_all();
        self.transfer = None;
        self.hole_punch = None;
        self.heartbeat = None;

        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(reason.unwrap_or(BdtError::InvalidState)));
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.emit(ConnectionEvent::Closed);
        shared.notices.push(Notice::Closed(self.id));
    }

    pub fn on_timer(&mut self, shared: &mut Shared, kind: ConnTimer, token: u64, now: Instant) {
        if !self.timers.fired(kind, token) {
            return;
        }
        trace!("connection {:?}: timer {:?}", self.id, kind);

        match kind {
            ConnTimer::Syn => {
                if self.state.is_connecting() {
                    self.send_handshake(shared);
                    let at = now + shared.config.hole_punch.syn_interval;
                    self.schedule(shared, ConnTimer::Syn, at);
                }
            }
            ConnTimer::SnSearch => {
                if self.state == ConnectionState::WaitAck {
                    if let Some(next_search) = self.spawn_find_sn(shared) {
                        self.schedule(shared, ConnTimer::SnSearch, now + next_search);
                    }
                }
            }
            ConnTimer::Call => self.send_due_calls(shared, now),
            ConnTimer::DynamicSocket => self.spawn_create_dynamic_socket(shared),
            ConnTimer::ConnectTimeout => {
                if self.state.is_connecting() {
                    debug!("connection {:?}: no handshake reply in time", self.id);
                    if self.acceptor.is_some() {
                        self.to_closed(shared, None);
                    }
                    else {
                        self.to_closed(shared, Some(BdtError::Timeout));
                    }
                }
            }
            ConnTimer::Transfer => {
                self.with_transfer(shared, now, |transfer, host| transfer.on_timer(host, now));
            }
            ConnTimer::Heartbeat => self.on_heartbeat_timer(shared, now),
            ConnTimer::TimeWait => {
                if self.state == ConnectionState::TimeWait {
                    self.to_closed(shared, None);
                }
            }
        }
    }

    //------------------------------ handshake

    fn add_request_candidates(&mut self, request: &Package, from: Endpoint) {
        let Some(hole_punch) = self.hole_punch.as_mut() else {
            return;
        };

        // a relayed request arrives from the rendezvous peer, not from the caller
        let relayed = request.cmd_type() == CommandType::CalledReq;
        if !relayed {
            hole_punch.add_nat_mapped(from);
        }
        for endpoint in &request.body.endpoints {
            if relayed {
                hole_punch.add_nat_mapped(*endpoint);
            }
            else {
                hole_punch.add_endpoint(*endpoint);
            }
        }
    }

    fn handshake_package(&self, shared: &Shared, cmd_type: CommandType) -> Package {
        let mut header = PackageHeader::new(cmd_type);
        header.src_vport = self.local_vport.unwrap_or_default();
        header.src_peerid_hash = shared.local_hash;
        header.window_size = advertised_window(shared);
        if let Some(remote) = &self.remote {
            header.dest_vport = remote.vport;
            header.dest_peerid_hash = remote.hash;
        }

        let mut package = Package::new(header);
        package.body.src_peerid = Some(shared.local_peerid.clone());
        package.body.dest_peerid = self.remote.as_ref().map(|r| r.peerid.clone());
        package.body.endpoints = shared.local_endpoints.clone();
        package.body.timestamp = SystemTime::now().duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64);

        match cmd_type {
            CommandType::SynAck => {
                package.header.session_id = self.remote.as_ref().map(|r| r.session).unwrap_or_default();
                package.header.seq = self.local_isn;
                package.header.ack_seq = self.remote_isn + 1;
                package.body.session_id = Some(self.local_session);
            }
            _ => {
                package.header.session_id = self.local_session;
                package.header.seq = self.local_isn;
            }
        }
        package
    }

    /// sends the pending handshake package (syn or synAck) to all candidate endpoints
    fn send_handshake(&mut self, shared: &mut Shared) {
        let cmd_type = match self.state {
            ConnectionState::WaitAck => CommandType::Syn,
            ConnectionState::WaitAckAck => CommandType::SynAck,
            _ => return,
        };
        let Some(hole_punch) = &self.hole_punch else {
            return;
        };
        let candidates = hole_punch.candidates().to_vec();
        let dynamic_socket = hole_punch.dynamic_socket_id();
        if candidates.is_empty() {
            trace!("connection {:?}: no candidate endpoints yet", self.id);
            return;
        }

        let mut package = self.handshake_package(shared, cmd_type);
        trace!("connection {:?}: sending {:?} to {} candidates", self.id, cmd_type, candidates.len());
        let options = SendOptions {
            ignore_route_cache: true,
            ..SendOptions::default()
        };
        if let Some(socket) = dynamic_socket {
            let dynamic_options = SendOptions {
                preferred_socket: Some(socket),
                ..options.clone()
            };
            shared.post_package(&mut package, candidates.clone(), dynamic_options, Some(self.id));
        }
        shared.post_package(&mut package, candidates, options, Some(self.id));
    }

    fn send_called_resp(&self, shared: &mut Shared, request: &Package, sn: Endpoint, socket: SocketId) {
        let mut header = PackageHeader::new(CommandType::CalledResp);
        header.src_vport = request.header.dest_vport;
        header.dest_vport = request.header.src_vport;
        header.src_peerid_hash = shared.local_hash;
        header.dest_peerid_hash = request.header.src_peerid_hash;
        header.session_id = request.header.session_id;

        let mut package = Package::new(header);
        package.body.src_peerid = Some(shared.local_peerid.clone());
        package.body.session_id = Some(self.local_session);
        let options = SendOptions {
            preferred_socket: Some(socket),
            ..SendOptions::default()
        };
        shared.post_package(&mut package, vec![sn], options, Some(self.id));
    }

    fn send_syn_ack_ack(&self, shared: &mut Shared) {
        if let Some(route) = &self.route {
            let mut package = route.new_package(CommandType::SynAckAck);
            package.header.seq = self.local_isn + 1;
            package.header.ack_seq = self.remote_isn + 1;
            package.header.window_size = advertised_window(shared);
            shared.post_package(&mut package, vec![route.endpoint], route.send_options(), Some(self.id));
        }
    }

    /// a syn or calledReq for this connection arrived again
    pub fn on_handshake_repeat(&mut self, shared: &mut Shared, request: &Package, from: Endpoint, socket: SocketId) {
        trace!("connection {:?}: repeated {:?}", self.id, request.cmd_type());
        if request.cmd_type() == CommandType::CalledReq {
            self.send_called_resp(shared, request, from, socket);
        }

        if self.state == ConnectionState::WaitAckAck {
            self.add_request_candidates(request, from);
            self.send_handshake(shared);
        }
        else if self.state.has_transfer() {
            let mut package = self.handshake_package(shared, CommandType::SynAck);
            let options = SendOptions {
                preferred_socket: Some(socket),
                ..SendOptions::default()
            };
            shared.post_package(&mut package, vec![from], options, Some(self.id));
        }
    }

    /// a rendezvous peer answered our call with the endpoints it knows for the remote peer
    pub fn on_call_resp(&mut self, shared: &mut Shared, package: &Package) {
        if self.state != ConnectionState::WaitAck {
            return;
        }
        let Some(hole_punch) = self.hole_punch.as_mut() else {
            return;
        };
        if hole_punch.on_call_resp(package.body.sn_peerid.as_deref(), &package.body.endpoints) {
            self.send_handshake(shared);
        }
    }

    pub fn on_peer_found(&mut self, shared: &mut Shared, peer: Option<PeerInfo>) {
        if self.state != ConnectionState::WaitAck {
            return;
        }
        let (Some(hole_punch), Some(peer)) = (self.hole_punch.as_mut(), peer) else {
            return;
        };

        let mut added = false;
        for endpoint in peer.endpoints {
            added |= hole_punch.add_endpoint(endpoint);
        }
        if added {
            self.send_handshake(shared);
        }
    }

    pub fn on_sn_found(&mut self, shared: &mut Shared, found: BdtResult<Vec<PeerInfo>>, now: Instant) {
        if self.state != ConnectionState::WaitAck {
            return;
        }
        let Some(hole_punch) = self.hole_punch.as_mut() else {
            return;
        };
        match found {
            Ok(sns) => hole_punch.on_sn_found(sns, &shared.local_peerid, now),
            Err(e) => debug!("connection {:?}: SN search failed: {}", self.id, e),
        }
        self.schedule_next_call(shared);
    }

    pub fn on_dynamic_socket(&mut self, shared: &mut Shared, socket: Box<dyn DynamicSocket>) {
        match self.hole_punch.as_mut() {
            Some(hole_punch) if self.state.is_connecting() => {
                hole_punch.set_dynamic_socket(socket);
                self.send_handshake(shared);
            }
            _ => trace!("connection {:?}: attempt is over, dropping dynamic socket {:?}", self.id, socket.id()),
        }
    }

    fn schedule_next_call(&mut self, shared: &Shared) {
        let Some(at) = self.hole_punch.as_ref().and_then(|h| h.next_call_time()) else {
            return;
        };
        self.schedule_no_later(shared, ConnTimer::Call, at);
    }

    fn send_due_calls(&mut self, shared: &mut Shared, now: Instant) {
        if self.state != ConnectionState::WaitAck {
            return;
        }
        let Some(hole_punch) = self.hole_punch.as_mut() else {
            return;
        };

        for call in hole_punch.due_calls(now) {
            debug!("connection {:?}: calling through {}", self.id, call.sn_peerid);
            let mut package = self.handshake_package(shared, CommandType::CallReq);
            package.body.sn_peerid = Some(call.sn_peerid);
            let options = SendOptions {
                ignore_route_cache: true,
                ..SendOptions::default()
            };
            shared.post_package(&mut package, call.endpoints, options, Some(self.id));
        }
        self.schedule_next_call(shared);
    }

    fn spawn_find_peer(&mut self, shared: &Shared) {
        let (Some(remote), Some(hole_punch)) = (&self.remote, self.hole_punch.as_mut()) else {
            return;
        };
        let peer_finder = shared.peer_finder.clone();
        let stack = shared.self_ref.clone();
        let peerid = remote.peerid.clone();
        let id = self.id;

        hole_punch.add_task(tokio::spawn(async move {
            let peer = peer_finder.find_peer(&peerid).await;
            if let Some(stack) = stack.upgrade() {
                stack.lock().await
                    .on_peer_found(id, peer).await;
            }
        }));
    }

    /// returns the delay before the next search
    fn spawn_find_sn(&mut self, shared: &Shared) -> Option<std::time::Duration> {
        let (Some(remote), Some(hole_punch)) = (&self.remote, self.hole_punch.as_mut()) else {
            return None;
        };
        let (from_cache, next_search) = hole_punch.start_sn_search();
        let peer_finder = shared.peer_finder.clone();
        let stack = shared.self_ref.clone();
        let peerid = remote.peerid.clone();
        let id = self.id;

        hole_punch.add_task(tokio::spawn(async move {
            let found = peer_finder.find_sn(&peerid, from_cache).await;
            if let Some(stack) = stack.upgrade() {
                stack.lock().await
                    .on_sn_found(id, found).await;
            }
        }));
        Some(next_search)
    }

    fn spawn_create_dynamic_socket(&mut self, shared: &Shared) {
        if self.state != ConnectionState::WaitAck {
            return;
        }
        let Some(hole_punch) = self.hole_punch.as_mut() else {
            return;
        };
        let family = hole_punch.candidates().first()
            .map(|e| e.family())
            .unwrap_or(Family::V4);
        let transport = shared.transport.clone();
        let stack = shared.self_ref.clone();
        let id = self.id;

        debug!("connection {:?}: opening dynamic socket", self.id);
        hole_punch.add_task(tokio::spawn(async move {
            match transport.create_dynamic_socket(family).await {
                Ok(socket) => {
                    if let Some(stack) = stack.upgrade() {
                        stack.lock().await
                            .on_dynamic_socket(id, socket).await;
                    }
                }
                Err(e) => debug!("connection {:?}: no dynamic socket: {}", id, e),
            }
        }));
    }

    fn establish(&mut self, shared: &mut Shared, endpoint: Endpoint, socket: Option<SocketId>, now: Instant) {
        for kind in [ConnTimer::Syn, ConnTimer::SnSearch, ConnTimer::Call, ConnTimer::DynamicSocket, ConnTimer::ConnectTimeout] {
            self.timers.cancel(kind);
        }
        if let Some(hole_punch) = self.hole_punch.take() {
            self.known_endpoints = hole_punch.candidates().to_vec();
        }
        if !self.known_endpoints.contains(&endpoint) {
            self.known_endpoints.push(endpoint);
        }

        let Some(remote) = &self.remote else {
            error!("connection {:?}: established without remote peer", self.id);
            return;
        };
        self.route = Some(Route {
            local_vport: self.local_vport.unwrap_or_default(),
            local_hash: shared.local_hash,
            remote_vport: remote.vport,
            remote_hash: remote.hash,
            remote_session: remote.session,
            endpoint,
            socket,
        });

        let next_seq = self.local_isn + 1;
        let next_remote_seq = self.remote_isn + 1;
        self.transfer = Some(match endpoint.protocol {
            Protocol::Tcp => Box::new(TcpTransfer::new(shared.config.tcp.clone(), next_seq, next_remote_seq)),
            Protocol::Udp => Box::new(UdpTransfer::new(shared.config.udp.clone(), next_seq, next_remote_seq, self.remote_window)),
        });

        info!("connection {:?}: established with {} via {}", self.id, remote.peerid, endpoint);
        self.set_state(ConnectionState::Establish);

        let heartbeat = HeartbeatTracker::new(shared.config.connection.clone(), now);
        self.schedule(shared, ConnTimer::Heartbeat, heartbeat.first_check());
        self.heartbeat = Some(heartbeat);

        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
        if self.acceptor.is_some() {
            shared.notices.push(Notice::Established(self.id));
        }
    }

    //------------------------------ established

    /// a package routed to this connection by session id
    pub fn on_package(&mut self, shared: &mut Shared, package: &Package, from: Endpoint, socket: SocketId, now: Instant) {
        let handshake_acked = package.header.ack_seq == self.local_isn + 1;

        match (self.state, package.cmd_type()) {
            (ConnectionState::WaitAck, CommandType::SynAck) => self.on_syn_ack(shared, package, from, socket, now),
            (ConnectionState::WaitAckAck, CommandType::SynAckAck) if handshake_acked => {
                self.establish(shared, from, Some(socket), now);
            }
            (ConnectionState::WaitAckAck, CommandType::Data | CommandType::Fin) if handshake_acked => {
                // the synAckAck was lost, but the peer's first package confirms the handshake
                self.establish(shared, from, Some(socket), now);
                self.on_established_package(shared, package, now);
            }
            (state, _) if state.has_transfer() => self.on_established_package(shared, package, now),
            (state, cmd_type) => trace!("connection {:?}: ignoring {:?} in state {}", self.id, cmd_type, state),
        }
    }

    fn on_syn_ack(&mut self, shared: &mut Shared, package: &Package, from: Endpoint, socket: SocketId, now: Instant) {
        if package.header.ack_seq != self.local_isn + 1 {
            debug!("connection {:?}: synAck acknowledges {:?}, expected {:?}", self.id, package.header.ack_seq, self.local_isn + 1);
            return;
        }
        let (Some(remote), Some(remote_session)) = (self.remote.as_mut(), package.body.session_id) else {
            debug!("connection {:?}: synAck without session id", self.id);
            return;
        };

        remote.session = remote_session;
        self.remote_isn = package.header.seq;
        self.remote_window = package.header.window_size;
        self.establish(shared, from, Some(socket), now);
        self.send_syn_ack_ack(shared);
    }

    fn on_established_package(&mut self, shared: &mut Shared, package: &Package, now: Instant) {
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.on_recv(now);
        }

        match package.cmd_type() {
            CommandType::Data | CommandType::Fin => {
                self.with_transfer(shared, now, |transfer, host| transfer.on_package(host, package, now));
            }
            CommandType::Heartbeat => {
                if let Some(route) = &self.route {
                    let mut resp = route.new_package(CommandType::HeartbeatResp);
                    shared.post_package(&mut resp, vec![route.endpoint], route.send_options(), Some(self.id));
                }
            }
            CommandType::HeartbeatResp => {}
            CommandType::SynAck if self.acceptor.is_none() && package.header.seq == self.remote_isn => {
                trace!("connection {:?}: synAck repeated, re-sending synAckAck", self.id);
                self.send_syn_ack_ack(shared);
            }
            other => trace!("connection {:?}: ignoring {:?} in state {}", self.id, other, self.state),
        }
    }

    fn on_heartbeat_timer(&mut self, shared: &mut Shared, now: Instant) {
        let Some(heartbeat) = self.heartbeat.as_mut() else {
            return;
        };

        match heartbeat.on_timer(now) {
            HeartbeatAction::Wait(at) => self.schedule(shared, ConnTimer::Heartbeat, at),
            HeartbeatAction::Probe { all_endpoints, next } => {
                if let Some(route) = &self.route {
                    let mut package = route.new_package(CommandType::Heartbeat);
                    if all_endpoints {
                        let options = SendOptions {
                            ignore_route_cache: true,
                            ..SendOptions::default()
                        };
                        shared.post_package(&mut package, self.known_endpoints.clone(), options, Some(self.id));
                    }
                    else {
                        shared.post_package(&mut package, vec![route.endpoint], route.send_options(), Some(self.id));
                    }
                }
                self.schedule(shared, ConnTimer::Heartbeat, next);
            }
            HeartbeatAction::Break => self.on_break(shared),
        }
    }

    pub fn on_stream_busy(&mut self) {
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.on_stream_busy();
        }
    }

    pub fn on_stream_writable(&mut self, shared: &mut Shared, now: Instant) {
        self.with_transfer(shared, now, |transfer, host| transfer.on_stream_writable(host, now));
    }

    /// Runs an operation on the transfer, then handles the events it emitted and reschedules its
    ///  timer. Returns `None` if there is no transfer.
    fn with_transfer<R>(&mut self, shared: &mut Shared, now: Instant, f: impl FnOnce(&mut dyn Transfer, &mut dyn TransferHost) -> R) -> Option<R> {
        let (Some(transfer), Some(route)) = (self.transfer.as_mut(), self.route.as_ref()) else {
            return None;
        };

        let mut host = RouteHost {
            shared,
            route,
            conn: self.id,
            events: Vec::new(),
        };
        let result = f(&mut **transfer, &mut host);
        let events = host.events;

        for event in events {
            self.on_transfer_event(shared, event, now);
        }
        self.reschedule_transfer_timer(shared);
        Some(result)
    }

    fn on_transfer_event(&mut self, shared: &mut Shared, event: TransferEvent, now: Instant) {
        use ConnectionState::*;

        match event {
            TransferEvent::Data(data) => self.emit(ConnectionEvent::Data(data)),
            TransferEvent::Drain => self.emit(ConnectionEvent::Drain),
            TransferEvent::EndOfStream => {
                self.emit(ConnectionEvent::EndOfStream);
                match self.state {
                    Establish => {
                        self.set_state(CloseWait);
                        if !self.allow_half_open {
                            debug!("connection {:?}: peer closed, half open connections are not allowed", self.id);
                            self.close(shared, false, None, now);
                        }
                    }
                    FinWait1 => self.set_state(Closing),
                    FinWait2 => self.enter_time_wait(shared, now),
                    _ => {}
                }
            }
            TransferEvent::CloseAcked => match self.state {
                FinWait1 => self.set_state(FinWait2),
                Closing => self.enter_time_wait(shared, now),
                LastAck => self.to_closed(shared, None),
                _ => {}
            },
        }
    }

    fn enter_time_wait(&mut self, shared: &Shared, now: Instant) {
        self.set_state(ConnectionState::TimeWait);
        self.timers.cancel(ConnTimer::Heartbeat);
        self.schedule(shared, ConnTimer::TimeWait, now + shared.config.connection.msl * 2);
    }

    fn reschedule_transfer_timer(&mut self, shared: &Shared) {
        let next = self.transfer.as_ref()
            .and_then(|t| t.next_deadline());
        match next {
            Some(at) if self.timers.deadline(ConnTimer::Transfer) != Some(at) => self.schedule(shared, ConnTimer::Transfer, at),
            Some(_) => {}
            None => self.timers.cancel(ConnTimer::Transfer),
        }
    }
}

async fn fire_timer(stack: Weak<Mutex<StackInner>>, id: ConnId, kind: ConnTimer, token: u64) {
    if let Some(stack) = stack.upgrade() {
        stack.lock().await
            .on_connection_timer(id, kind, token).await;
    }
}

/// the receive window advertised during the handshake, in KiB
fn advertised_window(shared: &Shared) -> u16 {
    (shared.config.udp.recv_window / 1024).min(u16::MAX as u32) as u16
}
