use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use crate::connection::{ConnId, Connection};
use crate::error::{BdtError, BdtResult};
use crate::stack::StackInner;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct AcceptorId(pub(crate) u64);

impl Debug for AcceptorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "A{}", self.0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct AcceptorOptions {
    /// `None` for a free vport
    pub vport: Option<u16>,
    /// Keep accepted connections open for sending after the peer closed its side. Otherwise they
    ///  close themselves when the peer's fin arrives.
    pub allow_half_open: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcceptorState {
    Init,
    Listening,
    /// waiting for the inbound connections to close
    Closing,
    Closed,
}

pub(crate) struct AcceptorCore {
    pub id: AcceptorId,
    pub vport: u16,
    pub state: AcceptorState,
    pub allow_half_open: bool,

    accepted: Option<mpsc::UnboundedSender<Connection>>,
    /// inbound connections by the remote peer id, then the session id the remote allocated
    children: FxHashMap<String, FxHashMap<u32, ConnId>>,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl AcceptorCore {
    pub fn new(id: AcceptorId, vport: u16, allow_half_open: bool, accepted: mpsc::UnboundedSender<Connection>) -> AcceptorCore {
        AcceptorCore {
            id,
            vport,
            state: AcceptorState::Init,
            allow_half_open,
            accepted: Some(accepted),
            children: FxHashMap::default(),
            close_waiters: Vec::new(),
        }
    }

    pub fn listen(&mut self) -> BdtResult<()> {
        if self.state != AcceptorState::Init {
            return Err(BdtError::InvalidState);
        }
        info!("acceptor {:?}: listening on vport {}", self.id, self.vport);
        self.state = AcceptorState::Listening;
        Ok(())
    }

    pub fn child(&self, remote_peerid: &str, remote_session: u32) -> Option<ConnId> {
        self.children.get(remote_peerid)
            .and_then(|sessions| sessions.get(&remote_session))
            .copied()
    }

    pub fn add_child(&mut self, remote_peerid: String, remote_session: u32, id: ConnId) {
        self.children.entry(remote_peerid)
            .or_default()
            .insert(remote_session, id);
    }

    pub fn remove_child(&mut self, id: ConnId) {
        self.children.retain(|_, sessions| {
            sessions.retain(|_, child| *child != id);
            !sessions.is_empty()
        });
    }

    /// Hands an established inbound connection to the application. Returns the connection if
    ///  nobody is accepting any more.
    pub fn deliver(&self, connection: Connection) -> Result<(), Connection> {
        match &self.accepted {
            Some(accepted) => accepted.send(connection)
                .map_err(|e| e.0),
            None => Err(connection),
        }
    }

    /// Starts closing, returning the children that need to be closed
    pub fn begin_close(&mut self, waiter: Option<oneshot::Sender<()>>) -> Vec<ConnId> {
        if let Some(waiter) = waiter {
            if self.state == AcceptorState::Closed {
                let _ = waiter.send(());
                return Vec::new();
            }
            self.close_waiters.push(waiter);
        }
        if matches!(self.state, AcceptorState::Closing | AcceptorState::Closed) {
            return Vec::new();
        }

        let children = self.children.values()
            .flat_map(|sessions| sessions.values().copied())
            .collect::<Vec<_>>();
        debug!("acceptor {:?}: closing with {} connections", self.id, children.len());
        self.state = AcceptorState::Closing;
        self.accepted = None;
        children
    }

    /// Returns `true` if the acceptor just reached `Closed` because its last child is gone
    pub fn try_complete_close(&mut self) -> bool {
        if self.state != AcceptorState::Closing || !self.children.is_empty() {
            return false;
        }
        info!("acceptor {:?}: closed", self.id);
        self.state = AcceptorState::Closed;
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        true
    }
}

/// Handle for accepting inbound connections on a virtual port
pub struct Acceptor {
    id: AcceptorId,
    vport: u16,
    stack: Arc<Mutex<StackInner>>,
    incoming: mpsc::UnboundedReceiver<Connection>,
}

impl Acceptor {
    pub(crate) fn new(id: AcceptorId, vport: u16, stack: Arc<Mutex<StackInner>>, incoming: mpsc::UnboundedReceiver<Connection>) -> Acceptor {
        Acceptor {
            id,
            vport,
            stack,
            incoming,
        }
    }

    pub fn vport(&self) -> u16 {
        self.vport
    }

    pub async fn listen(&self) -> BdtResult<()> {
        self.stack.lock().await
            .listen(self.id)
    }

    /// the next established inbound connection, or `None` once the acceptor is closed
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }

    /// closes the acceptor and all its connections, returning when the last of them is closed
    pub async fn close(&self) {
        let (sender, receiver) = oneshot::channel();
        {
            let mut stack = self.stack.lock().await;
            stack.close_acceptor(self.id, Some(sender));
            stack.flush().await;
        }
        let _ = receiver.await;
    }

    pub async fn state(&self) -> AcceptorState {
        self.stack.lock().await
            .acceptor_state(self.id)
    }
}
