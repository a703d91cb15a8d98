//! Connections between a local and a remote virtual port. A [Connection] is a handle: the state
//!  lives in the stack, and every operation locks the stack, runs the connection's logic and
//!  sends whatever packages that produced before returning.

pub(crate) mod core;
pub mod heartbeat;
pub mod hole_punch;
pub mod state;

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::trace;

use crate::connection::state::ConnectionState;
use crate::error::{BdtError, BdtResult};
use crate::stack::StackInner;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnId(pub(crate) u64);

impl Debug for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    Data(Bytes),
    /// the peer closed its sending side; no more data will arrive
    EndOfStream,
    /// the send buffer has room again after a send was (partially) rejected
    Drain,
    /// the connection failed; always followed by [ConnectionEvent::Closed]
    Error(BdtError),
    Closed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteInfo {
    pub peerid: String,
    pub vport: u16,
}

pub struct Connection {
    id: ConnId,
    stack: Arc<Mutex<StackInner>>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Connection {
    pub(crate) fn new(id: ConnId, stack: Arc<Mutex<StackInner>>, events: mpsc::UnboundedReceiver<ConnectionEvent>) -> Connection {
        Connection {
            id,
            stack,
            events,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Binds the connection to a local vport, or to a free one if `vport` is `None`. Connecting an
    ///  unbound connection binds it implicitly.
    pub async fn bind(&self, vport: Option<u16>) -> BdtResult<u16> {
        self.stack.lock().await
            .bind_connection(self.id, vport)
    }

    /// Connects to a vport of a remote peer, returning once the handshake completed
    pub async fn connect(&self, peerid: &str, vport: u16) -> BdtResult<()> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut stack = self.stack.lock().await;
            stack.connect(self.id, peerid, vport, sender)?;
            stack.flush().await;
        }
        receiver.await
            .unwrap_or(Err(BdtError::InvalidState))
    }

    /// Queues data for sending, returning the number of bytes accepted. If the send buffer is
    ///  (nearly) full, a [ConnectionEvent::Drain] signals when there is room again.
    pub async fn send(&self, data: &[u8]) -> BdtResult<usize> {
        let mut stack = self.stack.lock().await;
        let result = stack.send(self.id, data);
        stack.flush().await;
        result
    }

    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Closes the connection, returning once it reached `Closed`. A graceful close delivers all
    ///  buffered data first and waits for the peer to acknowledge it.
    pub async fn close(&self, force: bool) {
        let (sender, receiver) = oneshot::channel();
        {
            let mut stack = self.stack.lock().await;
            stack.close_connection(self.id, force, sender);
            stack.flush().await;
        }
        let _ = receiver.await;
    }

    pub async fn state(&self) -> ConnectionState {
        self.stack.lock().await
            .connection_state(self.id)
    }

    pub async fn remote(&self) -> Option<RemoteInfo> {
        self.stack.lock().await
            .connection_remote(self.id)
    }

    pub async fn local_vport(&self) -> Option<u16> {
        self.stack.lock().await
            .connection_vport(self.id)
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{:?}}}", self.id)
    }
}

/// A dropped handle closes its connection gracefully
impl Drop for Connection {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            trace!("no runtime, not closing {:?}", self.id);
            return;
        };

        let stack = self.stack.clone();
        let id = self.id;
        runtime.spawn(async move {
            let mut stack = stack.lock().await;
            stack.on_handle_dropped(id);
            stack.flush().await;
        });
    }
}
