//! BDT: reliable, ordered byte streams between peers identified by peer id rather than by
//!  address. Connections run over UDP with their own retransmission and congestion control, or
//!  over an existing TCP stream. Peers behind NATs are reached by hole punching with the help of
//!  rendezvous peers (SNs), which also relay the handshake.
//!
//! The [Stack](stack::Stack) owns all connections and acceptors of the local peer. Sockets,
//!  peer lookup and SN discovery are provided by the application through the traits in
//!  [collaborators].

pub mod acceptor;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod package;
pub mod peer;
pub mod send_buffer;
pub mod sequence;
pub mod stack;
pub mod transfer;
pub mod util;

#[cfg(test)] mod test_util;

pub use acceptor::{Acceptor, AcceptorOptions, AcceptorState};
pub use config::BdtConfig;
pub use connection::{Connection, ConnectionEvent, RemoteInfo};
pub use connection::state::ConnectionState;
pub use endpoint::Endpoint;
pub use error::{BdtError, BdtResult};
pub use stack::{Stack, StackState};
