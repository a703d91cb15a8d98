use std::fmt::{Display, Formatter};

/// Connection lifecycle, modeled on TCP. The active closer goes
///  `Establish -> FinWait1 -> FinWait2 -> TimeWait -> Closed`, the passive one
///  `Establish -> CloseWait -> LastAck -> Closed`, and `Closing` covers both sides closing at the
///  same time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Init,
    /// outbound: syn sent, waiting for the synAck
    WaitAck,
    /// inbound: synAck sent, waiting for the synAckAck
    WaitAckAck,
    Establish,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    /// abnormal termination, immediately followed by `Closed`
    Break,
    Closed,
}

impl ConnectionState {
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::WaitAck | ConnectionState::WaitAckAck)
    }

    /// states in which a transfer exists
    pub fn has_transfer(&self) -> bool {
        use ConnectionState::*;
        matches!(self, Establish | FinWait1 | FinWait2 | Closing | TimeWait | CloseWait | LastAck)
    }

    /// states in which the application may still send data
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Establish | ConnectionState::CloseWait)
    }

    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Break, _) => false,
            (_, Break) => true,

            (Init, WaitAck) | (Init, WaitAckAck) => true,
            (WaitAck, Establish) | (WaitAckAck, Establish) => true,
            (Establish, FinWait1) | (Establish, CloseWait) => true,
            (FinWait1, FinWait2) | (FinWait1, Closing) => true,
            (FinWait2, TimeWait) | (Closing, TimeWait) => true,
            (CloseWait, LastAck) => true,
            _ => false,
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
