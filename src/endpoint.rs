use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::BdtError;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Ord, PartialOrd)]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum Family {
    V4,
    V6,
}

/// A network endpoint as seen by the transport layer. The canonical string form is
///  `<family>@<address>@<port>@<protocol>`, e.g. `4@10.0.0.1@5000@u`. Since address and port are
///  held as a parsed [SocketAddr], equality and hashing agree with the canonical string form.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, protocol: Protocol) -> Endpoint {
        Endpoint { addr, protocol }
    }

    pub fn udp(addr: SocketAddr) -> Endpoint {
        Endpoint::new(addr, Protocol::Udp)
    }

    pub fn tcp(addr: SocketAddr) -> Endpoint {
        Endpoint::new(addr, Protocol::Tcp)
    }

    pub fn family(&self) -> Family {
        if self.addr.is_ipv4() { Family::V4 } else { Family::V6 }
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == Protocol::Udp
    }

    pub fn with_port(&self, port: u16) -> Endpoint {
        Endpoint {
            addr: SocketAddr::new(self.addr.ip(), port),
            protocol: self.protocol,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let family = match self.family() {
            Family::V4 => '4',
            Family::V6 => '6',
        };
        let protocol = match self.protocol {
            Protocol::Udp => 'u',
            Protocol::Tcp => 't',
        };
        write!(f, "{}@{}@{}@{}", family, self.addr.ip(), self.addr.port(), protocol)
    }
}
impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl FromStr for Endpoint {
    type Err = BdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('@');
        let (Some(family), Some(ip), Some(port), Some(protocol), None) =
            (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(BdtError::InvalidArgs);
        };

        let ip = IpAddr::from_str(ip).map_err(|_| BdtError::InvalidArgs)?;
        match (family, &ip) {
            ("4", IpAddr::V4(_)) | ("6", IpAddr::V6(_)) => {}
            _ => return Err(BdtError::InvalidArgs),
        }
        let port = u16::from_str(port).map_err(|_| BdtError::InvalidArgs)?;
        let protocol = match protocol {
            "u" => Protocol::Udp,
            "t" => Protocol::Tcp,
            _ => return Err(BdtError::InvalidArgs),
        };

        Ok(Endpoint::new(SocketAddr::new(ip, port), protocol))
    }
}
